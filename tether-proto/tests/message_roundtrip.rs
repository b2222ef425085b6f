use k9::assert_equal;
use tether_proto::{
    ApplicationMessage, ClipboardUpdate, Envelope, EnvelopeType, KeyDown, KeyPress, KeyUp,
    MessageKind, Modifiers, MouseButton, MouseClick, MouseMove, MouseScroll, ScreenCapture,
};

fn every_message() -> Vec<ApplicationMessage> {
    let mods = Modifiers {
        shift: true,
        ctrl: false,
        alt: true,
        meta: false,
    };
    let mut click = MouseClick::new(10, 20, MouseButton::Right);
    click.double_click = true;
    vec![
        ScreenCapture::new(1920, 1080, "jpeg", "AAECAw==".to_string()).into(),
        MouseMove::new(-5, 700).into(),
        click.into(),
        MouseScroll::new(1, 2, 0, -120).into(),
        KeyPress::new("é", mods).into(),
        KeyDown::new(65, mods).into(),
        KeyUp::new(65, Modifiers::default()).into(),
        ClipboardUpdate::new("copied text\nwith newline").into(),
    ]
}

#[test]
fn test_every_message_roundtrips_through_envelope() {
    for message in every_message() {
        let env = Envelope::new(
            EnvelopeType::SessionDescription,
            "conn-1",
            message.encode().unwrap(),
        );
        let wire = env.encode().unwrap();
        let decoded_env = Envelope::decode(wire.as_bytes()).unwrap();
        let decoded = ApplicationMessage::decode(&decoded_env.payload).unwrap();
        assert_equal!(decoded, message);
    }
}

#[test]
fn test_discriminators_are_distinct() {
    let mut seen = std::collections::HashSet::new();
    for message in every_message() {
        let value: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        let tag = value["type"].as_str().unwrap().to_string();
        assert!(seen.insert(tag.clone()), "duplicate discriminator {tag}");
    }
    assert_equal!(seen.len(), 8);
}

#[test]
fn test_wire_field_names() {
    let message: ApplicationMessage = MouseScroll::new(3, 4, 5, 6).into();
    let value: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
    assert_eq!(value["type"], "MouseScroll");
    assert_eq!(value["deltaX"], 5);
    assert_eq!(value["deltaY"], 6);
    assert!(value["id"].is_string());
    assert!(value["timestamp"].is_string());
}

#[test]
fn test_unknown_discriminator_is_unrecognized() {
    let decoded =
        ApplicationMessage::decode(r#"{"type":"HapticPulse","id":"1","strength":3}"#).unwrap();
    assert_equal!(decoded, ApplicationMessage::Unrecognized);
    assert_equal!(decoded.kind(), MessageKind::Unrecognized);
    assert_equal!(decoded.id(), None);
}

#[test]
fn test_known_discriminator_with_bad_fields_is_an_error() {
    assert!(ApplicationMessage::decode(r#"{"type":"MouseMove","id":"1"}"#).is_err());
    assert!(ApplicationMessage::decode(r#"{"id":"1"}"#).is_err());
    assert!(ApplicationMessage::decode("not json").is_err());
}

#[test]
fn test_ids_are_unique() {
    let a = MouseMove::new(0, 0);
    let b = MouseMove::new(0, 0);
    assert!(a.id != b.id);
}
