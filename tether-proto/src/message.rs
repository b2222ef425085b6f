use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::ParseError;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifiers {
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub meta: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// One encoded frame of the remote screen. `data` is opaque (base64 of
/// whatever `format` names); nothing in this crate looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenCapture {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub data: String,
}

impl ScreenCapture {
    pub fn new(width: u32, height: u32, format: impl Into<String>, data: String) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            width,
            height,
            format: format.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseMove {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub x: i32,
    pub y: i32,
}

impl MouseMove {
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            x,
            y,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseClick {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub x: i32,
    pub y: i32,
    pub button: MouseButton,
    #[serde(default)]
    pub double_click: bool,
}

impl MouseClick {
    pub fn new(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            x,
            y,
            button,
            double_click: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseScroll {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub x: i32,
    pub y: i32,
    pub delta_x: i32,
    pub delta_y: i32,
}

impl MouseScroll {
    pub fn new(x: i32, y: i32, delta_x: i32, delta_y: i32) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            x,
            y,
            delta_x,
            delta_y,
        }
    }
}

/// A full key stroke carrying the produced text, e.g. from a soft keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPress {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub key: String,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl KeyPress {
    pub fn new(key: impl Into<String>, modifiers: Modifiers) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            key: key.into(),
            modifiers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDown {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub key_code: u32,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl KeyDown {
    pub fn new(key_code: u32, modifiers: Modifiers) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            key_code,
            modifiers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUp {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub key_code: u32,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl KeyUp {
    pub fn new(key_code: u32, modifiers: Modifiers) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            key_code,
            modifiers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardUpdate {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl ClipboardUpdate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Typed messages multiplexed over a paired control channel.
///
/// The `type` field is the wire discriminator. Any discriminator this build
/// does not know decodes to [`ApplicationMessage::Unrecognized`] so newer
/// peers can add message types without breaking older ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ApplicationMessage {
    ScreenCapture(ScreenCapture),
    MouseMove(MouseMove),
    MouseClick(MouseClick),
    MouseScroll(MouseScroll),
    KeyPress(KeyPress),
    KeyDown(KeyDown),
    KeyUp(KeyUp),
    ClipboardUpdate(ClipboardUpdate),
    #[serde(other)]
    Unrecognized,
}

/// Fieldless mirror of [`ApplicationMessage`], used to key handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ScreenCapture,
    MouseMove,
    MouseClick,
    MouseScroll,
    KeyPress,
    KeyDown,
    KeyUp,
    ClipboardUpdate,
    Unrecognized,
}

impl ApplicationMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ApplicationMessage::ScreenCapture(_) => MessageKind::ScreenCapture,
            ApplicationMessage::MouseMove(_) => MessageKind::MouseMove,
            ApplicationMessage::MouseClick(_) => MessageKind::MouseClick,
            ApplicationMessage::MouseScroll(_) => MessageKind::MouseScroll,
            ApplicationMessage::KeyPress(_) => MessageKind::KeyPress,
            ApplicationMessage::KeyDown(_) => MessageKind::KeyDown,
            ApplicationMessage::KeyUp(_) => MessageKind::KeyUp,
            ApplicationMessage::ClipboardUpdate(_) => MessageKind::ClipboardUpdate,
            ApplicationMessage::Unrecognized => MessageKind::Unrecognized,
        }
    }

    /// Unique message id; `None` for the unrecognized sentinel.
    pub fn id(&self) -> Option<&str> {
        match self {
            ApplicationMessage::ScreenCapture(m) => Some(&m.id),
            ApplicationMessage::MouseMove(m) => Some(&m.id),
            ApplicationMessage::MouseClick(m) => Some(&m.id),
            ApplicationMessage::MouseScroll(m) => Some(&m.id),
            ApplicationMessage::KeyPress(m) => Some(&m.id),
            ApplicationMessage::KeyDown(m) => Some(&m.id),
            ApplicationMessage::KeyUp(m) => Some(&m.id),
            ApplicationMessage::ClipboardUpdate(m) => Some(&m.id),
            ApplicationMessage::Unrecognized => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an envelope payload. Unknown discriminators yield
    /// `Ok(Unrecognized)`; input that is not a JSON object with a string
    /// `type`, or a known type with bad fields, yields an error.
    pub fn decode(payload: &str) -> Result<Self, ParseError> {
        serde_json::from_str(payload).map_err(ParseError::malformed)
    }
}

impl From<ScreenCapture> for ApplicationMessage {
    fn from(m: ScreenCapture) -> Self {
        ApplicationMessage::ScreenCapture(m)
    }
}

impl From<MouseMove> for ApplicationMessage {
    fn from(m: MouseMove) -> Self {
        ApplicationMessage::MouseMove(m)
    }
}

impl From<MouseClick> for ApplicationMessage {
    fn from(m: MouseClick) -> Self {
        ApplicationMessage::MouseClick(m)
    }
}

impl From<MouseScroll> for ApplicationMessage {
    fn from(m: MouseScroll) -> Self {
        ApplicationMessage::MouseScroll(m)
    }
}

impl From<KeyPress> for ApplicationMessage {
    fn from(m: KeyPress) -> Self {
        ApplicationMessage::KeyPress(m)
    }
}

impl From<KeyDown> for ApplicationMessage {
    fn from(m: KeyDown) -> Self {
        ApplicationMessage::KeyDown(m)
    }
}

impl From<KeyUp> for ApplicationMessage {
    fn from(m: KeyUp) -> Self {
        ApplicationMessage::KeyUp(m)
    }
}

impl From<ClipboardUpdate> for ApplicationMessage {
    fn from(m: ClipboardUpdate) -> Self {
        ApplicationMessage::ClipboardUpdate(m)
    }
}
