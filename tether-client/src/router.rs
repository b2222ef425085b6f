//! Typed dispatch of application messages.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use tether_proto::{ApplicationMessage, Envelope, EnvelopeType, MessageKind, ParseError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type Handler = Box<dyn Fn(&ApplicationMessage) -> Result<(), HandlerError> + Send + Sync>;

/// One handler per message kind plus an optional catch-all listener.
///
/// Handler failures, whether returned errors or panics, are logged and never
/// reach the caller, so a bad handler cannot take down the receive loop.
#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<MessageKind, Handler>,
    any: Option<Handler>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// A kind-specific handler was found.
    pub handled: bool,
    /// Handlers that failed (error or panic).
    pub failures: usize,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any earlier one.
    pub fn register_handler<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: Fn(&ApplicationMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if self.handlers.insert(kind, Box::new(handler)).is_some() {
            log::debug!("replaced handler for {:?}", kind);
        }
    }

    /// Listener invoked for every dispatched message, recognized or not.
    pub fn on_any<F>(&mut self, listener: F)
    where
        F: Fn(&ApplicationMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.any = Some(Box::new(listener));
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn dispatch(&self, message: &ApplicationMessage) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let kind = message.kind();

        if kind != MessageKind::Unrecognized {
            if let Some(handler) = self.handlers.get(&kind) {
                outcome.handled = true;
                if !invoke(handler, message, kind) {
                    outcome.failures += 1;
                }
            }
        }
        if let Some(listener) = &self.any {
            if !invoke(listener, message, kind) {
                outcome.failures += 1;
            }
        }
        outcome
    }

    /// Decode an application message carried by a paired envelope and
    /// dispatch it. Returns `Ok(None)` for envelope types that never carry
    /// one.
    pub fn dispatch_envelope(
        &self,
        envelope: &Envelope,
    ) -> Result<Option<DispatchOutcome>, ParseError> {
        match envelope.typ {
            EnvelopeType::SessionDescription | EnvelopeType::IceCandidate => {
                let message = ApplicationMessage::decode(&envelope.payload)?;
                Ok(Some(self.dispatch(&message)))
            }
            _ => Ok(None),
        }
    }
}

fn invoke(handler: &Handler, message: &ApplicationMessage, kind: MessageKind) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("{:?} {}", kind, e);
            false
        }
        Err(_) => {
            log::error!("handler for {:?} panicked", kind);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;
    use std::sync::{Arc, Mutex};
    use tether_proto::{MouseMove, ScreenCapture};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl Fn(&ApplicationMessage) -> Result<(), HandlerError> {
        let log = log.clone();
        move |m| {
            log.lock().unwrap().push(format!("{tag}:{:?}", m.kind()));
            Ok(())
        }
    }

    #[test]
    fn routes_to_typed_handler_and_listener() {
        let log = Log::default();
        let mut router = MessageRouter::new();
        router.register_handler(MessageKind::MouseMove, recorder(&log, "move"));
        router.register_handler(MessageKind::ScreenCapture, recorder(&log, "screen"));
        router.on_any(recorder(&log, "any"));

        let outcome = router.dispatch(&MouseMove::new(3, 4).into());
        assert_equal!(outcome, DispatchOutcome { handled: true, failures: 0 });
        assert_equal!(
            *log.lock().unwrap(),
            vec!["move:MouseMove".to_string(), "any:MouseMove".to_string()]
        );
    }

    #[test]
    fn last_registration_wins() {
        let log = Log::default();
        let mut router = MessageRouter::new();
        router.register_handler(MessageKind::MouseMove, recorder(&log, "first"));
        router.register_handler(MessageKind::MouseMove, recorder(&log, "second"));
        router.dispatch(&MouseMove::new(0, 0).into());
        assert_equal!(*log.lock().unwrap(), vec!["second:MouseMove".to_string()]);
    }

    #[test]
    fn unrecognized_only_reaches_listener() {
        let log = Log::default();
        let mut router = MessageRouter::new();
        router.register_handler(MessageKind::Unrecognized, recorder(&log, "typed"));
        router.on_any(recorder(&log, "any"));
        let outcome = router.dispatch(&ApplicationMessage::Unrecognized);
        assert!(!outcome.handled);
        assert_equal!(*log.lock().unwrap(), vec!["any:Unrecognized".to_string()]);
    }

    #[test]
    fn failing_handlers_are_contained() {
        let log = Log::default();
        let mut router = MessageRouter::new();
        router.register_handler(MessageKind::MouseMove, |_| Err(HandlerError::new("nope")));
        router.register_handler(MessageKind::ScreenCapture, |_| panic!("boom"));
        router.on_any(recorder(&log, "any"));

        let outcome = router.dispatch(&MouseMove::new(1, 1).into());
        assert_equal!(outcome.failures, 1);

        let shot = ScreenCapture::new(2, 2, "png", String::new());
        let outcome = router.dispatch(&shot.into());
        assert_equal!(outcome, DispatchOutcome { handled: true, failures: 1 });

        // Both messages still reached the listener.
        assert_equal!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn dispatches_from_envelopes() {
        let log = Log::default();
        let mut router = MessageRouter::new();
        router.on_any(recorder(&log, "any"));

        let payload = ApplicationMessage::from(MouseMove::new(5, 6)).encode().unwrap();
        let env = Envelope::new(EnvelopeType::SessionDescription, "c1", payload);
        assert!(router.dispatch_envelope(&env).unwrap().is_some());

        let unknown = Envelope::new(
            EnvelopeType::IceCandidate,
            "c1",
            r#"{"type":"Hologram","id":"x"}"#.to_string(),
        );
        assert!(router.dispatch_envelope(&unknown).unwrap().is_some());

        let garbage = Envelope::new(EnvelopeType::SessionDescription, "c1", "{oops".to_string());
        assert!(router.dispatch_envelope(&garbage).is_err());

        let connect = Envelope::new(EnvelopeType::Connect, "c1", String::new());
        assert_equal!(router.dispatch_envelope(&connect).unwrap(), None);

        assert_equal!(
            *log.lock().unwrap(),
            vec!["any:MouseMove".to_string(), "any:Unrecognized".to_string()]
        );
    }
}
