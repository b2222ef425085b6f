//! Wire types shared by the tether relay and its peers.
//!
//! Everything on the control channel is a UTF-8 JSON text frame holding an
//! [`Envelope`]. The envelope payload is itself JSON: signaling payloads
//! from [`signal`] for the handshake, or an [`ApplicationMessage`] once two
//! peers are paired.

pub mod envelope;
pub mod message;
pub mod signal;

pub use envelope::{Envelope, EnvelopeType, ParseError};
pub use message::{
    ApplicationMessage, ClipboardUpdate, KeyDown, KeyPress, KeyUp, MessageKind, Modifiers,
    MouseButton, MouseClick, MouseMove, MouseScroll, ScreenCapture,
};
pub use signal::{ConnectReply, ConnectionRequest, DisconnectNotice, TokenRegistration};

/// Prefix marking an auth token as a reference to a web session key.
pub const SESSION_TOKEN_PREFIX: &str = "session:";
