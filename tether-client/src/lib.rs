//! Peer side of the tether relay protocol.
//!
//! A [`ReconnectSupervisor`] produces a [`Connection`] to the first relay
//! endpoint that answers. The caller reads envelopes from it, feeds them to
//! a [`SignalingClient`] and passes paired payloads to a [`MessageRouter`].

pub mod connection;
pub mod router;
pub mod signaling;
pub mod supervisor;
pub mod transport;

pub use connection::{Connection, ConnectionStatus};
pub use router::{DispatchOutcome, HandlerError, MessageRouter};
pub use signaling::{SignalError, SignalEvent, SignalingClient};
pub use supervisor::{BackoffPolicy, ConnectFailed, ReconnectSupervisor, SupervisorState};
pub use transport::{TlsPolicy, Transport, TransportConfig, TransportError};
