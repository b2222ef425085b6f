use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use tether_proto::Envelope;

use crate::transport::{Frame, Transport, TransportConfig, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Initializing,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed
        )
    }
}

/// A peer's control channel to one relay endpoint.
///
/// A `Connection` is used for exactly one connect attempt. Once it has
/// failed or been disposed it stays that way; reconnecting means building a
/// new one.
#[derive(Debug)]
pub struct Connection {
    peer_id: String,
    endpoint: String,
    transport: Option<Transport>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    last_error: Option<TransportError>,
}

impl Connection {
    /// `endpoint` is the relay's peer socket base, e.g.
    /// `wss://relay.example/ws/peer`; the peer id is appended as the last
    /// path segment.
    pub fn new(peer_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Initializing);
        Self {
            peer_id: peer_id.into(),
            endpoint: endpoint.into(),
            transport: None,
            status: Arc::new(status),
            last_error: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Subscribe to status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub fn peer_url(&self) -> Result<Url, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidUri(self.endpoint.clone(), reason.to_string());
        if self.peer_id.trim().is_empty() {
            return Err(invalid("empty peer id"));
        }
        let mut url = Url::parse(&self.endpoint).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("endpoint cannot carry a path"))?
            .pop_if_empty()
            .push(&self.peer_id);
        Ok(url)
    }

    pub async fn connect(
        &mut self,
        config: &TransportConfig,
        shutdown: &CancellationToken,
    ) -> Result<(), TransportError> {
        if self.status() != ConnectionStatus::Initializing {
            return Err(TransportError::Closed);
        }

        let url = match self.peer_url() {
            Ok(url) => url,
            Err(e) => return Err(self.fail(e)),
        };

        let status = self.status.clone();
        let on_closed = move |err: Option<&TransportError>| {
            status.send_modify(|s| {
                *s = if err.is_some() {
                    ConnectionStatus::Failed
                } else {
                    ConnectionStatus::Disconnected
                };
            });
        };

        match Transport::connect(url.as_str(), config, shutdown, on_closed).await {
            Ok(transport) => {
                self.transport = Some(transport);
                // The socket may already have dropped; never overwrite that.
                self.status.send_if_modified(|s| {
                    if *s == ConnectionStatus::Initializing {
                        *s = ConnectionStatus::Connected;
                        true
                    } else {
                        false
                    }
                });
                log::info!("peer {} connected via {}", self.peer_id, self.endpoint);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        self.status.send_replace(ConnectionStatus::Failed);
        self.last_error = Some(err.clone());
        err
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let transport = self.transport.as_ref().ok_or(TransportError::NotConnected)?;
        if self.status() != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let text = envelope
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        transport.send_text(text).await
    }

    /// Next well-formed envelope, in wire order. Malformed frames are
    /// logged and skipped. `None` once the connection is closed.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        let transport = self.transport.as_mut()?;
        loop {
            let decoded = match transport.recv().await? {
                Ok(Frame::Text(text)) => Envelope::decode_str(&text),
                Ok(Frame::Binary(bytes)) => Envelope::decode(&bytes),
                Err(e) => {
                    self.last_error = Some(e);
                    return None;
                }
            };
            match decoded {
                Ok(envelope) => return Some(envelope),
                Err(e) => log::warn!("dropping malformed frame from relay: {}", e),
            }
        }
    }

    /// Close the socket and release its tasks. Safe to call in any state.
    pub async fn dispose(mut self) {
        self.status.send_if_modified(|s| {
            if *s == ConnectionStatus::Connected {
                *s = ConnectionStatus::Disconnecting;
                true
            } else {
                false
            }
        });
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.status.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = ConnectionStatus::Disconnected;
                true
            }
        });
        log::debug!("connection for {} disposed", self.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn peer_url_appends_encoded_id() {
        let conn = Connection::new("desk top", "ws://127.0.0.1:9090/ws/peer/");
        assert_equal!(
            conn.peer_url().unwrap().as_str(),
            "ws://127.0.0.1:9090/ws/peer/desk%20top"
        );
        let conn = Connection::new("srv1", "wss://relay.example/ws/peer");
        assert_equal!(
            conn.peer_url().unwrap().as_str(),
            "wss://relay.example/ws/peer/srv1"
        );
        assert!(Connection::new("", "ws://x/ws/peer").peer_url().is_err());
    }

    #[tokio::test]
    async fn failed_connect_is_terminal() {
        let mut conn = Connection::new("p", "ws://127.0.0.1:1/ws/peer");
        let shutdown = CancellationToken::new();
        assert_equal!(conn.status(), ConnectionStatus::Initializing);
        assert!(conn
            .connect(&TransportConfig::default(), &shutdown)
            .await
            .is_err());
        assert_equal!(conn.status(), ConnectionStatus::Failed);
        assert!(conn.last_error().is_some());

        // Not reusable.
        assert_equal!(
            conn.connect(&TransportConfig::default(), &shutdown).await,
            Err(TransportError::Closed)
        );
        let status = conn.watch_status();
        conn.dispose().await;
        assert_equal!(*status.borrow(), ConnectionStatus::Failed);
    }

    #[tokio::test]
    async fn send_without_transport_is_not_connected() {
        let conn = Connection::new("p", "ws://127.0.0.1:1/ws/peer");
        let env = Envelope::new(tether_proto::EnvelopeType::Disconnect, "c", String::new());
        assert_equal!(
            conn.send_envelope(&env).await,
            Err(TransportError::NotConnected)
        );
    }
}
