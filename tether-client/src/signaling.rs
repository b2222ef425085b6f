//! Peer-side view of the signaling handshake.
//!
//! `SignalingClient` builds the envelopes a peer sends and interprets the
//! ones it receives, tracking each connection id it takes part in. It does
//! no I/O; callers pass envelopes to and from a [`Connection`].
//!
//! [`Connection`]: crate::connection::Connection

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use tether_proto::{
    ApplicationMessage, ConnectReply, ConnectionRequest, DisconnectNotice, Envelope, EnvelopeType,
    ParseError, TokenRegistration,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("unknown connection id {0}")]
    UnknownConnection(String),
    #[error("connection {0} is not waiting for an answer")]
    NotAwaitingAnswer(String),
    #[error("connection {0} is not paired")]
    NotPaired(String),
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Encode(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPairingState {
    /// We sent `Connect` and wait for a `ConnectResponse`.
    Requesting,
    /// Someone sent us `Connect`; we have not answered yet.
    Incoming,
    Matched,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPairing {
    /// Other side, when known. Token and session requests learn it from the
    /// accepting reply.
    pub partner: Option<String>,
    pub state: PeerPairingState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    IncomingRequest {
        connection_id: String,
        request: ConnectionRequest,
    },
    Accepted {
        connection_id: String,
        peer_id: Option<String>,
    },
    Refused {
        connection_id: String,
        reason: String,
    },
    TokenRegistered {
        accepted: bool,
        reason: Option<String>,
    },
    /// A `SessionDescription` or `IceCandidate` for a pairing we are in;
    /// hand it to the message router.
    Payload(Envelope),
    Closed {
        connection_id: String,
        reason: Option<String>,
    },
    Ignored {
        connection_id: String,
        reason: String,
    },
}

pub struct SignalingClient {
    peer_id: String,
    pairings: HashMap<String, PeerPairing>,
}

impl SignalingClient {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            pairings: HashMap::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn pairing(&self, connection_id: &str) -> Option<&PeerPairing> {
        self.pairings.get(connection_id)
    }

    pub fn active_connections(&self) -> impl Iterator<Item = &str> {
        self.pairings
            .iter()
            .filter(|(_, p)| {
                matches!(
                    p.state,
                    PeerPairingState::Matched | PeerPairingState::Active
                )
            })
            .map(|(id, _)| id.as_str())
    }

    fn open(
        &mut self,
        partner: Option<String>,
        request: &ConnectionRequest,
    ) -> Result<Envelope, SignalError> {
        let connection_id = Uuid::new_v4().to_string();
        let envelope = Envelope::with_payload(EnvelopeType::Connect, connection_id.clone(), request)?;
        self.pairings.insert(
            connection_id,
            PeerPairing {
                partner,
                state: PeerPairingState::Requesting,
            },
        );
        Ok(envelope)
    }

    /// Targeted `Connect` to `target_id`.
    pub fn request(&mut self, target_id: &str, auth_token: &str) -> Result<Envelope, SignalError> {
        let request = ConnectionRequest::new(self.peer_id.clone(), target_id, auth_token);
        self.open(Some(target_id.to_string()), &request)
    }

    /// `Connect` redeeming a web session; the relay picks the target.
    pub fn request_session(&mut self, session_key: &str) -> Result<Envelope, SignalError> {
        let request = ConnectionRequest::for_session(self.peer_id.clone(), session_key);
        self.open(None, &request)
    }

    /// Untargeted `Connect` matched against a peer that registered `token`.
    pub fn request_by_token(&mut self, token: &str) -> Result<Envelope, SignalError> {
        let request = ConnectionRequest::new(self.peer_id.clone(), "", token);
        self.open(None, &request)
    }

    pub fn register_token(&self, auth_token: &str) -> Result<Envelope, SignalError> {
        Ok(Envelope::with_payload(
            EnvelopeType::RegisterToken,
            Uuid::new_v4().to_string(),
            &TokenRegistration {
                auth_token: auth_token.to_string(),
            },
        )?)
    }

    pub fn accept(&mut self, connection_id: &str) -> Result<Envelope, SignalError> {
        let pairing = self.incoming(connection_id)?;
        pairing.state = PeerPairingState::Matched;
        Ok(Envelope::with_payload(
            EnvelopeType::ConnectResponse,
            connection_id,
            &ConnectReply::accepted(self.peer_id.clone()),
        )?)
    }

    /// Refuse an incoming request. The refusal is followed by a
    /// `Disconnect` so the relay releases the connection id.
    pub fn reject(&mut self, connection_id: &str, reason: &str) -> Result<Vec<Envelope>, SignalError> {
        self.incoming(connection_id)?;
        self.pairings.remove(connection_id);
        Ok(vec![
            Envelope::with_payload(
                EnvelopeType::ConnectResponse,
                connection_id,
                &ConnectReply::refused(reason),
            )?,
            Envelope::with_payload(
                EnvelopeType::Disconnect,
                connection_id,
                &DisconnectNotice::new(reason),
            )?,
        ])
    }

    fn incoming(&mut self, connection_id: &str) -> Result<&mut PeerPairing, SignalError> {
        match self.pairings.get_mut(connection_id) {
            Some(p) if p.state == PeerPairingState::Incoming => Ok(p),
            Some(_) => Err(SignalError::NotAwaitingAnswer(connection_id.to_string())),
            None => Err(SignalError::UnknownConnection(connection_id.to_string())),
        }
    }

    /// Wrap an application message for a paired connection.
    pub fn message(
        &mut self,
        connection_id: &str,
        message: &ApplicationMessage,
    ) -> Result<Envelope, SignalError> {
        let pairing = self
            .pairings
            .get_mut(connection_id)
            .ok_or_else(|| SignalError::UnknownConnection(connection_id.to_string()))?;
        match pairing.state {
            PeerPairingState::Matched | PeerPairingState::Active => {
                pairing.state = PeerPairingState::Active;
            }
            _ => return Err(SignalError::NotPaired(connection_id.to_string())),
        }
        Ok(Envelope::new(
            EnvelopeType::SessionDescription,
            connection_id,
            message.encode()?,
        ))
    }

    /// Leave a pairing (or withdraw a pending request).
    pub fn disconnect(&mut self, connection_id: &str, reason: &str) -> Result<Envelope, SignalError> {
        self.pairings
            .remove(connection_id)
            .ok_or_else(|| SignalError::UnknownConnection(connection_id.to_string()))?;
        Ok(Envelope::with_payload(
            EnvelopeType::Disconnect,
            connection_id,
            &DisconnectNotice::new(reason),
        )?)
    }

    /// Interpret an envelope received from the relay.
    pub fn on_envelope(&mut self, envelope: &Envelope) -> SignalEvent {
        let connection_id = envelope.connection_id.clone();
        let ignored = |reason: String| SignalEvent::Ignored {
            connection_id: envelope.connection_id.clone(),
            reason,
        };

        match envelope.typ {
            EnvelopeType::Connect => {
                let request: ConnectionRequest = match envelope.payload_as() {
                    Ok(r) => r,
                    Err(e) => return ignored(bad_payload(e)),
                };
                if self.pairings.contains_key(&connection_id) {
                    return ignored("duplicate connection id".to_string());
                }
                self.pairings.insert(
                    connection_id.clone(),
                    PeerPairing {
                        partner: Some(request.requester_id.clone()),
                        state: PeerPairingState::Incoming,
                    },
                );
                SignalEvent::IncomingRequest {
                    connection_id,
                    request,
                }
            }
            EnvelopeType::ConnectResponse => {
                let reply: ConnectReply = match envelope.payload_as() {
                    Ok(r) => r,
                    Err(e) => return ignored(bad_payload(e)),
                };
                let Some(pairing) = self.pairings.get_mut(&connection_id) else {
                    return ignored("unknown connection id".to_string());
                };
                if pairing.state != PeerPairingState::Requesting {
                    return ignored("not waiting for an answer".to_string());
                }
                if reply.accepted {
                    pairing.state = PeerPairingState::Matched;
                    if reply.peer_id.is_some() {
                        pairing.partner = reply.peer_id.clone();
                    }
                    SignalEvent::Accepted {
                        connection_id,
                        peer_id: reply.peer_id,
                    }
                } else {
                    self.pairings.remove(&connection_id);
                    SignalEvent::Refused {
                        connection_id,
                        reason: reply.reason.unwrap_or_else(|| "refused".to_string()),
                    }
                }
            }
            EnvelopeType::RegisterToken => match envelope.payload_as::<ConnectReply>() {
                Ok(reply) => SignalEvent::TokenRegistered {
                    accepted: reply.accepted,
                    reason: reply.reason,
                },
                Err(e) => ignored(bad_payload(e)),
            },
            EnvelopeType::SessionDescription | EnvelopeType::IceCandidate => {
                match self.pairings.get_mut(&connection_id) {
                    Some(p)
                        if matches!(
                            p.state,
                            PeerPairingState::Matched | PeerPairingState::Active
                        ) =>
                    {
                        p.state = PeerPairingState::Active;
                        SignalEvent::Payload(envelope.clone())
                    }
                    _ => ignored("payload for a connection that is not paired".to_string()),
                }
            }
            EnvelopeType::Disconnect => {
                if self.pairings.remove(&connection_id).is_none() {
                    return ignored("unknown connection id".to_string());
                }
                let reason = envelope
                    .payload_as::<DisconnectNotice>()
                    .ok()
                    .map(|n| n.reason);
                SignalEvent::Closed {
                    connection_id,
                    reason,
                }
            }
        }
    }
}

fn bad_payload(err: ParseError) -> String {
    format!("bad payload: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;
    use tether_proto::MouseClick;

    #[test]
    fn requester_and_target_agree_on_a_pairing() {
        let mut r = SignalingClient::new("R");
        let mut t = SignalingClient::new("T");

        let connect = r.request("T", "tok").unwrap();
        let conn = connect.connection_id.clone();
        assert_equal!(r.pairing(&conn).unwrap().state, PeerPairingState::Requesting);

        match t.on_envelope(&connect) {
            SignalEvent::IncomingRequest { request, .. } => {
                assert_equal!(request.requester_id.as_str(), "R");
                assert_equal!(request.target_id.as_str(), "T");
            }
            other => panic!("unexpected {:?}", other),
        }

        let answer = t.accept(&conn).unwrap();
        assert_equal!(
            r.on_envelope(&answer),
            SignalEvent::Accepted {
                connection_id: conn.clone(),
                peer_id: Some("T".to_string()),
            }
        );

        let msg: ApplicationMessage =
            MouseClick::new(1, 2, tether_proto::MouseButton::Left).into();
        let env = r.message(&conn, &msg).unwrap();
        assert_equal!(t.on_envelope(&env), SignalEvent::Payload(env.clone()));
        assert_equal!(t.pairing(&conn).unwrap().state, PeerPairingState::Active);

        let bye = t.disconnect(&conn, "done").unwrap();
        assert_equal!(
            r.on_envelope(&bye),
            SignalEvent::Closed {
                connection_id: conn.clone(),
                reason: Some("done".to_string()),
            }
        );
        assert!(r.pairing(&conn).is_none());
        assert!(t.pairing(&conn).is_none());
    }

    #[test]
    fn reject_refuses_and_releases() {
        let mut r = SignalingClient::new("R");
        let mut t = SignalingClient::new("T");
        let connect = r.request("T", "tok").unwrap();
        t.on_envelope(&connect);

        let out = t.reject(&connect.connection_id, "busy").unwrap();
        assert_equal!(out.len(), 2);
        assert_equal!(out[1].typ, EnvelopeType::Disconnect);
        assert_equal!(
            r.on_envelope(&out[0]),
            SignalEvent::Refused {
                connection_id: connect.connection_id.clone(),
                reason: "busy".to_string(),
            }
        );
        assert!(r.pairing(&connect.connection_id).is_none());
    }

    #[test]
    fn cannot_message_before_pairing() {
        let mut r = SignalingClient::new("R");
        let connect = r.request("T", "tok").unwrap();
        let msg: ApplicationMessage = MouseClick::new(0, 0, tether_proto::MouseButton::Right).into();
        assert_equal!(
            r.message(&connect.connection_id, &msg),
            Err(SignalError::NotPaired(connect.connection_id.clone()))
        );
        assert_equal!(
            r.accept(&connect.connection_id),
            Err(SignalError::NotAwaitingAnswer(connect.connection_id.clone()))
        );
    }

    #[test]
    fn stray_envelopes_are_ignored() {
        let mut r = SignalingClient::new("R");
        let sdp = Envelope::new(EnvelopeType::SessionDescription, "nope", "{}".to_string());
        assert!(matches!(r.on_envelope(&sdp), SignalEvent::Ignored { .. }));
        let bad = Envelope::new(EnvelopeType::Connect, "c", "{".to_string());
        assert!(matches!(r.on_envelope(&bad), SignalEvent::Ignored { .. }));
    }

    #[test]
    fn session_request_learns_partner_from_reply() {
        let mut browser = SignalingClient::new("browser");
        let connect = browser.request_session("abcd").unwrap();
        let request: ConnectionRequest = connect.payload_as().unwrap();
        assert_equal!(request.session_key(), Some("abcd"));
        assert!(!request.is_targeted());

        let reply = Envelope::with_payload(
            EnvelopeType::ConnectResponse,
            connect.connection_id.clone(),
            &ConnectReply::accepted("srv1"),
        )
        .unwrap();
        browser.on_envelope(&reply);
        assert_equal!(
            browser.pairing(&connect.connection_id).unwrap().partner.as_deref(),
            Some("srv1")
        );
    }
}
