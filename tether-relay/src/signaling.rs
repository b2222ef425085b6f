//! Relay-side signaling state machine.
//!
//! The table is pure bookkeeping: every operation takes the sending peer and
//! an envelope and returns the envelopes to deliver, addressed by peer id.
//! The websocket layer owns the sockets and does the actual sending.
//!
//! Per connection id a pairing moves `Requesting -> Matched -> Active` and is
//! removed (closed) on `Disconnect` or when either side goes away. Two ways to
//! find a target exist and never mix: a `Connect` naming a `targetId` only
//! ever reaches the peer registered under that id, and a `Connect` without a
//! target only ever reaches the peer that registered its exact token.
//! Conflicts resolve first-registered-wins for both peer ids and tokens.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use tether_proto::{
    ConnectReply, ConnectionRequest, DisconnectNotice, Envelope, EnvelopeType, TokenRegistration,
};

use crate::session::{SessionError, SessionRegistry};
use crate::AuthMode;

pub const DEFAULT_CONNECT_HOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Refusal {
    #[error("auth token does not grant access to the target")]
    AuthMismatch,
    #[error("session rejected: {0}")]
    Session(SessionError),
    #[error("no such target")]
    NoSuchTarget,
    #[error("connection id already in use")]
    ConnectionIdInUse,
    #[error("requester id does not match the sending peer")]
    RequesterMismatch,
    #[error("malformed request")]
    MalformedRequest,
    #[error("peer id already registered")]
    PeerIdInUse,
    #[error("token registered by another peer")]
    TokenInUse,
}

impl Refusal {
    /// Reason string carried in relay replies and close frames.
    pub fn reason(&self) -> &'static str {
        match self {
            Refusal::AuthMismatch => "auth_mismatch",
            Refusal::Session(SessionError::Invalid) => "session_invalid",
            Refusal::Session(SessionError::Expired) => "session_expired",
            Refusal::Session(SessionError::AlreadyUsed) => "session_already_used",
            Refusal::NoSuchTarget => "no_such_target",
            Refusal::ConnectionIdInUse => "connection_id_in_use",
            Refusal::RequesterMismatch => "requester_mismatch",
            Refusal::MalformedRequest => "malformed_request",
            Refusal::PeerIdInUse => "peer_id_in_use",
            Refusal::TokenInUse => "token_in_use",
        }
    }
}

/// What the requester proved about itself, resolved before the table is
/// consulted (session lookups need the registry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Token(String),
    Session { server_id: String },
}

/// Resolve the credential carried by a `Connect`. A `session:<key>` token
/// redeems the web session, consuming it if it is one-time.
pub async fn credential_for(
    registry: &SessionRegistry,
    request: &ConnectionRequest,
) -> Result<Credential, Refusal> {
    match request.session_key() {
        Some(key) => registry
            .validate(key)
            .await
            .map(|session| Credential::Session {
                server_id: session.server_id,
            })
            .map_err(Refusal::Session),
        None => Ok(Credential::Token(request.auth_token.clone())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Requesting,
    Matched,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub requester: String,
    pub target: String,
    pub state: PairingState,
}

impl Pairing {
    fn partner_of(&self, peer_id: &str) -> Option<&str> {
        if self.requester == peer_id {
            Some(&self.target)
        } else if self.target == peer_id {
            Some(&self.requester)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub peer_id: String,
    pub envelope: Envelope,
}

impl Delivery {
    fn new(peer_id: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            peer_id: peer_id.into(),
            envelope,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HeldTarget {
    Peer(String),
    Token(String),
}

#[derive(Debug, Clone)]
struct HeldConnect {
    requester: String,
    target: HeldTarget,
    credential: Credential,
    envelope: Envelope,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalingStats {
    pub peers: usize,
    pub tokens: usize,
    pub pairings: usize,
    pub held: usize,
}

pub struct SignalingTable {
    auth_mode: AuthMode,
    shared_token: Option<String>,
    hold_ttl: Duration,
    peers: HashSet<String>,
    /// token -> registering peer
    tokens: HashMap<String, String>,
    pairings: HashMap<String, Pairing>,
    held: HashMap<String, HeldConnect>,
}

fn relay_envelope<T: Serialize>(typ: EnvelopeType, connection_id: &str, payload: &T) -> Envelope {
    Envelope::with_payload(typ, connection_id, payload)
        .unwrap_or_else(|_| Envelope::new(typ, connection_id, String::new()))
}

/// A relay-originated `ConnectResponse` refusing `connection_id`.
pub fn refusal(peer_id: &str, connection_id: &str, refusal: &Refusal) -> Delivery {
    Delivery::new(
        peer_id,
        relay_envelope(
            EnvelopeType::ConnectResponse,
            connection_id,
            &ConnectReply::refused(refusal.reason()),
        ),
    )
}

impl SignalingTable {
    pub fn new(auth_mode: AuthMode, shared_token: Option<String>, hold_ttl: Duration) -> Self {
        Self {
            auth_mode,
            shared_token: shared_token.filter(|t| !t.is_empty()),
            hold_ttl,
            peers: HashSet::new(),
            tokens: HashMap::new(),
            pairings: HashMap::new(),
            held: HashMap::new(),
        }
    }

    pub fn is_online(&self, peer_id: &str) -> bool {
        self.peers.contains(peer_id)
    }

    pub fn pairing(&self, connection_id: &str) -> Option<&Pairing> {
        self.pairings.get(connection_id)
    }

    /// State of a connection id, counting held requests as `Requesting`.
    pub fn state_of(&self, connection_id: &str) -> Option<PairingState> {
        if self.held.contains_key(connection_id) {
            return Some(PairingState::Requesting);
        }
        self.pairings.get(connection_id).map(|p| p.state)
    }

    pub fn stats(&self) -> SignalingStats {
        SignalingStats {
            peers: self.peers.len(),
            tokens: self.tokens.len(),
            pairings: self.pairings.len(),
            held: self.held.len(),
        }
    }

    /// A peer opened its control channel. Held requests addressed to it are
    /// released if their credential already suffices.
    pub fn register_peer(&mut self, peer_id: &str) -> Result<Vec<Delivery>, Refusal> {
        if !self.peers.insert(peer_id.to_string()) {
            return Err(Refusal::PeerIdInUse);
        }
        log::info!("peer registered peer_id={}", peer_id);

        let ready: Vec<String> = self
            .held
            .iter()
            .filter(|(_, h)| {
                h.target == HeldTarget::Peer(peer_id.to_string())
                    && self.authorize(peer_id, &h.credential).is_ok()
            })
            .map(|(id, _)| id.clone())
            .collect();
        Ok(self.release(ready, peer_id))
    }

    /// A peer's control channel closed. Its partners are told, its tokens
    /// are released and its own held requests are dropped.
    pub fn unregister_peer(&mut self, peer_id: &str) -> Vec<Delivery> {
        if !self.peers.remove(peer_id) {
            return Vec::new();
        }
        self.tokens.retain(|_, owner| owner != peer_id);
        self.held.retain(|_, h| h.requester != peer_id);

        let closed: Vec<String> = self
            .pairings
            .iter()
            .filter(|(_, p)| p.partner_of(peer_id).is_some())
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::new();
        for connection_id in closed {
            let Some(pairing) = self.pairings.remove(&connection_id) else {
                continue;
            };
            if let Some(partner) = pairing.partner_of(peer_id) {
                if self.peers.contains(partner) {
                    out.push(Delivery::new(
                        partner,
                        relay_envelope(
                            EnvelopeType::Disconnect,
                            &connection_id,
                            &DisconnectNotice::new("peer_disconnected"),
                        ),
                    ));
                }
            }
            log::info!(
                "pairing closed connection_id={} reason=peer_disconnected peer_id={}",
                connection_id,
                peer_id
            );
        }
        log::info!("peer unregistered peer_id={}", peer_id);
        out
    }

    /// Checks on a `Connect` that need no credential. Run before a session
    /// token is redeemed so a refused request does not spend it.
    pub fn precheck(
        &self,
        from: &str,
        connection_id: &str,
        request: &ConnectionRequest,
    ) -> Result<(), Refusal> {
        if connection_id.is_empty() {
            return Err(Refusal::MalformedRequest);
        }
        if request.requester_id != from {
            return Err(Refusal::RequesterMismatch);
        }
        if self.pairings.contains_key(connection_id) || self.held.contains_key(connection_id) {
            return Err(Refusal::ConnectionIdInUse);
        }
        Ok(())
    }

    pub fn handle_connect(
        &mut self,
        from: &str,
        envelope: Envelope,
        request: &ConnectionRequest,
        credential: Result<Credential, Refusal>,
        now: Instant,
    ) -> Vec<Delivery> {
        let connection_id = envelope.connection_id.clone();
        let refuse = |r: Refusal| {
            log::info!(
                "connect refused connection_id={} from={} reason={}",
                connection_id,
                from,
                r.reason()
            );
            vec![refusal(from, &connection_id, &r)]
        };

        if let Err(r) = self.precheck(from, &connection_id, request) {
            return refuse(r);
        }
        let credential = match credential {
            Ok(c) => c,
            Err(r) => return refuse(r),
        };
        let target = match Self::resolve_target(request, &credential) {
            Ok(t) => t,
            Err(r) => return refuse(r),
        };

        let matched = match &target {
            HeldTarget::Peer(peer) if peer == from => return refuse(Refusal::NoSuchTarget),
            HeldTarget::Peer(peer) if self.peers.contains(peer) => {
                if let Err(r) = self.authorize(peer, &credential) {
                    return refuse(r);
                }
                Some(peer.clone())
            }
            HeldTarget::Peer(_) => None,
            HeldTarget::Token(token) => match self.tokens.get(token) {
                Some(owner) if owner == from => return refuse(Refusal::NoSuchTarget),
                Some(owner) => Some(owner.clone()),
                None => None,
            },
        };

        if let Some(peer) = matched {
            return vec![self.matched(connection_id, from, peer, envelope)];
        }

        let Some(deadline) = now.checked_add(self.hold_ttl).filter(|_| !self.hold_ttl.is_zero())
        else {
            return refuse(Refusal::NoSuchTarget);
        };
        log::info!(
            "connect held connection_id={} from={} target={:?} ttl={:?}",
            connection_id,
            from,
            target,
            self.hold_ttl
        );
        self.held.insert(
            connection_id,
            HeldConnect {
                requester: from.to_string(),
                target,
                credential,
                envelope,
                deadline,
            },
        );
        Vec::new()
    }

    /// `RegisterToken`: the sender accepts any untargeted `Connect` carrying
    /// exactly this token. The relay echoes the outcome back to the sender.
    pub fn register_token(
        &mut self,
        from: &str,
        connection_id: &str,
        registration: &TokenRegistration,
    ) -> Vec<Delivery> {
        let token = registration.auth_token.as_str();
        let reply = |r: ConnectReply| {
            Delivery::new(
                from,
                relay_envelope(EnvelopeType::RegisterToken, connection_id, &r),
            )
        };

        if token.is_empty() {
            return vec![reply(ConnectReply::refused(Refusal::MalformedRequest.reason()))];
        }
        match self.tokens.get(token) {
            Some(owner) if owner != from => {
                log::warn!("token registration refused from={} reason=token_in_use", from);
                return vec![reply(ConnectReply::refused(Refusal::TokenInUse.reason()))];
            }
            Some(_) => {}
            None => {
                self.tokens.insert(token.to_string(), from.to_string());
                log::info!("token registered peer_id={}", from);
            }
        }

        let mut out = vec![reply(ConnectReply::accepted(from))];
        let ready: Vec<String> = self
            .held
            .iter()
            .filter(|(_, h)| match &h.target {
                HeldTarget::Token(t) => t == token,
                HeldTarget::Peer(p) => {
                    p == from && self.authorize(from, &h.credential).is_ok()
                }
            })
            .map(|(id, _)| id.clone())
            .collect();
        out.extend(self.release(ready, from));
        out
    }

    /// `ConnectResponse`, `SessionDescription` and `IceCandidate` go verbatim
    /// to the other side of the pairing.
    pub fn forward(&mut self, from: &str, envelope: Envelope) -> Vec<Delivery> {
        let Some(pairing) = self.pairings.get_mut(&envelope.connection_id) else {
            log::debug!(
                "dropping {:?} for unknown connection_id={} from={}",
                envelope.typ,
                envelope.connection_id,
                from
            );
            return Vec::new();
        };
        let Some(partner) = pairing.partner_of(from).map(str::to_string) else {
            log::warn!(
                "dropping {:?} from non-party {} on connection_id={}",
                envelope.typ,
                from,
                envelope.connection_id
            );
            return Vec::new();
        };

        if pairing.state == PairingState::Matched
            && matches!(
                envelope.typ,
                EnvelopeType::SessionDescription | EnvelopeType::IceCandidate
            )
        {
            pairing.state = PairingState::Active;
            log::info!("pairing active connection_id={}", envelope.connection_id);
        }
        vec![Delivery::new(partner, envelope)]
    }

    pub fn disconnect(&mut self, from: &str, envelope: Envelope) -> Vec<Delivery> {
        let connection_id = envelope.connection_id.clone();

        if self
            .held
            .get(&connection_id)
            .is_some_and(|h| h.requester == from)
        {
            self.held.remove(&connection_id);
            log::info!("held connect withdrawn connection_id={}", connection_id);
            return Vec::new();
        }

        let partner = match self.pairings.get(&connection_id) {
            Some(p) => match p.partner_of(from) {
                Some(partner) => partner.to_string(),
                None => {
                    log::warn!(
                        "ignoring disconnect from non-party {} on connection_id={}",
                        from,
                        connection_id
                    );
                    return Vec::new();
                }
            },
            None => {
                log::debug!("disconnect for unknown connection_id={}", connection_id);
                return Vec::new();
            }
        };

        self.pairings.remove(&connection_id);
        log::info!(
            "pairing closed connection_id={} by={}",
            connection_id,
            from
        );
        vec![Delivery::new(partner, envelope)]
    }

    /// Refuse held requests whose deadline has passed.
    pub fn expire_held(&mut self, now: Instant) -> Vec<Delivery> {
        let expired: Vec<String> = self
            .held
            .iter()
            .filter(|(_, h)| h.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::new();
        for connection_id in expired {
            let Some(held) = self.held.remove(&connection_id) else {
                continue;
            };
            let reason = match &held.target {
                HeldTarget::Peer(peer) if self.peers.contains(peer) => Refusal::AuthMismatch,
                _ => Refusal::NoSuchTarget,
            };
            log::info!(
                "held connect expired connection_id={} requester={} reason={}",
                connection_id,
                held.requester,
                reason.reason()
            );
            out.push(refusal(&held.requester, &connection_id, &reason));
        }
        out
    }

    fn resolve_target(
        request: &ConnectionRequest,
        credential: &Credential,
    ) -> Result<HeldTarget, Refusal> {
        if request.is_targeted() {
            return Ok(HeldTarget::Peer(request.target_id.clone()));
        }
        match credential {
            Credential::Session { server_id } => Ok(HeldTarget::Peer(server_id.clone())),
            Credential::Token(token) if !token.is_empty() => Ok(HeldTarget::Token(token.clone())),
            Credential::Token(_) => Err(Refusal::MalformedRequest),
        }
    }

    /// May `credential` open a pairing with `target`?
    fn authorize(&self, target: &str, credential: &Credential) -> Result<(), Refusal> {
        match credential {
            Credential::Session { server_id } if server_id == target => Ok(()),
            Credential::Session { .. } => Err(Refusal::AuthMismatch),
            Credential::Token(_) if self.auth_mode == AuthMode::Disabled => Ok(()),
            Credential::Token(token) => {
                let shared = self.shared_token.as_deref() == Some(token.as_str());
                let registered = self.tokens.get(token).is_some_and(|owner| owner == target);
                if shared || registered {
                    Ok(())
                } else {
                    Err(Refusal::AuthMismatch)
                }
            }
        }
    }

    fn matched(
        &mut self,
        connection_id: String,
        requester: &str,
        target: String,
        envelope: Envelope,
    ) -> Delivery {
        log::info!(
            "connect matched connection_id={} requester={} target={}",
            connection_id,
            requester,
            target
        );
        self.pairings.insert(
            connection_id,
            Pairing {
                requester: requester.to_string(),
                target: target.clone(),
                state: PairingState::Matched,
            },
        );
        Delivery::new(target, envelope)
    }

    fn release(&mut self, ready: Vec<String>, target: &str) -> Vec<Delivery> {
        let mut out = Vec::new();
        for connection_id in ready {
            let Some(held) = self.held.remove(&connection_id) else {
                continue;
            };
            if held.requester == target {
                out.push(refusal(&held.requester, &connection_id, &Refusal::NoSuchTarget));
                continue;
            }
            out.push(self.matched(
                connection_id,
                &held.requester,
                target.to_string(),
                held.envelope,
            ));
        }
        out
    }
}
