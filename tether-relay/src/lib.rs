//! Tether relay server library.
//!
//! Holds the WebSocket control channel handling and the shared state that
//! both the binary and the integration tests drive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use tether_proto::{ConnectionRequest, Envelope, EnvelopeType, TokenRegistration};

pub mod config;
pub mod http;
pub mod pool;
pub mod session;
pub mod signaling;

use config::RelayConfig;
use pool::RelayPool;
use session::SessionRegistry;
use signaling::{credential_for, Delivery, Refusal, SignalingTable};

/// Channel buffer size - prevents unbounded memory growth
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Connection timeout after missed heartbeats
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// How often held `Connect` requests are checked for expiry.
pub const HOLD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Close code sent to a second socket claiming a live peer id.
pub const PEER_ID_IN_USE_CLOSE: u16 = 4409;

pub type Tx = mpsc::Sender<Message>;

#[derive(Clone)]
pub struct PeerControl {
    pub tx: Tx,
    /// Last frame (data or pong) received
    pub last_heartbeat: Arc<Mutex<Instant>>,
    /// Distinguishes this socket from a later one reusing the peer id
    pub uid: Uuid,
    /// Cancelled to tear the socket down from outside its read loop
    pub kick: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// Targeted connects must carry the shared token, a token the target
    /// registered, or a session bound to the target (production default)
    Required,
    /// Any token is accepted (dev mode - requires explicit opt-in)
    Disabled,
}

/// Shared relay state. Lock order is `peers`, then `signaling`, then the
/// session registry's own lock.
pub struct State {
    pub peers: Mutex<HashMap<String, PeerControl>>,
    pub signaling: Mutex<SignalingTable>,
    pub registry: Arc<SessionRegistry>,
    pub pool: Arc<RelayPool>,
    pub config: RelayConfig,
}

impl State {
    pub fn new(config: RelayConfig) -> Self {
        let pool = Arc::new(RelayPool::new(
            config.backends.clone(),
            config.fallback.clone(),
        ));
        Self {
            peers: Mutex::default(),
            signaling: Mutex::new(SignalingTable::new(
                config.auth_mode,
                config.shared_token.clone(),
                config.connect_hold,
            )),
            registry: Arc::new(SessionRegistry::new(pool.clone())),
            pool,
            config,
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

/// Background task that expires held connects and drops peers whose
/// sockets went silent.
pub async fn heartbeat_checker(state: Arc<State>, cancel: CancellationToken) {
    let mut hold_ticker = interval(HOLD_CHECK_INTERVAL);
    let mut heartbeat_ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = hold_ticker.tick() => {
                let expired = state.signaling.lock().await.expire_held(Instant::now());
                deliver(&state, expired).await;
            }
            _ = heartbeat_ticker.tick() => {
                drop_silent_peers(&state).await;
            }
        }
    }
    log::debug!("heartbeat checker stopped");
}

async fn drop_silent_peers(state: &State) {
    let timeout = Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);
    let now = Instant::now();

    let (dead, deliveries) = {
        let mut peers = state.peers.lock().await;
        let mut dead_ids = Vec::new();
        for (peer_id, peer) in peers.iter() {
            let last = *peer.last_heartbeat.lock().await;
            if now.duration_since(last) > timeout {
                dead_ids.push(peer_id.clone());
            }
        }

        let mut signaling = state.signaling.lock().await;
        let mut dead = Vec::new();
        let mut deliveries = Vec::new();
        for peer_id in dead_ids {
            if let Some(peer) = peers.remove(&peer_id) {
                log::warn!("peer {} timed out (no heartbeat)", peer_id);
                deliveries.extend(signaling.unregister_peer(&peer_id));
                dead.push(peer);
            }
        }
        (dead, deliveries)
    };

    for peer in dead {
        if peer.tx.try_send(Message::close()).is_err() {
            log::debug!("close frame not queued for a stalled peer");
        }
        peer.kick.cancel();
    }
    deliver(state, deliveries).await;
}

/// Queue relay output for the addressed peers without waiting. Peers that
/// went away in the meantime are skipped; frames for a peer whose queue is
/// full are dropped.
pub async fn deliver(state: &State, deliveries: Vec<Delivery>) {
    if deliveries.is_empty() {
        return;
    }
    let routed: Vec<(Tx, Delivery)> = {
        let peers = state.peers.lock().await;
        deliveries
            .into_iter()
            .filter_map(|d| match peers.get(&d.peer_id) {
                Some(peer) => Some((peer.tx.clone(), d)),
                None => {
                    log::debug!(
                        "dropping {:?} for offline peer_id={}",
                        d.envelope.typ,
                        d.peer_id
                    );
                    None
                }
            })
            .collect()
    };

    for (tx, delivery) in routed {
        match delivery.envelope.encode() {
            Ok(text) => match tx.try_send(Message::text(text)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => log::warn!(
                    "dropping {:?} for peer_id={}: channel full (backpressure)",
                    delivery.envelope.typ,
                    delivery.peer_id
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("peer_id={} writer closed", delivery.peer_id)
                }
            },
            Err(e) => log::warn!("failed to encode envelope for {}: {}", delivery.peer_id, e),
        }
    }
}

/// Apply one decoded envelope from `from` to the signaling table.
pub async fn route_envelope(state: &State, from: &str, envelope: Envelope) {
    let deliveries = match envelope.typ {
        EnvelopeType::Connect => match envelope.payload_as::<ConnectionRequest>() {
            Ok(request) => {
                // The table stays locked while the session is redeemed so
                // the prechecks still hold when the connect is applied.
                let mut signaling = state.signaling.lock().await;
                match signaling.precheck(from, &envelope.connection_id, &request) {
                    Err(r) => signaling.handle_connect(
                        from,
                        envelope,
                        &request,
                        Err(r),
                        Instant::now(),
                    ),
                    Ok(()) => {
                        let credential = credential_for(&state.registry, &request).await;
                        signaling.handle_connect(
                            from,
                            envelope,
                            &request,
                            credential,
                            Instant::now(),
                        )
                    }
                }
            }
            Err(e) => {
                log::warn!("bad Connect payload from peer_id={}: {}", from, e);
                vec![signaling::refusal(
                    from,
                    &envelope.connection_id,
                    &Refusal::MalformedRequest,
                )]
            }
        },
        EnvelopeType::RegisterToken => {
            let registration = envelope
                .payload_as::<TokenRegistration>()
                .unwrap_or_else(|e| {
                    log::warn!("bad RegisterToken payload from peer_id={}: {}", from, e);
                    TokenRegistration {
                        auth_token: String::new(),
                    }
                });
            state
                .signaling
                .lock()
                .await
                .register_token(from, &envelope.connection_id, &registration)
        }
        EnvelopeType::ConnectResponse
        | EnvelopeType::IceCandidate
        | EnvelopeType::SessionDescription => state.signaling.lock().await.forward(from, envelope),
        EnvelopeType::Disconnect => state.signaling.lock().await.disconnect(from, envelope),
    };
    deliver(state, deliveries).await;
}

/// Control channel for one peer at `/ws/peer/<peer_id>`.
pub async fn peer_control(ws: WebSocket, peer_id: String, state: Arc<State>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_BUFFER_SIZE);

    if peer_id.trim().is_empty() {
        let _ = ws_tx
            .send(Message::close_with(4400u16, "missing_peer_id"))
            .await;
        return;
    }

    let uid = Uuid::new_v4();
    let kick = CancellationToken::new();
    let last_heartbeat = Arc::new(Mutex::new(Instant::now()));

    // Register in both tables under one critical section.
    let registered = {
        let mut peers = state.peers.lock().await;
        let mut signaling = state.signaling.lock().await;
        match signaling.register_peer(&peer_id) {
            Ok(released) => {
                peers.insert(
                    peer_id.clone(),
                    PeerControl {
                        tx: out_tx.clone(),
                        last_heartbeat: last_heartbeat.clone(),
                        uid,
                        kick: kick.clone(),
                    },
                );
                Ok(released)
            }
            Err(refusal) => Err(refusal),
        }
    };
    let released = match registered {
        Ok(released) => released,
        Err(refusal) => {
            log::warn!(
                "peer connection rejected: peer_id={} already in use",
                peer_id
            );
            let _ = ws_tx
                .send(Message::close_with(PEER_ID_IN_USE_CLOSE, refusal.reason()))
                .await;
            return;
        }
    };

    let writer = tokio::task::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    deliver(&state, released).await;

    let heartbeat_tx = out_tx.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(Message::ping(vec![])).await.is_err() {
                break;
            }
        }
    });

    loop {
        let result = tokio::select! {
            _ = kick.cancelled() => {
                log::info!("peer_id={} dropped by the relay", peer_id);
                break;
            }
            next = ws_rx.next() => match next {
                Some(result) => result,
                None => break,
            },
        };
        let msg = match result {
            Ok(m) => m,
            Err(e) => {
                log::debug!("peer_id={} read error: {}", peer_id, e);
                break;
            }
        };

        if msg.is_pong() {
            *last_heartbeat.lock().await = Instant::now();
            continue;
        }
        if msg.is_close() {
            break;
        }
        if !(msg.is_text() || msg.is_binary()) {
            continue;
        }
        *last_heartbeat.lock().await = Instant::now();

        let envelope = match Envelope::decode(msg.as_bytes()) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("dropping malformed frame from peer_id={}: {}", peer_id, e);
                continue;
            }
        };
        route_envelope(&state, &peer_id, envelope).await;
    }

    heartbeat_handle.abort();
    release_peer(&state, &peer_id, uid).await;
    writer.abort();
    log::info!("peer disconnected peer_id={}", peer_id);
}

/// Remove `peer_id` if it is still owned by socket `uid` and tell its
/// partners.
async fn release_peer(state: &State, peer_id: &str, uid: Uuid) {
    let deliveries = {
        let mut peers = state.peers.lock().await;
        if peers.get(peer_id).map(|p| p.uid) != Some(uid) {
            return;
        }
        peers.remove(peer_id);
        state.signaling.lock().await.unregister_peer(peer_id)
    };
    deliver(state, deliveries).await;
}
