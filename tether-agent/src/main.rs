use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use tether_client::{
    BackoffPolicy, ConnectFailed, Connection, MessageRouter, ReconnectSupervisor, SignalEvent,
    SignalingClient, TlsPolicy, TransportConfig,
};
use tether_proto::Envelope;

#[derive(Debug, Parser)]
#[command(about = "Tether peer: keeps a relay connection up and logs what arrives")]
struct Opts {
    /// Relay peer endpoint, e.g. wss://relay.example/ws/peer. Repeat for
    /// failover; earlier endpoints are preferred.
    #[arg(long = "relay", required = true)]
    relays: Vec<String>,

    /// Peer id to register as. Defaults to a random id.
    #[arg(long)]
    peer_id: Option<String>,

    /// Pair with this peer once connected.
    #[arg(long, requires = "token")]
    target: Option<String>,

    /// Auth token sent with `--target`, or matched by token when no target
    /// is given.
    #[arg(long)]
    token: Option<String>,

    /// Redeem a web session key instead of naming a target.
    #[arg(long, conflicts_with_all = ["target", "token"])]
    session_key: Option<String>,

    /// Accept untargeted requests carrying this token.
    #[arg(long)]
    register_token: Option<String>,

    /// Connect attempts per relay endpoint.
    #[arg(long, default_value_t = tether_client::supervisor::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Accept self-signed certificates from loopback relays.
    #[arg(long)]
    allow_insecure_loopback: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let peer_id = opts
        .peer_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    log::info!(
        "tether-agent starting (peer_id={}, relays={:?})",
        peer_id,
        opts.relays
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupted; shutting down");
            }
            shutdown.cancel();
        });
    }

    let transport = TransportConfig {
        tls: if opts.allow_insecure_loopback {
            TlsPolicy::AllowInvalidForLoopback
        } else {
            TlsPolicy::Strict
        },
        ..TransportConfig::default()
    };
    let policy = BackoffPolicy {
        max_retries: opts.max_retries,
        ..BackoffPolicy::default()
    };

    // A session key is redeemed by the first Connect the relay answers;
    // later reconnects must not replay it.
    let mut session_key = opts.session_key.clone();

    while !shutdown.is_cancelled() {
        let supervisor = ReconnectSupervisor::new(
            peer_id.clone(),
            opts.relays.clone(),
            policy.clone(),
            transport.clone(),
            shutdown.child_token(),
        );
        let conn = match supervise(supervisor).await? {
            Ok(conn) => conn,
            Err(_) if shutdown.is_cancelled() => break,
            Err(e) => return Err(e).context("relay unreachable"),
        };

        match run_session(conn, &peer_id, &opts, &mut session_key, &shutdown).await {
            Ok(()) => log::warn!("relay connection ended; reconnecting in 1s"),
            Err(e) => log::warn!("relay session error: {e:#}; reconnecting in 1s"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }

    Ok(())
}

/// Run the supervisor in the background, logging its progress until it
/// settles.
async fn supervise(
    supervisor: ReconnectSupervisor,
) -> anyhow::Result<Result<Connection, ConnectFailed>> {
    let mut states = supervisor.watch_state();
    let mut task = supervisor.spawn();
    let outcome = loop {
        tokio::select! {
            biased;
            res = &mut task => break res,
            changed = states.changed() => {
                if changed.is_err() {
                    break (&mut task).await;
                }
                log::debug!("supervisor: {:?}", *states.borrow_and_update());
            }
        }
    };
    outcome.context("supervisor task failed")
}

fn logging_router() -> MessageRouter {
    let mut router = MessageRouter::new();
    router.on_any(|message| {
        log::info!("message {:?} id={:?}", message.kind(), message.id());
        Ok(())
    });
    router
}

async fn send(conn: &Connection, envelope: Envelope) -> anyhow::Result<()> {
    conn.send_envelope(&envelope)
        .await
        .with_context(|| format!("send {:?}", envelope.typ))
}

async fn run_session(
    mut conn: Connection,
    peer_id: &str,
    opts: &Opts,
    session_key: &mut Option<String>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut signaling = SignalingClient::new(peer_id);
    let router = logging_router();

    if let Some(token) = &opts.register_token {
        send(&conn, signaling.register_token(token)?).await?;
    }
    let mut session_request = None;
    let opening = match (&opts.session_key, &opts.target, &opts.token) {
        (Some(_), _, _) => match session_key.as_deref() {
            Some(key) => {
                let envelope = signaling.request_session(key)?;
                session_request = Some(envelope.connection_id.clone());
                Some(envelope)
            }
            None => None,
        },
        (None, Some(target), Some(token)) => Some(signaling.request(target, token)?),
        (None, None, Some(token)) => Some(signaling.request_by_token(token)?),
        _ => None,
    };
    if let Some(envelope) = opening {
        log::info!("requesting pairing connection_id={}", envelope.connection_id);
        send(&conn, envelope).await?;
    }

    let result = loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            next = conn.next_envelope() => match next {
                Some(envelope) => envelope,
                None => {
                    break match conn.last_error() {
                        Some(e) => Err(anyhow!("{e}")),
                        None => Ok(()),
                    }
                }
            },
        };

        match signaling.on_envelope(&envelope) {
            SignalEvent::IncomingRequest {
                connection_id,
                request,
            } => {
                log::info!(
                    "accepting connection_id={} from {}",
                    connection_id,
                    request.requester_id
                );
                send(&conn, signaling.accept(&connection_id)?).await?;
            }
            SignalEvent::Accepted {
                connection_id,
                peer_id,
            } => {
                settle_session(&mut session_request, session_key, &connection_id);
                log::info!("paired connection_id={} with {:?}", connection_id, peer_id);
            }
            SignalEvent::Refused {
                connection_id,
                reason,
            } => {
                settle_session(&mut session_request, session_key, &connection_id);
                log::warn!("connection_id={} refused: {}", connection_id, reason);
            }
            SignalEvent::TokenRegistered { accepted, reason } => {
                if accepted {
                    log::info!("token registered");
                } else {
                    log::warn!("token registration refused: {:?}", reason);
                }
            }
            SignalEvent::Payload(envelope) => {
                if let Err(e) = router.dispatch_envelope(&envelope) {
                    log::warn!("undecodable payload on {}: {}", envelope.connection_id, e);
                }
            }
            SignalEvent::Closed {
                connection_id,
                reason,
            } => log::info!("connection_id={} closed: {:?}", connection_id, reason),
            SignalEvent::Ignored {
                connection_id,
                reason,
            } => log::debug!("ignored envelope for {}: {}", connection_id, reason),
        }
    };

    for connection_id in signaling
        .active_connections()
        .map(str::to_string)
        .collect::<Vec<_>>()
    {
        if let Ok(envelope) = signaling.disconnect(&connection_id, "shutdown") {
            let _ = conn.send_envelope(&envelope).await;
        }
    }
    conn.dispose().await;
    result
}

/// The relay answered the session `Connect`, so the key is spent either
/// way.
fn settle_session(
    pending: &mut Option<String>,
    session_key: &mut Option<String>,
    connection_id: &str,
) {
    if pending.as_deref() == Some(connection_id) {
        *pending = None;
        if session_key.take().is_some() {
            log::info!("session key redeemed; it will not be sent again");
        }
    }
}
