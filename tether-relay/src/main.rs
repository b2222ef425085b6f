use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use tether_relay::config::RelayConfig;
use tether_relay::{heartbeat_checker, http, State};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = RelayConfig::from_env().context("loading relay configuration")?;
    let listen = config.listen;
    let sweep_interval = config.sweep_interval;

    if config.auth_mode == tether_relay::AuthMode::Required && config.shared_token.is_none() {
        log::info!(
            "TETHER_RELAY_SHARED_TOKEN not set: targeted connects need a registered token or session"
        );
    }
    if config.backends.is_empty() {
        log::info!(
            "no TETHER_RELAY_BACKENDS configured, sessions use {}",
            config.fallback.url
        );
    }

    let state = Arc::new(State::new(config));
    let cancel = CancellationToken::new();

    let sweeper = state
        .registry
        .clone()
        .spawn_sweeper(sweep_interval, cancel.child_token());
    let checker = tokio::spawn(heartbeat_checker(state.clone(), cancel.child_token()));

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("ctrl-c received, shutting down"),
                _ = cancel.cancelled() => {}
            }
            cancel.cancel();
        }
    };

    let (addr, server) = warp::serve(http::routes(state))
        .try_bind_with_graceful_shutdown(listen, shutdown)
        .with_context(|| format!("binding {listen}"))?;

    log::info!("tether-relay listening on {}", addr);
    server.await;

    cancel.cancel();
    let _ = sweeper.await;
    let _ = checker.await;
    log::info!("tether-relay stopped");
    Ok(())
}
