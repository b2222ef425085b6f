use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use crate::pool::{RelayBackend, RelayPool};
use crate::session::{DEFAULT_SESSION_TTL_MINUTES, DEFAULT_SWEEP_INTERVAL};
use crate::signaling::DEFAULT_CONNECT_HOLD;
use crate::AuthMode;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:9090";
pub const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:9090";
pub const DEFAULT_FALLBACK_URL: &str = "ws://127.0.0.1:9090/ws/peer";
/// Upper bound for `TETHER_CONNECT_HOLD_SECS`.
pub const MAX_CONNECT_HOLD: Duration = Duration::from_secs(24 * 60 * 60);
/// One year.
pub const MAX_SESSION_TTL_MINUTES: i64 = 365 * 24 * 60;

/// Relay settings, read once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Base used to build the `sessionUrl` handed back to operators.
    pub public_url: String,
    pub backends: Vec<RelayBackend>,
    pub fallback: RelayBackend,
    pub session_ttl_minutes: i64,
    pub sweep_interval: Duration,
    pub connect_hold: Duration,
    pub shared_token: Option<String>,
    pub auth_mode: AuthMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9090)),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            backends: Vec::new(),
            fallback: RelayBackend::new("local", DEFAULT_FALLBACK_URL),
            session_ttl_minutes: DEFAULT_SESSION_TTL_MINUTES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            connect_hold: DEFAULT_CONNECT_HOLD,
            shared_token: None,
            auth_mode: AuthMode::Required,
        }
    }
}

impl RelayConfig {
    /// Read `TETHER_*` variables from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let listen: SocketAddr = get("TETHER_RELAY_LISTEN")
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
            .parse()
            .context("invalid TETHER_RELAY_LISTEN (expected host:port)")?;

        let public_url = get("TETHER_RELAY_PUBLIC_URL")
            .unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        url::Url::parse(&public_url).context("invalid TETHER_RELAY_PUBLIC_URL")?;

        let backends = match get("TETHER_RELAY_BACKENDS") {
            Some(list) => {
                RelayPool::parse_backends(&list).context("invalid TETHER_RELAY_BACKENDS")?
            }
            None => Vec::new(),
        };

        let fallback_url =
            get("TETHER_RELAY_FALLBACK_URL").unwrap_or_else(|| DEFAULT_FALLBACK_URL.to_string());
        url::Url::parse(&fallback_url).context("invalid TETHER_RELAY_FALLBACK_URL")?;

        let session_ttl_minutes = match get("TETHER_SESSION_TTL_MINUTES") {
            Some(v) => v
                .trim()
                .parse()
                .context("invalid TETHER_SESSION_TTL_MINUTES")?,
            None => DEFAULT_SESSION_TTL_MINUTES,
        };
        anyhow::ensure!(
            session_ttl_minutes <= MAX_SESSION_TTL_MINUTES,
            "TETHER_SESSION_TTL_MINUTES must be at most {}",
            MAX_SESSION_TTL_MINUTES
        );

        let sweep_interval = match get("TETHER_SESSION_SWEEP_SECS") {
            Some(v) => {
                let secs: u64 = v.trim().parse().context("invalid TETHER_SESSION_SWEEP_SECS")?;
                anyhow::ensure!(secs > 0, "TETHER_SESSION_SWEEP_SECS must be positive");
                Duration::from_secs(secs)
            }
            None => DEFAULT_SWEEP_INTERVAL,
        };

        let connect_hold = match get("TETHER_CONNECT_HOLD_SECS") {
            Some(v) => {
                let secs: u64 = v.trim().parse().context("invalid TETHER_CONNECT_HOLD_SECS")?;
                anyhow::ensure!(
                    secs <= MAX_CONNECT_HOLD.as_secs(),
                    "TETHER_CONNECT_HOLD_SECS must be at most {}",
                    MAX_CONNECT_HOLD.as_secs()
                );
                Duration::from_secs(secs)
            }
            None => DEFAULT_CONNECT_HOLD,
        };

        let auth_mode = if get("TETHER_RELAY_NO_AUTH").is_some_and(|v| v == "true" || v == "1") {
            log::warn!("TETHER_RELAY_NO_AUTH set: token checks disabled (dev mode)");
            AuthMode::Disabled
        } else {
            AuthMode::Required
        };

        Ok(Self {
            listen,
            public_url,
            backends,
            fallback: RelayBackend::new("local", fallback_url),
            session_ttl_minutes,
            sweep_interval,
            connect_hold,
            shared_token: get("TETHER_RELAY_SHARED_TOKEN"),
            auth_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = RelayConfig::from_vars(vars(&[])).unwrap();
        assert_equal!(config.listen, "0.0.0.0:9090".parse::<SocketAddr>().unwrap());
        assert_equal!(config.session_ttl_minutes, 30);
        assert_equal!(config.sweep_interval, Duration::from_secs(60));
        assert_equal!(config.auth_mode, AuthMode::Required);
        assert!(config.backends.is_empty());
        assert_equal!(config.shared_token, None);
    }

    #[test]
    fn reads_overrides() {
        let config = RelayConfig::from_vars(vars(&[
            ("TETHER_RELAY_LISTEN", "127.0.0.1:7000"),
            ("TETHER_RELAY_PUBLIC_URL", "https://relay.example/"),
            ("TETHER_RELAY_BACKENDS", "a=wss://a.example/ws,b=wss://b.example/ws"),
            ("TETHER_SESSION_TTL_MINUTES", "5"),
            ("TETHER_CONNECT_HOLD_SECS", "0"),
            ("TETHER_RELAY_SHARED_TOKEN", "s3cret"),
            ("TETHER_RELAY_NO_AUTH", "true"),
        ]))
        .unwrap();
        assert_equal!(config.listen.port(), 7000);
        assert_equal!(config.public_url.as_str(), "https://relay.example");
        assert_equal!(config.backends.len(), 2);
        assert_equal!(config.session_ttl_minutes, 5);
        assert_equal!(config.connect_hold, Duration::ZERO);
        assert_equal!(config.shared_token.as_deref(), Some("s3cret"));
        assert_equal!(config.auth_mode, AuthMode::Disabled);
    }

    #[test]
    fn rejects_garbage() {
        assert!(RelayConfig::from_vars(vars(&[("TETHER_RELAY_LISTEN", "nope")])).is_err());
        assert!(RelayConfig::from_vars(vars(&[("TETHER_SESSION_SWEEP_SECS", "0")])).is_err());
        assert!(RelayConfig::from_vars(vars(&[("TETHER_RELAY_BACKENDS", "x=not a url")])).is_err());
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let huge = u64::MAX.to_string();
        assert!(RelayConfig::from_vars(vars(&[("TETHER_CONNECT_HOLD_SECS", &huge)])).is_err());
        assert!(RelayConfig::from_vars(vars(&[("TETHER_CONNECT_HOLD_SECS", "86401")])).is_err());
        assert!(RelayConfig::from_vars(vars(&[("TETHER_CONNECT_HOLD_SECS", "86400")])).is_ok());
        assert!(RelayConfig::from_vars(vars(&[(
            "TETHER_SESSION_TTL_MINUTES",
            "9000000000000000000"
        )]))
        .is_err());
    }
}
