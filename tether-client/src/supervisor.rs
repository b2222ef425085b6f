//! Reconnect supervisor: endpoint failover with exponential backoff.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::transport::{TransportConfig, TransportError};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_JITTER: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// Attempts per endpoint.
    pub max_retries: u32,
    /// Fractional spread applied to each delay, `0.25` meaning +/-25%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// `min(max_delay, base * 2^attempt)`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`base_delay`](Self::base_delay) scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`. A non-finite jitter counts as zero.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

/// Terminal result once every endpoint and retry has been used up.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("could not reach any relay after {attempts} attempts: {last_error}")]
pub struct ConnectFailed {
    pub last_error: TransportError,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting { endpoint: String, attempt: u32 },
    Connected { endpoint: String },
    Failed,
}

pub struct ReconnectSupervisor {
    peer_id: String,
    endpoints: Vec<String>,
    policy: BackoffPolicy,
    transport: TransportConfig,
    shutdown: CancellationToken,
    state: watch::Sender<SupervisorState>,
}

impl ReconnectSupervisor {
    /// `endpoints` are tried in order of preference.
    pub fn new(
        peer_id: impl Into<String>,
        endpoints: Vec<String>,
        policy: BackoffPolicy,
        transport: TransportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            peer_id: peer_id.into(),
            endpoints,
            policy,
            transport,
            shutdown,
            state,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Try each endpoint up to `max_retries` times, backing off between
    /// attempts. Returns the first connection that comes up.
    pub async fn connect(&self) -> Result<Connection, ConnectFailed> {
        let mut rng = StdRng::from_entropy();
        let mut attempts = 0;
        let mut last_error = TransportError::NotConnected;

        if self.endpoints.is_empty() {
            log::error!("no relay endpoints configured");
        }

        'endpoints: for endpoint in &self.endpoints {
            for attempt in 0..self.policy.max_retries {
                if self.shutdown.is_cancelled() {
                    return self.give_up(TransportError::Cancelled, attempts);
                }
                self.state.send_replace(SupervisorState::Connecting {
                    endpoint: endpoint.clone(),
                    attempt,
                });
                attempts += 1;

                let mut conn = Connection::new(self.peer_id.clone(), endpoint.clone());
                match conn.connect(&self.transport, &self.shutdown).await {
                    Ok(()) => {
                        self.state.send_replace(SupervisorState::Connected {
                            endpoint: endpoint.clone(),
                        });
                        return Ok(conn);
                    }
                    Err(e) => {
                        conn.dispose().await;
                        log::warn!(
                            "connect to {} failed (attempt {}/{}): {}",
                            endpoint,
                            attempt + 1,
                            self.policy.max_retries,
                            e
                        );
                        if e == TransportError::Cancelled {
                            return self.give_up(e, attempts);
                        }
                        let permanent = e.is_permanent();
                        last_error = e;
                        if permanent {
                            continue 'endpoints;
                        }
                    }
                }

                if attempt + 1 < self.policy.max_retries {
                    let delay = self.policy.delay(attempt, &mut rng);
                    log::info!("retrying {} in {:?}", endpoint, delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return self.give_up(TransportError::Cancelled, attempts);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.give_up(last_error, attempts)
    }

    fn give_up(&self, last_error: TransportError, attempts: u32) -> Result<Connection, ConnectFailed> {
        self.state.send_replace(SupervisorState::Failed);
        let failed = ConnectFailed {
            last_error,
            attempts,
        };
        log::error!("{}", failed);
        Err(failed)
    }

    /// Run [`connect`](Self::connect) as a background task.
    pub fn spawn(self) -> JoinHandle<Result<Connection, ConnectFailed>> {
        tokio::spawn(async move { self.connect().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_retries: 8,
            jitter: 0.25,
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = policy();
        let delays: Vec<Duration> = (0..policy.max_retries).map(|a| policy.base_delay(a)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?}", delays);
        }
        assert!(delays.iter().all(|d| *d <= policy.max_delay));
        assert_equal!(delays[0], Duration::from_millis(500));
        assert_equal!(delays[3], Duration::from_secs(4));
        assert_equal!(delays[7], Duration::from_secs(10));
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let policy = policy();
        assert_equal!(policy.base_delay(40), policy.max_delay);
        assert_equal!(policy.base_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..policy.max_retries {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let d = policy.delay(attempt, &mut rng);
                assert!(d >= base.mul_f64(0.75) && d <= base.mul_f64(1.25), "{:?} vs {:?}", d, base);
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..policy()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_equal!(policy.delay(2, &mut rng), Duration::from_secs(2));
    }

    #[test]
    fn degenerate_policies_do_not_panic() {
        let mut rng = StdRng::seed_from_u64(3);
        let nan = BackoffPolicy {
            jitter: f64::NAN,
            ..policy()
        };
        assert_equal!(nan.delay(1, &mut rng), Duration::from_secs(1));

        let huge = BackoffPolicy {
            base: Duration::MAX,
            max_delay: Duration::MAX,
            max_retries: 3,
            jitter: 1.0,
        };
        for attempt in 0..3 {
            let _ = huge.delay(attempt, &mut rng);
        }
    }

    #[tokio::test]
    async fn exhausting_every_endpoint_reports_last_error() {
        let supervisor = ReconnectSupervisor::new(
            "p",
            vec![
                "ws://127.0.0.1:1/ws/peer".to_string(),
                "http://not-a-websocket/ws/peer".to_string(),
            ],
            BackoffPolicy {
                base: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_retries: 3,
                jitter: 0.25,
            },
            TransportConfig::default(),
            CancellationToken::new(),
        );
        let err = supervisor.connect().await.unwrap_err();
        // Three tries against the closed port, one against the bad scheme.
        assert_equal!(err.attempts, 4);
        assert!(matches!(err.last_error, TransportError::InvalidUri(..)));
        assert_equal!(supervisor.state(), SupervisorState::Failed);
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let shutdown = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(
            "p",
            vec!["ws://127.0.0.1:1/ws/peer".to_string()],
            BackoffPolicy {
                base: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                max_retries: 5,
                jitter: 0.0,
            },
            TransportConfig::default(),
            shutdown.clone(),
        );
        let task = supervisor.spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor should stop promptly")
            .unwrap()
            .unwrap_err();
        assert_equal!(err.last_error, TransportError::Cancelled);
    }
}
