//! Web session registry.
//!
//! A web session lets a browser-initiated flow reach one specific server
//! without a pre-shared token. Sessions are keyed by an unguessable key,
//! pinned to one relay backend at creation, and optionally redeemable once.
//!
//! The key -> session map sits behind a single mutex. Every check that
//! involves time takes the caller's `now` once, so expiry and redemption are
//! decided against the same instant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::pool::{RelayBackend, RelayPool};

pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 30;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Random bytes in a hex session key.
const SESSION_KEY_BYTES: usize = 16;

/// Attempts at drawing a key not already live before giving up.
const MAX_KEY_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    /// 16 random bytes, hex encoded.
    #[default]
    Hex,
    /// Six decimal digits, only for flows where a human types the key.
    Numeric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_key: String,
    pub session_name: String,
    pub server_id: String,
    pub created_at: DateTime<Utc>,
    /// `None` means the session lives until the process exits.
    pub expires_at: Option<DateTime<Utc>>,
    pub one_time_session: bool,
    pub used: bool,
    pub assigned_relay: RelayBackend,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    fn is_spent(&self) -> bool {
        self.one_time_session && self.used
    }
}

/// Parameters for [`SessionRegistry::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub server_id: String,
    pub session_name: Option<String>,
    /// `None` or a non-positive value: never expires.
    pub ttl_minutes: Option<i64>,
    pub one_time: bool,
    pub key_format: KeyFormat,
}

impl NewSession {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            session_name: None,
            ttl_minutes: Some(DEFAULT_SESSION_TTL_MINUTES),
            one_time: true,
            key_format: KeyFormat::Hex,
        }
    }

    pub fn ttl_minutes(mut self, ttl: Option<i64>) -> Self {
        self.ttl_minutes = ttl;
        self
    }

    pub fn one_time(mut self, one_time: bool) -> Self {
        self.one_time = one_time;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    pub fn key_format(mut self, format: KeyFormat) -> Self {
        self.key_format = format;
        self
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown session key")]
    Invalid,
    #[error("session has expired")]
    Expired,
    #[error("one-time session was already used")]
    AlreadyUsed,
}

impl SessionError {
    /// Stable reason string reported to HTTP callers.
    pub fn reason(&self) -> &'static str {
        match self {
            SessionError::Invalid => "Invalid",
            SessionError::Expired => "Expired",
            SessionError::AlreadyUsed => "AlreadyUsed",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreateError {
    #[error("server id must not be empty")]
    MissingServerId,
    #[error("session ttl of {0} minutes is out of range")]
    InvalidTtl(i64),
    #[error("could not allocate an unused session key")]
    KeySpaceExhausted,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    pool: Arc<RelayPool>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<RelayPool>) -> Self {
        Self {
            sessions: Mutex::default(),
            pool,
        }
    }

    pub async fn create(&self, request: NewSession) -> Result<Session, CreateError> {
        self.create_at(request, Utc::now()).await
    }

    pub async fn create_at(
        &self,
        request: NewSession,
        now: DateTime<Utc>,
    ) -> Result<Session, CreateError> {
        let server_id = request.server_id.trim().to_string();
        if server_id.is_empty() {
            return Err(CreateError::MissingServerId);
        }

        let expires_at = match request.ttl_minutes {
            Some(minutes) if minutes > 0 => Some(
                chrono::Duration::try_minutes(minutes)
                    .and_then(|ttl| now.checked_add_signed(ttl))
                    .ok_or(CreateError::InvalidTtl(minutes))?,
            ),
            _ => None,
        };

        let mut sessions = self.sessions.lock().await;
        let session_key = (0..MAX_KEY_ATTEMPTS)
            .map(|_| generate_key(request.key_format))
            .find(|key| !sessions.contains_key(key))
            .ok_or(CreateError::KeySpaceExhausted)?;

        let session = Session {
            session_name: request
                .session_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{server_id} session")),
            session_key: session_key.clone(),
            server_id,
            created_at: now,
            expires_at,
            one_time_session: request.one_time,
            used: false,
            assigned_relay: self.pool.select(),
        };
        sessions.insert(session_key, session.clone());

        log::info!(
            "session created key={}.. server_id={} one_time={} expires_at={:?} relay={}",
            redact(&session.session_key),
            session.server_id,
            session.one_time_session,
            session.expires_at,
            session.assigned_relay.name
        );
        Ok(session)
    }

    /// Redeem a session. A one-time session succeeds exactly once; the
    /// check and the `used` flip happen under one lock acquisition.
    pub async fn validate(&self, key: &str) -> Result<Session, SessionError> {
        self.validate_at(key, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let result = match sessions.get_mut(key) {
            None => Err(SessionError::Invalid),
            Some(session) if session.is_expired_at(now) => Err(SessionError::Expired),
            Some(session) if session.is_spent() => Err(SessionError::AlreadyUsed),
            Some(session) => {
                if session.one_time_session {
                    session.used = true;
                }
                Ok(session.clone())
            }
        };
        if matches!(result, Err(SessionError::Expired)) {
            sessions.remove(key);
        }

        match &result {
            Ok(s) => log::info!(
                "session validated key={}.. server_id={}",
                redact(key),
                s.server_id
            ),
            Err(e) => log::info!("session rejected key={}.. reason={}", redact(key), e.reason()),
        }
        result
    }

    /// Same checks as [`validate`](Self::validate) without consuming a
    /// one-time session.
    pub async fn peek(&self, key: &str) -> Result<Session, SessionError> {
        self.peek_at(key, Utc::now()).await
    }

    pub async fn peek_at(&self, key: &str, now: DateTime<Utc>) -> Result<Session, SessionError> {
        let sessions = self.sessions.lock().await;
        match sessions.get(key) {
            None => Err(SessionError::Invalid),
            Some(session) if session.is_expired_at(now) => Err(SessionError::Expired),
            Some(session) if session.is_spent() => Err(SessionError::AlreadyUsed),
            Some(session) => Ok(session.clone()),
        }
    }

    /// Drop expired sessions, plus spent one-time sessions that would
    /// otherwise never expire. Spent sessions with an expiry are kept until
    /// then so a replay reports `AlreadyUsed` rather than `Invalid`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now) && !(s.is_spent() && s.expires_at.is_none()));
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Run [`sweep_at`](Self::sweep_at) every `every` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep_at(Utc::now()).await;
                        if removed > 0 {
                            log::info!("session sweep removed {} entries", removed);
                        }
                    }
                }
            }
            log::debug!("session sweeper stopped");
        })
    }
}

fn generate_key(format: KeyFormat) -> String {
    match format {
        KeyFormat::Hex => {
            let mut bytes = [0u8; SESSION_KEY_BYTES];
            OsRng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        }
        KeyFormat::Numeric => format!("{:06}", OsRng.gen_range(0..1_000_000u32)),
    }
}

/// Leading characters of a key, enough to correlate log lines.
fn redact(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(4)
        .map(|(idx, _)| idx)
        .unwrap_or(key.len());
    &key[..end]
}
