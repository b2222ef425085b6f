//! Round-robin selection of the relay backend a new web session is pinned to.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayBackend {
    pub name: String,
    pub url: String,
}

impl RelayBackend {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolConfigError {
    #[error("relay backend entry {0:?} has an empty name")]
    EmptyName(String),
    #[error("relay backend entry {0:?} has an invalid url")]
    InvalidUrl(String),
}

/// Statically configured backends, read-only after startup. The cursor is
/// the only moving part and needs no lock.
#[derive(Debug)]
pub struct RelayPool {
    backends: Vec<RelayBackend>,
    fallback: RelayBackend,
    next: AtomicUsize,
}

impl RelayPool {
    pub fn new(backends: Vec<RelayBackend>, fallback: RelayBackend) -> Self {
        Self {
            backends,
            fallback,
            next: AtomicUsize::new(0),
        }
    }

    /// Parse `name=url,name=url`. An entry without `name=` is named after
    /// its position (`relay-1`, `relay-2`, ...).
    pub fn parse_backends(list: &str) -> Result<Vec<RelayBackend>, PoolConfigError> {
        let mut out = Vec::new();
        for (idx, entry) in list
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .enumerate()
        {
            let (name, url) = match entry.split_once('=') {
                Some((name, url)) => (name.trim().to_string(), url.trim()),
                None => (format!("relay-{}", idx + 1), entry),
            };
            if name.is_empty() {
                return Err(PoolConfigError::EmptyName(entry.to_string()));
            }
            if Url::parse(url).is_err() {
                return Err(PoolConfigError::InvalidUrl(entry.to_string()));
            }
            out.push(RelayBackend::new(name, url));
        }
        Ok(out)
    }

    /// Next backend in round-robin order. With no backends configured the
    /// fallback (normally this relay itself) is returned.
    pub fn select(&self) -> RelayBackend {
        if self.backends.is_empty() {
            return self.fallback.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        self.backends[idx].clone()
    }

    pub fn backends(&self) -> &[RelayBackend] {
        &self.backends
    }

    pub fn fallback(&self) -> &RelayBackend {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
