use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SESSION_TOKEN_PREFIX;

/// Payload of a `Connect` envelope.
///
/// An empty `target_id` asks the relay to match by `auth_token` alone: either
/// against a peer that registered the same token, or, for a session token,
/// against the server the session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub requester_id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub auth_token: String,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionRequest {
    pub fn new(
        requester_id: impl Into<String>,
        target_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            requester_id: requester_id.into(),
            target_id: target_id.into(),
            auth_token: auth_token.into(),
            timestamp: Utc::now(),
        }
    }

    /// Token of the form `session:<key>`.
    pub fn for_session(requester_id: impl Into<String>, session_key: &str) -> Self {
        Self::new(
            requester_id,
            String::new(),
            format!("{SESSION_TOKEN_PREFIX}{session_key}"),
        )
    }

    /// The web session key, if the auth token references one.
    pub fn session_key(&self) -> Option<&str> {
        self.auth_token.strip_prefix(SESSION_TOKEN_PREFIX)
    }

    pub fn is_targeted(&self) -> bool {
        !self.target_id.is_empty()
    }
}

/// Payload of a `ConnectResponse` (or of a `RegisterToken` echo) written by
/// the relay or by the accepting peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Peer id of the side that accepted, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

impl ConnectReply {
    pub fn accepted(peer_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason: None,
            peer_id: Some(peer_id.into()),
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            peer_id: None,
        }
    }
}

/// Payload of a `RegisterToken` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRegistration {
    pub auth_token: String,
}

/// Payload of a `Disconnect` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectNotice {
    pub reason: String,
}

impl DisconnectNotice {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
