use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest text frame accepted on the control channel.
pub const MAX_ENVELOPE_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
    #[error("frame length {0} exceeds max {MAX_ENVELOPE_LEN}")]
    TooLarge(usize),
    #[error("malformed json: {0}")]
    Malformed(String),
}

impl ParseError {
    pub(crate) fn malformed(err: serde_json::Error) -> Self {
        ParseError::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    /// Requester -> Relay -> Target: "pair me with this peer"
    Connect,
    /// Target -> Relay -> Requester, or Relay -> Requester on refusal
    ConnectResponse,
    IceCandidate,
    SessionDescription,
    /// Peer -> Relay: "accept any Connect carrying this token"
    RegisterToken,
    /// Either side -> Relay -> partner: "this pairing is over"
    Disconnect,
}

impl EnvelopeType {
    /// Types the relay forwards verbatim to the partner of an existing pairing.
    pub fn is_forwarded(self) -> bool {
        matches!(
            self,
            EnvelopeType::ConnectResponse
                | EnvelopeType::IceCandidate
                | EnvelopeType::SessionDescription
        )
    }
}

/// The outer structure of every frame on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub typ: EnvelopeType,
    pub connection_id: String,
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    pub fn new(typ: EnvelopeType, connection_id: impl Into<String>, payload: String) -> Self {
        Self {
            typ,
            connection_id: connection_id.into(),
            payload,
        }
    }

    /// Build an envelope whose payload is the JSON encoding of `payload`.
    pub fn with_payload<T: Serialize>(
        typ: EnvelopeType,
        connection_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(typ, connection_id, serde_json::to_string(payload)?))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a raw frame. Never panics; anything that is not a well formed
    /// envelope yields an error for the caller to log and drop.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() > MAX_ENVELOPE_LEN {
            return Err(ParseError::TooLarge(bytes.len()));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)?;
        Self::decode_str(text)
    }

    pub fn decode_str(text: &str) -> Result<Self, ParseError> {
        if text.len() > MAX_ENVELOPE_LEN {
            return Err(ParseError::TooLarge(text.len()));
        }
        serde_json::from_str(text).map_err(ParseError::malformed)
    }

    /// Interpret the payload as a typed JSON value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ParseError> {
        serde_json::from_str(&self.payload).map_err(ParseError::malformed)
    }
}
