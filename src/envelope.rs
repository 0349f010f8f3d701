//! Relay envelope codec
//!
//! Every frame the relay writes to a peer is a JSON envelope:
//!
//! - `{"type":"connect","body":"<identity>"}`: a channel came online
//! - `{"type":"disconnect","body":"<identity>"}`: a channel went away
//! - `{"type":"broadcast","body":"<text>"}`: a message relayed from a channel

use serde::{Deserialize, Serialize};

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Broadcast,
    Connect,
    Disconnect,
}

/// `{type, body}` wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub body: String,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// A message relayed from a channel to its subscribers
    pub fn broadcast(body: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Broadcast, body)
    }

    /// Lifecycle notice: `identity` registered
    pub fn connect(identity: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Connect, identity)
    }

    /// Lifecycle notice: `identity` unregistered
    pub fn disconnect(identity: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Disconnect, identity)
    }

    /// Encode to compact JSON text
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    /// Decode from JSON text
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(EnvelopeError::Decode)
    }
}

/// Envelope codec errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}
