//! Wire types: the server→client envelope and client→server control frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Registry key: the client's wallet address.
///
/// Opaque to the core; the handshake layer validates and lowercases it
/// before it gets here. At most one live session is bound to an address
/// at any instant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique per-connection identifier.
///
/// Distinguishes a session from the one that may later displace it at
/// the same address, so a stale teardown never evicts the replacement.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl Default for SessionId {
    fn default() -> Self {
        Self(format!("sess_{}", Uuid::now_v7()))
    }
}

impl SessionId {
    /// Generate a fresh session id.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server→client message: `{"type": ..., "data": ..., "timestamp": ...}`.
///
/// Immutable once constructed; serialized once per delivery and shared
/// read-only across recipients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Message tag, passed through verbatim for application types.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    pub data: Value,
    /// Creation time, RFC3339 on the wire.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// The synthetic welcome message, first on every fresh queue.
    pub fn connected(address: &Address) -> Self {
        Self::new(
            "connected",
            json!({ "address": address, "status": "connected" }),
        )
    }

    /// Reply to a client `ping` control frame.
    pub fn pong() -> Self {
        Self::new("pong", json!({ "status": "ok" }))
    }
}

/// Client→server control frame: `{"type": ..., ...opaque}`.
///
/// Consumed and discarded after handling. Unknown fields are retained
/// for forward compatibility but currently unused.
#[derive(Debug, Deserialize)]
pub struct ControlFrame {
    /// Frame tag. Recognized: `ping`, `subscribe`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Everything else the client sent.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}
