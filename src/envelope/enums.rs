//! Core enumerations for envelopes.

use serde::{Deserialize, Serialize};

/// Which way an envelope travels relative to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From the external channel into the core.
    Inbound,
    /// From the core out to the channel or observers.
    Outbound,
}

/// Envelope body. Opaque to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Structured(serde_json::Value),
}

impl Payload {
    /// Text view of the body. Structured bodies render as compact JSON.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Payload::Text(s) => std::borrow::Cow::Borrowed(s.as_str()),
            Payload::Structured(v) => std::borrow::Cow::Owned(v.to_string()),
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Structured(v)
    }
}
