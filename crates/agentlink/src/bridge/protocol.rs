//! Wire types for controller-agent communication.
//!
//! Two channels:
//! - **Command channel** (request-reply): enveloped `CommandMessage` out, opaque reply back
//! - **Event channel** (subscribe): raw event names, no envelope

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

use crate::error::ChannelError;

/// A named operation plus keyed parameters.
///
/// The payload meaning belongs to the command vocabulary; this crate only
/// moves it. Parameter keys are kept sorted, so encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    name: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    params: serde_json::Map<String, serde_json::Value>,
}

impl CommandMessage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Map::new(),
        }
    }

    /// Add a parameter from any serializable value.
    ///
    /// Fails with [`ChannelError::Encode`] when the value has no JSON form
    /// (e.g. a map with non-string keys, or a NaN or infinite float).
    pub fn with_param(
        mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, ChannelError> {
        let key = key.into();
        super::finite::check(&value)
            .map_err(|e| ChannelError::encode(format!("parameter '{key}': {e}")))?;
        let value = serde_json::to_value(value)
            .map_err(|e| ChannelError::encode(format!("parameter '{key}': {e}")))?;
        self.params.insert(key, value);
        Ok(self)
    }

    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.params.is_empty() {
            write!(f, " ({} params)", self.params.len())?;
        }
        Ok(())
    }
}

/// Opaque reply payload returned by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    payload: Bytes,
}

impl CommandResponse {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }

    /// Text view of the payload; invalid UTF-8 is replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Name of a state transition the agent has entered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Interpret a raw event frame as-is. Invalid UTF-8 is replaced, never rejected.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self(String::from_utf8_lossy(payload).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Correlates a request frame with its reply.
///
/// Every send gets a fresh id; a reply carrying any other id is a late answer
/// to an earlier attempt and gets dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u32);

impl RequestId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
