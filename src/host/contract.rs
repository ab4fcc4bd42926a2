//! Versioned command/response envelopes for the JSON bridge.

use serde::{Deserialize, Serialize};

/// Contract version for bridge envelopes.
pub const CONTRACT_VERSION: u32 = 1;

/// Commands the bridge accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "host.version")]
    HostVersion,
    #[serde(rename = "host.stop")]
    HostStop,
    #[serde(rename = "search")]
    Search,
    #[serde(rename = "search.vector")]
    VectorSearch,
    #[serde(rename = "search.hybrid")]
    HybridSearch,
    #[serde(rename = "index")]
    Index,
    #[serde(rename = "stats")]
    Stats,
    #[serde(rename = "cache.invalidate")]
    CacheInvalidate,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::HostVersion => "host.version",
            Self::HostStop => "host.stop",
            Self::Search => "search",
            Self::VectorSearch => "search.vector",
            Self::HybridSearch => "search.hybrid",
            Self::Index => "index",
            Self::Stats => "stats",
            Self::CacheInvalidate => "cache.invalidate",
        }
    }
}

/// A versioned command envelope from client -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != CONTRACT_VERSION {
            return Err(ContractError::UnsupportedVersion {
                got: self.v,
                expected: CONTRACT_VERSION,
            });
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::InvalidEnvelope(
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A versioned response envelope from host -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a successful response envelope.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    /// Build an error response envelope.
    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// Envelope validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("unsupported contract version {got}; expected {expected}")]
    UnsupportedVersion { got: u32, expected: u32 },
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}
