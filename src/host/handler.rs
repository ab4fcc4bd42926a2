//! Dispatches bridge commands to the [`Router`].
//!
//! Search and index commands always answer `ok: true` once the payload
//! parses; the engine's own `status` and `errors` fields inside the payload
//! report provider or deadline failures. `ok: false` is reserved for
//! envelope and payload problems.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uir_search::{
    HybridSearchRequest, IndexRequest, Router, SearchRequest, VectorSearchRequest,
};

use crate::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InvalidatePayload {
    pattern: Option<String>,
}

/// Command handler bound to one router.
#[derive(Clone)]
pub struct HostHandler {
    router: Arc<Router>,
}

impl HostHandler {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Handle one envelope and build its response.
    pub async fn handle(&self, envelope: CommandEnvelope) -> ResponseEnvelope {
        if let Err(e) = envelope.validate() {
            return ResponseEnvelope::error(envelope.request_id, e.to_string());
        }
        let request_id = envelope.request_id.clone();
        tracing::debug!(%request_id, command = envelope.command.as_str(), "bridge command");

        match self.dispatch(envelope.command, envelope.payload).await {
            Ok(payload) => ResponseEnvelope::ok(request_id, payload),
            Err(message) => {
                tracing::warn!(%request_id, error = %message, "bridge command rejected");
                ResponseEnvelope::error(request_id, message)
            }
        }
    }

    async fn dispatch(&self, command: CommandName, payload: Value) -> Result<Value, String> {
        match command {
            CommandName::HostPing => Ok(json!({ "pong": true })),
            CommandName::HostVersion => Ok(json!({ "version": env!("CARGO_PKG_VERSION") })),
            CommandName::HostStop => Ok(json!({ "stopping": true })),
            CommandName::Search => {
                let request: SearchRequest = parse(command, payload)?;
                to_payload(&self.router.handle_search(&request, None).await)
            }
            CommandName::VectorSearch => {
                let request: VectorSearchRequest = parse(command, payload)?;
                to_payload(&self.router.handle_vector_search(&request, None).await)
            }
            CommandName::HybridSearch => {
                let request: HybridSearchRequest = parse(command, payload)?;
                to_payload(&self.router.handle_hybrid_search(&request, None).await)
            }
            CommandName::Index => {
                let request: IndexRequest = parse(command, payload)?;
                to_payload(&self.router.handle_index(&request, None).await)
            }
            CommandName::Stats => to_payload(&self.router.stats().await),
            CommandName::CacheInvalidate => {
                let request: InvalidatePayload = if payload.is_null() {
                    InvalidatePayload::default()
                } else {
                    parse(command, payload)?
                };
                let removed = self.router.invalidate_cache(request.pattern.as_deref()).await;
                Ok(json!({ "removed": removed }))
            }
        }
    }
}

fn parse<T: DeserializeOwned>(command: CommandName, payload: Value) -> Result<T, String> {
    serde_json::from_value(payload)
        .map_err(|e| format!("invalid {} payload: {e}", command.as_str()))
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("failed to serialize response: {e}"))
}
