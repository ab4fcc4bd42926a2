//! Turns an [`AppConfig`] into a running [`Router`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uir_search::{Embedder, ProviderAdapter, RedisSharedCache, Router, RouterBuilder};

use crate::config::{AppConfig, BackendConfig};
use crate::embedding::HashEmbedder;
use crate::error::{AppError, Result};
use crate::providers::InMemoryProvider;

/// Build the router described by `config`, seeding built-in backends.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the Redis URL cannot
/// be parsed, or seeding a backend fails.
pub async fn build_router(config: &AppConfig) -> Result<Router> {
    config.validate()?;

    let embedder: Option<Arc<dyn Embedder>> = config
        .embedding
        .enabled
        .then(|| Arc::new(HashEmbedder::new(config.embedding.dimensions)) as Arc<dyn Embedder>);

    let mut builder = RouterBuilder::new(config.engine.clone());
    for (name, provider) in &config.providers {
        let adapter = build_backend(name, &provider.backend, embedder.clone(), config).await?;
        builder = builder.provider(adapter, provider.policy.clone());
    }

    if let Some(url) = &config.cache.redis_url {
        let shared = RedisSharedCache::new(url).map_err(|e| AppError::Cache(e.to_string()))?;
        tracing::info!("shared cache tier enabled");
        builder = builder.shared_cache(Arc::new(shared));
    }
    if let Some(embedder) = embedder {
        builder = builder.embedder(embedder);
    }
    Ok(builder.build()?)
}

async fn build_backend(
    name: &str,
    backend: &BackendConfig,
    embedder: Option<Arc<dyn Embedder>>,
    config: &AppConfig,
) -> Result<Arc<dyn ProviderAdapter>> {
    match backend {
        BackendConfig::Memory { documents } => {
            let mut provider = InMemoryProvider::new(name);
            if let Some(embedder) = embedder {
                provider = provider.with_embedder(embedder);
            }
            if !documents.is_empty() {
                let deadline =
                    Instant::now() + Duration::from_millis(config.engine.default_timeout_ms);
                let count = provider
                    .index(documents, None, deadline)
                    .await
                    .map_err(|e| AppError::Config(format!("seeding provider {name}: {e}")))?;
                tracing::debug!(provider = name, count, "seeded in-memory provider");
            }
            Ok(Arc::new(provider))
        }
    }
}

/// Start the background health heartbeat unless it is disabled.
///
/// Cancel `cancel` to stop it.
pub fn spawn_health_monitor(
    router: &Router,
    config: &AppConfig,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if config.engine.health_check_interval_secs == 0 {
        return None;
    }
    let interval = Duration::from_secs(config.engine.health_check_interval_secs);
    Some(Arc::clone(router.manager()).spawn_health_monitor(interval, cancel))
}
