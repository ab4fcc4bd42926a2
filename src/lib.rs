//! uir: unified information retrieval host.
//!
//! Wraps the [`uir_search`] orchestration engine in a small application:
//!
//! - **Config**: `config.toml` under the platform config directory
//! - **Providers**: built-in in-memory document store with keyword and
//!   vector search
//! - **Embedding**: deterministic feature-hashing embedder for text vector
//!   queries
//! - **Bridge**: newline-delimited JSON over stdin/stdout (`uir-host`)

pub mod config;
pub mod embedding;
pub mod error;
pub mod host;
pub mod providers;
pub mod startup;
pub mod uir_dirs;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use startup::build_router;
