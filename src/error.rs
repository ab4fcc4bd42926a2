//! Error types for the uir host.

/// Top-level error type for the host application.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Configuration file could not be parsed or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Engine construction or engine-level error.
    #[error("engine error: {0}")]
    Engine(#[from] uir_search::SearchError),

    /// Shared cache tier could not be set up.
    #[error("cache error: {0}")]
    Cache(String),

    /// Bridge protocol error.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AppError>;
