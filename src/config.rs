//! Host configuration, stored as TOML.
//!
//! ```toml
//! [engine]
//! default_timeout_ms = 3000
//!
//! [cache]
//! redis_url = "redis://127.0.0.1/"
//!
//! [providers.notes]
//! policy = { timeout_ms = 500 }
//! backend = { type = "memory" }
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uir_search::{Document, EngineConfig, ProviderPolicy};

use crate::error::{AppError, Result};

/// Complete host configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Shared cache tier settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis URL for the shared tier. Local-only when unset.
    pub redis_url: Option<String>,
}

/// Built-in hash embedder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dimensions: 64,
        }
    }
}

/// One configured provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub policy: ProviderPolicy,
    pub backend: BackendConfig,
}

/// Backend behind a provider name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process document store, optionally seeded.
    Memory {
        #[serde(default)]
        documents: Vec<Document>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Memory {
            documents: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`AppConfig::from_file`], but a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            Ok(Self::default())
        }
    }

    /// Check engine and provider settings.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`] naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        for (name, provider) in &self.providers {
            provider.policy.validate(name)?;
        }
        if self.embedding.enabled && self.embedding.dimensions == 0 {
            return Err(AppError::Config(
                "embedding.dimensions must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Save atomically: write a sibling temp file, fsync, then rename over
    /// `path`. Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;

        let tmp_path = temp_path(path);
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            AppError::Config(format!(
                "failed promoting config temp file {} -> {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })?;
        Ok(())
    }

    /// Returns the default config file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::uir_dirs::config_file()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "config.toml".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.providers.is_empty());
        assert!(config.cache.redis_url.is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.engine.default_timeout_ms = 1234;
        config.cache.redis_url = Some("redis://127.0.0.1/".into());
        config.providers.insert(
            "notes".into(),
            ProviderConfig {
                policy: ProviderPolicy {
                    timeout_ms: 250,
                    ..ProviderPolicy::default()
                },
                backend: BackendConfig::default(),
            },
        );

        config.save_to_file(&path).expect("save");
        assert!(path.exists());
        assert!(!temp_path(&path).exists());

        let loaded = AppConfig::from_file(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[engine]
rrf_k = 30.0

[providers.docs]
policy = { timeout_ms = 900 }
backend = { type = "memory", documents = [{ id = "d1", content = "rust async" }] }
"#,
        )
        .expect("write");

        let config = AppConfig::from_file(&path).expect("load");
        assert!((config.engine.rrf_k - 30.0).abs() < f64::EPSILON);
        assert_eq!(
            config.engine.default_timeout_ms,
            EngineConfig::default().default_timeout_ms
        );
        let docs = &config.providers["docs"];
        assert_eq!(docs.policy.timeout_ms, 900);
        let BackendConfig::Memory { documents } = &docs.backend;
        assert_eq!(documents[0].id, "d1");
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[providers.bad.policy]\ntimeout_ms = 0\n").expect("write");
        assert!(AppConfig::from_file(&path).is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn invalid_toml_returns_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not [valid toml").expect("write");
        assert!(matches!(AppConfig::from_file(&path), Err(AppError::Config(_))));
    }
}
