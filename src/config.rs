//! Configuration file support
//!
//! Config file location: ~/.config/leann/config.toml
//!
//! Example config:
//! ```toml
//! [embedding]
//! dimension = 384
//! batch_size = 64
//!
//! [build]
//! backend = "hnsw"
//! m = 16
//! ef_construction = 200
//! workers = 4
//!
//! [search]
//! ef_search = 64
//! alpha = 0.0
//! cache_capacity = 4096
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI defaults loaded from the user's config file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

/// Embedding defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Vector dimension for the built-in hashing provider
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Batch size for embedding requests
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_dimension() -> usize {
    384
}

fn default_batch_size() -> usize {
    64
}

/// Build defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_backend")]
    pub backend: String,

    /// HNSW out-degree bound
    #[serde(default = "default_m")]
    pub m: usize,

    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Embedding worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            m: default_m(),
            ef_construction: default_ef_construction(),
            workers: default_workers(),
        }
    }
}

fn default_backend() -> String {
    "hnsw".to_string()
}

fn default_m() -> usize {
    16
}

fn default_ef_construction() -> usize {
    200
}

fn default_workers() -> usize {
    4
}

/// Search defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    /// Hybrid weight (0 = vector only)
    #[serde(default)]
    pub alpha: f32,

    /// Recompute LRU cache capacity, in vectors
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ef_search: default_ef_search(),
            alpha: 0.0,
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_ef_search() -> usize {
    64
}

fn default_cache_capacity() -> usize {
    4096
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("leann")
            .join("config.toml")
    }

    /// Load config from file, returning defaults if not found
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::debug!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file: {}", e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config file: {}", e);
                }
            }
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.build.m, 16);
        assert_eq!(config.search.ef_search, 64);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[embedding]
dimension = 768

[build]
backend = "vamana"
workers = 8

[search]
alpha = 0.3
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.embedding.dimension, 768);
        assert_eq!(config.build.backend, "vamana");
        assert_eq!(config.build.workers, 8);
        assert!((config.search.alpha - 0.3).abs() < 1e-6);
        // Unspecified sections fall back to defaults
        assert_eq!(config.build.m, 16);
    }
}
