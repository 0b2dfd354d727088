//! Configuration for the Arbor server
//!
//! Mirrors the CLI surface: listen address, model location, vocabulary size,
//! cache token budget, and log level.

use crate::errors::{ArborError, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration assembled from CLI flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Model configuration
    pub model: ModelConfig,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8080"
    pub addr: String,
}

/// Model and engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the model weights directory; empty selects the mock engine
    pub path: String,
    /// Tokenizer vocabulary size (also the logits buffer length)
    pub vocab_size: usize,
}

/// Prefix cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of tokens held in the trie before eviction
    pub max_tokens: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            vocab_size: 32000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_tokens: 100_000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.is_empty() {
            return Err(ArborError::config("server address must not be empty"));
        }
        if self.model.vocab_size == 0 {
            return Err(ArborError::config("vocab size must be positive"));
        }
        if self.cache.max_tokens == 0 {
            return Err(ArborError::config("cache token budget must be positive"));
        }
        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ArborError::config(format!("unknown log level: {}", other)));
            }
        }
        Ok(())
    }
}
