//! Error types for Arbor operations
//!
//! One variant per failure class in the coordinator. The enum is `Clone` so a
//! single engine failure can fan out through a readiness gate to every
//! coalesced waiter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Arbor operations
pub type Result<T> = std::result::Result<T, ArborError>;

/// Main error type for the Arbor coordinator
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArborError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed or invalid client requests
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Tokenization failures
    #[error("Tokenizer error: {message}")]
    Tokenizer { message: String },

    /// Cache budget exhausted and the evictor could not free space
    #[error("Cache capacity exhausted: {message}")]
    CacheCapacity { message: String },

    /// Native engine reported a failure for a forward or slice call
    #[error("Engine error: {message}")]
    Engine { message: String },

    /// The model is not loaded (startup incomplete or load failed)
    #[error("Model not loaded: {message}")]
    ModelNotLoaded { message: String },

    /// Request was cancelled by the client or a timeout
    #[error("Request cancelled: {message}")]
    Cancelled { message: String },

    /// Internal invariant violations (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ArborError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a tokenizer error
    pub fn tokenizer(message: impl Into<String>) -> Self {
        Self::Tokenizer {
            message: message.into(),
        }
    }

    /// Create a cache capacity error
    pub fn cache_capacity(message: impl Into<String>) -> Self {
        Self::CacheCapacity {
            message: message.into(),
        }
    }

    /// Create an engine error
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Create a model-not-loaded error
    pub fn model_not_loaded(message: impl Into<String>) -> Self {
        Self::ModelNotLoaded {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the client may retry the request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheCapacity { .. } | Self::ModelNotLoaded { .. })
    }
}
