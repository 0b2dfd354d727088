//! # Arbor Types
//!
//! Shared primitive types, the error taxonomy, and configuration structures
//! used across the Arbor workspace.
//!
//! The cache manager and the native engine agree on two primitives: token
//! identifiers and opaque cache handles. Both are plain integers at the C
//! boundary, so they stay plain integers here.

pub mod config;
pub mod errors;

pub use config::{CacheConfig, Config, LoggingConfig, ModelConfig, ServerConfig};
pub use errors::{ArborError, Result};

/// Token identifier produced by the tokenizer.
pub type TokenId = u32;

/// Opaque KV cache handle owned by the native engine.
///
/// Handles are acquired from `forward_with_cache` / `slice_cache` and must be
/// released exactly once via `free_cache`. The engine tolerates double-free.
pub type CacheHandle = u64;

/// The reserved handle for the empty root cache.
pub const ROOT_CACHE_HANDLE: CacheHandle = 0;
