//! # Arbor Engine
//!
//! The boundary between the cache manager and the native inference runtime.
//!
//! The runtime owns the model weights and every KV cache; this crate only
//! sees opaque 64-bit handles. Four primitives cross the boundary:
//!
//! - `forward_with_cache` — extend a cache by some tokens, get back logits
//!   for the last position and a fresh handle
//! - `slice_cache` — O(1) copy-on-write view of a cache prefix
//! - `free_cache` — release a handle (idempotent, safe on handle 0)
//! - `load_model` — one-shot startup call
//!
//! The real implementation ([`MetalEngine`], behind the `metal` feature)
//! links against `libarbor_metal`; [`MockEngine`] stands in for it during
//! tests and model-less development runs.

pub mod mock;

#[cfg(feature = "metal")]
mod ffi;
#[cfg(feature = "metal")]
pub mod metal;

pub use mock::MockEngine;

#[cfg(feature = "metal")]
pub use metal::MetalEngine;

use arbor_types::{CacheHandle, Result, TokenId};

/// Operations the cache manager consumes from the native runtime.
///
/// Concurrent calls on *different* base handles are safe. Concurrent calls on
/// the *same* base handle are the caller's responsibility; the trie's
/// ref-counting and herd coalescing make that impossible by construction.
pub trait CacheEngine: Send + Sync {
    /// Run a forward pass extending `base` by `tokens`.
    ///
    /// Logits for the last position are written into `logits` (preallocated
    /// by the caller, `vocab_size` long, zero-copy across the boundary).
    /// Returns a fresh handle representing the extended cache.
    fn forward_with_cache(
        &self,
        tokens: &[TokenId],
        base: CacheHandle,
        logits: &mut [f32],
    ) -> Result<CacheHandle>;

    /// Create a new handle representing the first `keep_tokens` of `handle`.
    fn slice_cache(&self, handle: CacheHandle, keep_tokens: usize) -> Result<CacheHandle>;

    /// Release a handle. Idempotent; safe on `ROOT_CACHE_HANDLE`.
    fn free_cache(&self, handle: CacheHandle);

    /// Vocabulary size, i.e. the required logits buffer length.
    fn vocab_size(&self) -> usize;

    /// Whether the model has been loaded and forward passes can run.
    fn is_loaded(&self) -> bool;
}

/// Return codes crossing the C boundary.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_HANDLE: i32 = -1;
    pub const OUT_OF_MEMORY: i32 = -2;
    pub const INVALID_TOKENS: i32 = -3;
    pub const COMPUTATION_FAILED: i32 = -4;
    pub const MODEL_NOT_LOADED: i32 = -5;
}
