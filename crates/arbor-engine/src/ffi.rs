//! Raw C bindings for the native Metal runtime
//!
//! All signatures are primitive-only (`u32*`, `u64`, `f32*`, `char**`) to
//! keep the FFI surface minimal. Every non-null `out_error` string must be
//! freed with `arbor_free_error`.

use std::os::raw::{c_char, c_int};

extern "C" {
    /// Executes a forward pass extending `base_cache_handle` by `tokens`.
    ///
    /// Writes logits for the last position into the caller-allocated
    /// `out_logits` buffer and a fresh cache handle into `out_cache_handle`.
    /// Returns 0 on success or a negative status code.
    pub fn arbor_forward_with_cache(
        tokens: *const u32,
        num_tokens: c_int,
        base_cache_handle: u64,
        out_logits: *mut f32,
        out_logits_size: c_int,
        out_cache_handle: *mut u64,
        out_error: *mut *mut c_char,
    ) -> c_int;

    /// Creates a zero-copy view of the first `keep_tokens` of `cache_handle`.
    pub fn arbor_slice_cache(
        cache_handle: u64,
        keep_tokens: c_int,
        out_sliced_handle: *mut u64,
        out_error: *mut *mut c_char,
    ) -> c_int;

    /// Releases a cache handle. Idempotent; safe on handle 0.
    pub fn arbor_free_cache(cache_handle: u64);

    /// Loads model weights from `path`. Called once at startup; the model
    /// becomes an implicit global for subsequent forward calls.
    pub fn arbor_load_model(
        path: *const c_char,
        vocab_size: c_int,
        out_error: *mut *mut c_char,
    ) -> c_int;

    /// Frees an error string returned by any of the above. Null-safe.
    pub fn arbor_free_error(error: *mut c_char);
}
