//! Metal-backed engine implementation
//!
//! Thin safe wrapper over the `arbor_*` C API. Thread safety for concurrent
//! forward calls on different handles is provided by the native layer; this
//! wrapper only converts types and owns error-string cleanup.

use crate::{ffi, status, CacheEngine};
use arbor_types::{ArborError, CacheHandle, Result, TokenId};
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Engine backed by the native Metal runtime (`libarbor_metal`).
pub struct MetalEngine {
    model_path: String,
    vocab_size: usize,
    loaded: AtomicBool,
}

impl MetalEngine {
    /// Create an engine for the given weights directory.
    ///
    /// The model is not loaded until [`MetalEngine::load_model`] is called.
    pub fn new(model_path: impl Into<String>, vocab_size: usize) -> Self {
        Self {
            model_path: model_path.into(),
            vocab_size,
            loaded: AtomicBool::new(false),
        }
    }

    /// Load the model weights. Must be called before any forward pass.
    pub fn load_model(&self) -> Result<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let path = CString::new(self.model_path.as_str())
            .map_err(|_| ArborError::config("model path contains a NUL byte"))?;
        let mut err: *mut c_char = ptr::null_mut();

        let ret = unsafe {
            ffi::arbor_load_model(path.as_ptr(), self.vocab_size as c_int, &mut err)
        };
        check_status(ret, err)?;

        self.loaded.store(true, Ordering::Release);
        info!(path = %self.model_path, vocab_size = self.vocab_size, "Model loaded");
        Ok(())
    }
}

impl CacheEngine for MetalEngine {
    fn forward_with_cache(
        &self,
        tokens: &[TokenId],
        base: CacheHandle,
        logits: &mut [f32],
    ) -> Result<CacheHandle> {
        if tokens.is_empty() {
            return Err(ArborError::engine("forward pass requires at least one token"));
        }
        if logits.len() != self.vocab_size {
            return Err(ArborError::internal(format!(
                "logits buffer length {} does not match vocab size {}",
                logits.len(),
                self.vocab_size
            )));
        }

        let mut out_handle: u64 = 0;
        let mut err: *mut c_char = ptr::null_mut();

        let ret = unsafe {
            ffi::arbor_forward_with_cache(
                tokens.as_ptr(),
                tokens.len() as c_int,
                base,
                logits.as_mut_ptr(),
                logits.len() as c_int,
                &mut out_handle,
                &mut err,
            )
        };
        check_status(ret, err)?;

        debug!(base, new = out_handle, num_tokens = tokens.len(), "Forward pass complete");
        Ok(out_handle)
    }

    fn slice_cache(&self, handle: CacheHandle, keep_tokens: usize) -> Result<CacheHandle> {
        let mut out_handle: u64 = 0;
        let mut err: *mut c_char = ptr::null_mut();

        let ret = unsafe {
            ffi::arbor_slice_cache(handle, keep_tokens as c_int, &mut out_handle, &mut err)
        };
        check_status(ret, err)?;

        debug!(source = handle, sliced = out_handle, keep_tokens, "Cache sliced");
        Ok(out_handle)
    }

    fn free_cache(&self, handle: CacheHandle) {
        unsafe { ffi::arbor_free_cache(handle) };
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

/// Convert a C return code plus optional error string into a `Result`,
/// freeing the string on the way.
fn check_status(ret: c_int, err: *mut c_char) -> Result<()> {
    if ret == status::SUCCESS {
        return Ok(());
    }

    let message = if err.is_null() {
        "unknown native failure".to_string()
    } else {
        let message = unsafe { std::ffi::CStr::from_ptr(err) }
            .to_string_lossy()
            .into_owned();
        unsafe { ffi::arbor_free_error(err) };
        message
    };

    Err(match ret {
        status::MODEL_NOT_LOADED => ArborError::model_not_loaded(message),
        status::OUT_OF_MEMORY
        | status::INVALID_HANDLE
        | status::INVALID_TOKENS
        | status::COMPUTATION_FAILED => ArborError::engine(message),
        other => ArborError::engine(format!("unknown status {}: {}", other, message)),
    })
}
