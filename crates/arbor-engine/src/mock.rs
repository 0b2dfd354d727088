//! Mock engine for tests and model-less development runs
//!
//! Behaves like the native runtime from the cache manager's point of view:
//! hands out monotonically increasing handles, tolerates double-free, and can
//! be scripted to fail or to block forward passes until released (for
//! thundering-herd tests).

use crate::CacheEngine;
use arbor_types::{ArborError, CacheHandle, Result, TokenId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

/// One recorded `forward_with_cache` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardCall {
    pub tokens: Vec<TokenId>,
    pub base: CacheHandle,
}

#[derive(Default)]
struct MockState {
    forwards: Vec<ForwardCall>,
    slices: Vec<(CacheHandle, usize)>,
    freed: Vec<CacheHandle>,
    fail_forward: Option<ArborError>,
    fail_slice: Option<ArborError>,
    held: bool,
}

/// In-process stand-in for the native engine.
pub struct MockEngine {
    vocab_size: usize,
    next_handle: AtomicU64,
    loaded: AtomicBool,
    state: Mutex<MockState>,
    released: Condvar,
}

impl MockEngine {
    /// Create a loaded mock engine.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            next_handle: AtomicU64::new(1),
            loaded: AtomicBool::new(true),
            state: Mutex::new(MockState::default()),
            released: Condvar::new(),
        }
    }

    /// Create a mock engine that reports the model as not loaded.
    pub fn unloaded(vocab_size: usize) -> Self {
        let engine = Self::new(vocab_size);
        engine.loaded.store(false, Ordering::Release);
        engine
    }

    /// Mark the model as loaded.
    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }

    /// Block subsequent forward passes until [`MockEngine::release`] is called.
    pub fn hold(&self) {
        self.state.lock().held = true;
    }

    /// Release all forward passes blocked by [`MockEngine::hold`].
    pub fn release(&self) {
        self.state.lock().held = false;
        self.released.notify_all();
    }

    /// Make the next forward pass fail with `err`.
    pub fn fail_next_forward(&self, err: ArborError) {
        self.state.lock().fail_forward = Some(err);
    }

    /// Make the next slice fail with `err`.
    pub fn fail_next_slice(&self, err: ArborError) {
        self.state.lock().fail_slice = Some(err);
    }

    /// All forward calls observed so far.
    pub fn forward_calls(&self) -> Vec<ForwardCall> {
        self.state.lock().forwards.clone()
    }

    /// Number of forward calls observed so far.
    pub fn forward_count(&self) -> usize {
        self.state.lock().forwards.len()
    }

    /// All slice calls observed so far, as (source handle, keep_tokens).
    pub fn slice_calls(&self) -> Vec<(CacheHandle, usize)> {
        self.state.lock().slices.clone()
    }

    /// All handles freed so far, in call order (duplicates preserved).
    pub fn freed(&self) -> Vec<CacheHandle> {
        self.state.lock().freed.clone()
    }
}

impl CacheEngine for MockEngine {
    fn forward_with_cache(
        &self,
        tokens: &[TokenId],
        base: CacheHandle,
        logits: &mut [f32],
    ) -> Result<CacheHandle> {
        if !self.is_loaded() {
            return Err(ArborError::model_not_loaded("mock model not loaded"));
        }
        if tokens.is_empty() {
            return Err(ArborError::engine("forward pass requires at least one token"));
        }

        {
            let mut state = self.state.lock();
            while state.held {
                self.released.wait(&mut state);
            }
            if let Some(err) = state.fail_forward.take() {
                return Err(err);
            }
            state.forwards.push(ForwardCall {
                tokens: tokens.to_vec(),
                base,
            });
        }

        // Deterministic logits: argmax is always last_token + 1 (mod vocab),
        // so greedy generation walks the vocabulary in order.
        let last = *tokens.last().expect("tokens checked non-empty") as usize;
        logits.fill(0.0);
        logits[(last + 1) % self.vocab_size] = 1.0;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        trace!(base, handle, num_tokens = tokens.len(), "Mock forward");
        Ok(handle)
    }

    fn slice_cache(&self, handle: CacheHandle, keep_tokens: usize) -> Result<CacheHandle> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_slice.take() {
            return Err(err);
        }
        state.slices.push((handle, keep_tokens));
        drop(state);

        let sliced = self.next_handle.fetch_add(1, Ordering::Relaxed);
        trace!(source = handle, sliced, keep_tokens, "Mock slice");
        Ok(sliced)
    }

    fn free_cache(&self, handle: CacheHandle) {
        if handle == arbor_types::ROOT_CACHE_HANDLE {
            return;
        }
        self.state.lock().freed.push(handle);
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let engine = MockEngine::new(100);
        let mut logits = vec![0.0; 100];

        let h1 = engine.forward_with_cache(&[1], 0, &mut logits).unwrap();
        let h2 = engine.forward_with_cache(&[2], h1, &mut logits).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_logits_argmax_is_next_token() {
        let engine = MockEngine::new(100);
        let mut logits = vec![0.0; 100];

        engine.forward_with_cache(&[41], 0, &mut logits).unwrap();
        let argmax = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(argmax, 42);
    }

    #[test]
    fn test_records_calls_and_frees() {
        let engine = MockEngine::new(10);
        let mut logits = vec![0.0; 10];

        let h = engine.forward_with_cache(&[1, 2], 0, &mut logits).unwrap();
        engine.slice_cache(h, 1).unwrap();
        engine.free_cache(h);
        engine.free_cache(h); // idempotent, still recorded

        assert_eq!(engine.forward_calls(), vec![ForwardCall { tokens: vec![1, 2], base: 0 }]);
        assert_eq!(engine.slice_calls(), vec![(h, 1)]);
        assert_eq!(engine.freed(), vec![h, h]);
    }

    #[test]
    fn test_free_ignores_root_handle() {
        let engine = MockEngine::new(10);
        engine.free_cache(arbor_types::ROOT_CACHE_HANDLE);
        assert!(engine.freed().is_empty());
    }

    #[test]
    fn test_scripted_failure() {
        let engine = MockEngine::new(10);
        let mut logits = vec![0.0; 10];

        engine.fail_next_forward(ArborError::engine("OOM"));
        assert!(engine.forward_with_cache(&[1], 0, &mut logits).is_err());
        // Failure is consumed; the next call succeeds.
        assert!(engine.forward_with_cache(&[1], 0, &mut logits).is_ok());
    }

    #[test]
    fn test_unloaded_rejects_forward() {
        let engine = MockEngine::unloaded(10);
        let mut logits = vec![0.0; 10];
        let err = engine.forward_with_cache(&[1], 0, &mut logits).unwrap_err();
        assert!(matches!(err, ArborError::ModelNotLoaded { .. }));
    }

    #[test]
    fn test_hold_blocks_until_release() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let engine = Arc::new(MockEngine::new(10));
        engine.hold();

        let worker = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut logits = vec![0.0; 10];
                engine.forward_with_cache(&[1], 0, &mut logits).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.forward_count(), 0);

        engine.release();
        worker.join().unwrap();
        assert_eq!(engine.forward_count(), 1);
    }
}
