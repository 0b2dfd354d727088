//! One-shot broadcast readiness gate
//!
//! Every trie node carries a gate. It starts `Pending` and transitions
//! exactly once, to `Ready(handle)` on finalize or `Poisoned(err)` on engine
//! failure; all waiters wake on either transition. The terminal state *is*
//! the node state machine, which makes "handle defined iff ready" structural.
//!
//! This is what prevents the thundering herd: concurrent requests that
//! discover the same pending prefix all park here while exactly one forward
//! pass runs.

use arbor_types::{ArborError, CacheHandle, Result};
use parking_lot::{Condvar, Mutex};
use tracing::error;

#[derive(Debug, Clone)]
enum GateState {
    Pending,
    Ready(CacheHandle),
    Poisoned(ArborError),
}

/// A waitable object that transitions from pending to a terminal state
/// exactly once and wakes every waiter.
pub struct ReadyGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ReadyGate {
    /// Create a pending gate.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Create a gate that is already resolved (used for the trie root, whose
    /// handle is the empty root cache).
    pub fn resolved(handle: CacheHandle) -> Self {
        Self {
            state: Mutex::new(GateState::Ready(handle)),
            cond: Condvar::new(),
        }
    }

    /// Block until the gate leaves `Pending`; return the handle or the
    /// stored error. Safe from any number of concurrent callers.
    pub fn wait(&self) -> Result<CacheHandle> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                GateState::Pending => self.cond.wait(&mut state),
                GateState::Ready(handle) => return Ok(*handle),
                GateState::Poisoned(err) => return Err(err.clone()),
            }
        }
    }

    /// Transition `Pending -> Ready(handle)` and wake all waiters.
    ///
    /// Must be called at most once. Returns false without transitioning when
    /// the gate was already poisoned (the pruner won a race with the
    /// finalizer); the caller still owns the handle in that case.
    pub fn finalize(&self, handle: CacheHandle) -> bool {
        let mut state = self.state.lock();
        match &*state {
            GateState::Pending => {
                *state = GateState::Ready(handle);
                self.cond.notify_all();
                true
            }
            GateState::Poisoned(_) => false,
            GateState::Ready(_) => {
                debug_assert!(false, "finalize called twice");
                error!(handle, "finalize called on an already-ready gate; ignoring");
                false
            }
        }
    }

    /// Transition `Pending -> Poisoned(err)` and wake all waiters.
    ///
    /// Returns whether the transition happened; a gate that is already
    /// terminal is left untouched (pruning an already-failed subtree hits
    /// this path legitimately).
    pub fn poison(&self, err: ArborError) -> bool {
        let mut state = self.state.lock();
        match &*state {
            GateState::Pending => {
                *state = GateState::Poisoned(err);
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Non-blocking: true once the gate has left `Pending` (either outcome).
    pub fn is_terminal(&self) -> bool {
        !matches!(&*self.state.lock(), GateState::Pending)
    }

    /// Non-blocking: the handle, if the gate resolved successfully.
    pub fn handle(&self) -> Option<CacheHandle> {
        match &*self.state.lock() {
            GateState::Ready(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Non-blocking: the stored error, if the gate was poisoned.
    pub fn error(&self) -> Option<ArborError> {
        match &*self.state.lock() {
            GateState::Poisoned(err) => Some(err.clone()),
            _ => None,
        }
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}
