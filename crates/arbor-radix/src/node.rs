//! Trie node
//!
//! A node is one edge-labelled vertex: the token sequence on its incoming
//! edge, a child map keyed by first token, a weak parent back-link, the
//! readiness gate, and the bookkeeping the evictor needs (pin count, LRU
//! stamp, detached flag).
//!
//! Locking discipline: `edge`, `children`, and `parent` are only written
//! while holding the tree's structural write lock, and only read while
//! holding at least the read half. The atomics (`ref_count`, `lru_stamp`,
//! `detached`) follow the rules in the tree module.

use crate::gate::ReadyGate;
use arbor_types::{CacheHandle, Result, TokenId, ROOT_CACHE_HANDLE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A vertex in the prefix trie.
pub struct Node {
    /// Token sequence on the incoming edge; empty only for the root.
    pub(crate) edge: RwLock<Vec<TokenId>>,
    /// Total tokens on the root-to-node path. Fixed at creation; an edge
    /// split shortens a child's edge but never changes its full path.
    prefix_len: usize,
    /// Children keyed by the first token of their edge.
    pub(crate) children: RwLock<HashMap<TokenId, Arc<Node>>>,
    /// Parent back-link; dangling only for the root.
    pub(crate) parent: RwLock<Weak<Node>>,
    /// Readiness gate; its terminal state is the node state.
    pub(crate) gate: ReadyGate,
    /// Active pins holding this node against eviction.
    pub(crate) ref_count: AtomicI32,
    /// LRU queue stamp; 0 means not queued. Cleared on pin for O(1) removal,
    /// stale queue entries are discarded by the evictor.
    pub(crate) lru_stamp: AtomicU64,
    /// Set once the node has been removed from the trie (evicted or pruned).
    detached: AtomicBool,
    is_root: bool,
}

impl Node {
    /// Create the trie root: empty edge, gate pre-resolved to the empty
    /// root cache.
    pub(crate) fn new_root() -> Arc<Self> {
        Arc::new(Self {
            edge: RwLock::new(Vec::new()),
            prefix_len: 0,
            children: RwLock::new(HashMap::new()),
            parent: RwLock::new(Weak::new()),
            gate: ReadyGate::resolved(ROOT_CACHE_HANDLE),
            ref_count: AtomicI32::new(0),
            lru_stamp: AtomicU64::new(0),
            detached: AtomicBool::new(false),
            is_root: true,
        })
    }

    /// Create a pending node below `parent`, pinned once for its creator.
    pub(crate) fn new_pending(
        edge: Vec<TokenId>,
        prefix_len: usize,
        parent: &Arc<Node>,
    ) -> Arc<Self> {
        Self::build(edge, prefix_len, parent, 1)
    }

    /// Create a pending intermediate node for an edge split. Nobody pins it;
    /// it is internal from birth and the split owner finalizes it.
    pub(crate) fn new_intermediate(
        edge: Vec<TokenId>,
        prefix_len: usize,
        parent: &Arc<Node>,
    ) -> Arc<Self> {
        Self::build(edge, prefix_len, parent, 0)
    }

    fn build(
        edge: Vec<TokenId>,
        prefix_len: usize,
        parent: &Arc<Node>,
        initial_refs: i32,
    ) -> Arc<Self> {
        debug_assert!(!edge.is_empty(), "non-root node must have a non-empty edge");
        Arc::new(Self {
            edge: RwLock::new(edge),
            prefix_len,
            children: RwLock::new(HashMap::new()),
            parent: RwLock::new(Arc::downgrade(parent)),
            gate: ReadyGate::new(),
            ref_count: AtomicI32::new(initial_refs),
            lru_stamp: AtomicU64::new(0),
            detached: AtomicBool::new(false),
            is_root: false,
        })
    }

    /// Block until the node is finalized or poisoned.
    pub fn wait(&self) -> Result<CacheHandle> {
        self.gate.wait()
    }

    /// The cache handle, defined iff the node is ready.
    pub fn handle(&self) -> Option<CacheHandle> {
        self.gate.handle()
    }

    /// True once the gate has resolved either way.
    pub fn is_terminal(&self) -> bool {
        self.gate.is_terminal()
    }

    /// True iff finalized with a handle.
    pub fn is_ready(&self) -> bool {
        self.gate.handle().is_some()
    }

    /// True iff poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.gate.error().is_some()
    }

    /// Tokens on the incoming edge.
    pub fn edge_tokens(&self) -> Vec<TokenId> {
        self.edge.read().clone()
    }

    /// Length of the incoming edge.
    pub fn edge_len(&self) -> usize {
        self.edge.read().len()
    }

    /// Total tokens on the root-to-node path.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Current pin count.
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// The parent node, if this node is attached and not the root.
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().upgrade()
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn is_leaf(&self) -> bool {
        self.children.read().is_empty()
    }

    /// Whether the node has been removed from the trie.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Pin the node against eviction and drop it from the LRU queue. The
    /// stamp clear is the O(1) half of removal; the queue entry itself goes
    /// stale and is discarded on pop.
    pub(crate) fn pin(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        self.lru_stamp.store(0, Ordering::Release);
    }

    pub(crate) fn clear_lru_stamp(&self) {
        self.lru_stamp.store(0, Ordering::Release);
    }

    pub(crate) fn lru_stamp(&self) -> u64 {
        self.lru_stamp.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("edge", &*self.edge.read())
            .field("prefix_len", &self.prefix_len)
            .field("ready", &self.is_ready())
            .field("poisoned", &self.is_poisoned())
            .field("ref_count", &self.ref_count())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_resolved_to_root_handle() {
        let root = Node::new_root();
        assert!(root.is_root());
        assert!(root.is_ready());
        assert_eq!(root.handle(), Some(ROOT_CACHE_HANDLE));
        assert_eq!(root.prefix_len(), 0);
        assert_eq!(root.edge_len(), 0);
    }

    #[test]
    fn test_pending_node_starts_pinned() {
        let root = Node::new_root();
        let node = Node::new_pending(vec![1, 2, 3], 3, &root);

        assert!(!node.is_terminal());
        assert_eq!(node.ref_count(), 1);
        assert_eq!(node.edge_tokens(), vec![1, 2, 3]);
        assert_eq!(node.prefix_len(), 3);
        assert!(node.parent().is_some());
    }

    #[test]
    fn test_intermediate_node_starts_unpinned() {
        let root = Node::new_root();
        let node = Node::new_intermediate(vec![1], 1, &root);
        assert_eq!(node.ref_count(), 0);
    }

    #[test]
    fn test_finalize_defines_handle() {
        let root = Node::new_root();
        let node = Node::new_pending(vec![5], 1, &root);

        assert_eq!(node.handle(), None);
        node.gate.finalize(100);
        assert_eq!(node.handle(), Some(100));
        assert!(node.is_ready());
        assert!(!node.is_poisoned());
    }

    #[test]
    fn test_pin_clears_lru_stamp() {
        let root = Node::new_root();
        let node = Node::new_intermediate(vec![5], 1, &root);
        node.lru_stamp.store(7, Ordering::Release);

        node.pin();
        assert_eq!(node.lru_stamp(), 0);
        assert_eq!(node.ref_count(), 1);
    }
}
