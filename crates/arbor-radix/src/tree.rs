//! Prefix trie over token sequences
//!
//! The tree maps token prefixes to engine cache handles. One structural
//! `RwLock` covers all topology: `match_prefix` holds the read half, every
//! mutation (insert, split, evict, prune) holds the write half. The lock is
//! never held across an engine call or a gate wait; callers re-validate
//! topology after blocking (the optimistic double-check pattern).
//!
//! Pin accounting: `ref_count` increments happen while holding the lock (in
//! either mode), so eviction decisions always see consistent values.
//! Decrements are lock-free; a zero transition on a ready leaf re-checks
//! eligibility under the write lock before queueing the node for eviction.

use crate::lru::LruQueue;
use crate::node::Node;
use arbor_engine::CacheEngine;
use arbor_types::{ArborError, CacheHandle, Result, TokenId};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Length of the longest common prefix of two token sequences.
pub(crate) fn longest_common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

struct TreeState {
    lru: LruQueue,
    cached_tokens: usize,
    max_tokens: usize,
}

/// Deferred `slice_cache` work produced by an edge split; executed after the
/// structural lock is released. The old child is pinned until the slice
/// completes so eviction cannot free the source handle underneath it.
struct SplitJob {
    intermediate: Arc<Node>,
    source: Arc<Node>,
    source_handle: CacheHandle,
    keep_tokens: usize,
}

enum WalkResult {
    Done(InsertOutcome),
    /// Topology blocked the walk (a pending edge needs splitting, or a
    /// poisoned exact node was excised); wait if asked, then re-walk.
    Retry(Option<Arc<Node>>),
}

/// Result of [`RadixTree::insert_pending`].
pub enum InsertOutcome {
    /// The sequence is already covered by this node (pending or ready).
    /// Wait on it; the creator will finalize or poison it.
    Existing(NodePin),
    /// A new pending node was created and this caller owns the forward pass
    /// for its edge.
    Created(NodePin),
}

impl InsertOutcome {
    /// The pinned node, regardless of who owns the computation.
    pub fn node(&self) -> &Arc<Node> {
        match self {
            Self::Existing(pin) | Self::Created(pin) => pin.node(),
        }
    }
}

impl std::fmt::Debug for InsertOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Existing(_) => f.write_str("InsertOutcome::Existing(..)"),
            Self::Created(_) => f.write_str("InsertOutcome::Created(..)"),
        }
    }
}

/// Result of [`RadixTree::match_prefix`]: the deepest ready node whose path
/// is a prefix of the query, pinned for the caller.
pub struct PrefixMatch {
    pin: NodePin,
    covered: usize,
}

impl PrefixMatch {
    /// Number of query tokens covered by the matched node's cache.
    pub fn covered(&self) -> usize {
        self.covered
    }

    /// The matched node's cache handle (always defined: matches are ready).
    pub fn handle(&self) -> CacheHandle {
        self.pin
            .node()
            .handle()
            .expect("matched node is always ready")
    }

    pub fn node(&self) -> &Arc<Node> {
        self.pin.node()
    }
}

/// Scoped pin on a trie node. Dropping releases the pin on every exit path;
/// dropping a still-pending node whose computation this pin owns poisons and
/// prunes it so an abandoned creator cannot wedge coalesced waiters.
pub struct NodePin {
    tree: Arc<RadixTree>,
    node: Arc<Node>,
    owns_compute: bool,
}

impl NodePin {
    fn new(tree: Arc<RadixTree>, node: Arc<Node>, owns_compute: bool) -> Self {
        Self {
            tree,
            node,
            owns_compute,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Block until the node resolves.
    pub fn wait(&self) -> Result<CacheHandle> {
        self.node.wait()
    }

    /// Finalize the pending node with the handle from a successful forward
    /// pass, waking all waiters. If a pruner poisoned the node first, the
    /// tree will never own the handle, so it is freed here.
    pub fn finalize(&mut self, handle: CacheHandle) {
        self.owns_compute = false;
        if !self.node.gate.finalize(handle) {
            self.tree.free_handle(handle);
        }
    }

    /// Record a failed forward pass: poison the node, prune its subtree, and
    /// release the pin.
    pub fn fail(mut self, err: ArborError) {
        self.owns_compute = false;
        self.tree.prune_poisoned(&self.node, err);
        // Drop releases the pin.
    }
}

impl Drop for NodePin {
    fn drop(&mut self) {
        if self.owns_compute && !self.node.is_terminal() {
            self.tree.prune_poisoned(
                &self.node,
                ArborError::cancelled("request abandoned before finalizing its prefix"),
            );
        }
        self.tree.unpin(&self.node);
    }
}

/// Snapshot of tree occupancy.
#[derive(Debug, Clone, Copy)]
pub struct TreeStats {
    /// Non-root nodes currently in the trie.
    pub nodes: usize,
    /// Sum of edge lengths over all non-root nodes.
    pub cached_tokens: usize,
    /// Token budget.
    pub max_tokens: usize,
    /// Nodes currently eligible for eviction.
    pub evictable: usize,
}

/// Concurrent radix tree coordinating prefix caches with the native engine.
pub struct RadixTree {
    root: Arc<Node>,
    engine: Arc<dyn CacheEngine>,
    state: RwLock<TreeState>,
}

impl RadixTree {
    /// Create an empty tree with the given token budget.
    pub fn new(engine: Arc<dyn CacheEngine>, max_tokens: usize) -> Arc<Self> {
        Arc::new(Self {
            root: Node::new_root(),
            engine,
            state: RwLock::new(TreeState {
                lru: LruQueue::new(),
                cached_tokens: 0,
                max_tokens,
            }),
        })
    }

    /// Find the deepest *ready* node whose root-to-node path is a prefix of
    /// `tokens`, pinned for the caller. Returns `None` if no ready node
    /// matches beyond the root.
    pub fn match_prefix(self: &Arc<Self>, tokens: &[TokenId]) -> Option<PrefixMatch> {
        let _shared = self.state.read();

        let mut current = Arc::clone(&self.root);
        let mut best: Option<(Arc<Node>, usize)> = None;
        let mut idx = 0;

        while idx < tokens.len() {
            let lookup = current.children.read().get(&tokens[idx]).cloned();
            let Some(child) = lookup else {
                break;
            };

            let edge = child.edge.read();
            let common = longest_common_prefix(&tokens[idx..], &edge);
            let edge_len = edge.len();
            drop(edge);

            if common == edge_len {
                // Entire edge consumed; the child is a waypoint and, if
                // ready, the best match so far.
                idx += common;
                if child.is_ready() {
                    best = Some((Arc::clone(&child), idx));
                }
                current = child;
            } else {
                // Query exhausted mid-edge: the child's cache still covers a
                // valid prefix for the query. A proper divergence matches
                // nothing deeper.
                if common == tokens.len() - idx && child.is_ready() {
                    best = Some((child, tokens.len()));
                }
                break;
            }
        }

        best.map(|(node, covered)| {
            node.pin();
            trace!(covered, "Prefix match");
            PrefixMatch {
                pin: NodePin::new(Arc::clone(self), node, false),
                covered,
            }
        })
    }

    /// Obtain a pinned node covering `tokens`, creating a pending one if
    /// needed. Concurrent callers for the same sequence coalesce onto the
    /// same node; exactly one of them owns the forward pass.
    ///
    /// Fails with [`ArborError::CacheCapacity`] when the evictor cannot make
    /// room for a new edge.
    pub fn insert_pending(self: &Arc<Self>, tokens: &[TokenId]) -> Result<InsertOutcome> {
        if tokens.is_empty() {
            return Err(ArborError::internal("insert_pending requires tokens"));
        }

        loop {
            let mut to_free: Vec<CacheHandle> = Vec::new();
            let mut split_jobs: Vec<SplitJob> = Vec::new();

            let walked = {
                let mut state = self.state.write();
                self.walk_insert_locked(&mut state, tokens, &mut to_free, &mut split_jobs)
            };

            // Engine calls only after the lock is released: frees for evicted
            // or excised handles, then slices for any splits this walk made.
            for handle in to_free {
                self.engine.free_cache(handle);
            }
            for job in split_jobs {
                self.finish_split(job);
            }

            match walked? {
                WalkResult::Done(outcome) => return Ok(outcome),
                WalkResult::Retry(wait_on) => {
                    if let Some(node) = wait_on {
                        // A pending edge blocks a split; wait for its owner
                        // to resolve it, then re-check the topology. The
                        // outcome does not matter here: a poisoned node is
                        // excised on the next walk.
                        let _ = node.wait();
                    }
                }
            }
        }
    }

    fn walk_insert_locked(
        self: &Arc<Self>,
        state: &mut TreeState,
        tokens: &[TokenId],
        to_free: &mut Vec<CacheHandle>,
        split_jobs: &mut Vec<SplitJob>,
    ) -> Result<WalkResult> {
        let mut current = Arc::clone(&self.root);
        let mut idx = 0usize;

        loop {
            if idx == tokens.len() {
                // The walk consumed the whole sequence at `current`.
                if current.is_poisoned() {
                    self.detach_subtree_locked(
                        state,
                        &current,
                        &ArborError::engine("prefix was poisoned"),
                        to_free,
                    );
                    return Ok(WalkResult::Retry(None));
                }
                current.pin();
                return Ok(WalkResult::Done(InsertOutcome::Existing(NodePin::new(
                    Arc::clone(self),
                    current,
                    false,
                ))));
            }

            let first = tokens[idx];
            let lookup = current.children.read().get(&first).cloned();
            let Some(child) = lookup else {
                // No edge to follow: attach the unmatched suffix.
                let needed = tokens.len() - idx;
                self.evict_for_locked(state, needed, to_free)?;

                let node = Node::new_pending(tokens[idx..].to_vec(), tokens.len(), &current);
                current.children.write().insert(first, Arc::clone(&node));
                // The parent just acquired a child; it can no longer be an
                // eviction candidate.
                current.clear_lru_stamp();
                state.cached_tokens += needed;

                debug!(
                    suffix_len = needed,
                    prefix_len = idx,
                    cached_tokens = state.cached_tokens,
                    "Inserted pending node"
                );
                // Born with the creator's pin.
                return Ok(WalkResult::Done(InsertOutcome::Created(NodePin::new(
                    Arc::clone(self),
                    node,
                    true,
                ))));
            };

            if child.is_poisoned() {
                // Treat as absent: excise so a fresh sibling can replace it.
                self.detach_subtree_locked(
                    state,
                    &child,
                    &ArborError::engine("prefix was poisoned"),
                    to_free,
                );
                continue;
            }

            let edge = child.edge.read();
            let common = longest_common_prefix(&tokens[idx..], &edge);
            let edge_len = edge.len();
            drop(edge);

            if common == edge_len {
                // Full edge consumed; pending nodes are valid waypoints here.
                idx += common;
                current = child;
                continue;
            }

            // The edge extends past the sequence (or diverges): split needed.
            if !child.is_terminal() {
                // Cannot split a pending edge; its handle is not known yet.
                return Ok(WalkResult::Retry(Some(child)));
            }
            let Some(source_handle) = child.handle() else {
                // Terminal but not ready: poisoned between the checks above.
                self.detach_subtree_locked(
                    state,
                    &child,
                    &ArborError::engine("prefix was poisoned"),
                    to_free,
                );
                continue;
            };

            // Pin the old child across the deferred slice call.
            child.pin();
            let intermediate = self.split_edge_locked(&current, &child, common);
            split_jobs.push(SplitJob {
                intermediate: Arc::clone(&intermediate),
                source: Arc::clone(&child),
                source_handle,
                keep_tokens: idx + common,
            });

            idx += common;
            current = intermediate;
        }
    }

    /// Split `child`'s edge at `common`, introducing a pending intermediate
    /// node that inherits a sliced handle once the split owner resolves it.
    /// Pure topology; the `slice_cache` call happens after unlock.
    fn split_edge_locked(
        &self,
        parent: &Arc<Node>,
        child: &Arc<Node>,
        common: usize,
    ) -> Arc<Node> {
        let mut child_edge = child.edge.write();
        debug_assert!(common > 0 && common < child_edge.len());

        let head: Vec<TokenId> = child_edge[..common].to_vec();
        let tail: Vec<TokenId> = child_edge[common..].to_vec();
        let head_first = head[0];
        let tail_first = tail[0];

        let intermediate =
            Node::new_intermediate(head, child.prefix_len() - child_edge.len() + common, parent);

        *child_edge = tail;
        drop(child_edge);

        *child.parent.write() = Arc::downgrade(&intermediate);
        intermediate
            .children
            .write()
            .insert(tail_first, Arc::clone(child));
        parent
            .children
            .write()
            .insert(head_first, Arc::clone(&intermediate));

        debug!(
            split_at = common,
            child_prefix_len = child.prefix_len(),
            "Split edge"
        );
        intermediate
    }

    /// Resolve a split intermediate: derive its handle from the old child's
    /// cache, or poison and prune it if the engine refuses.
    fn finish_split(self: &Arc<Self>, job: SplitJob) {
        match self.engine.slice_cache(job.source_handle, job.keep_tokens) {
            Ok(handle) => {
                if !job.intermediate.gate.finalize(handle) {
                    // A pruner detached the intermediate first.
                    self.engine.free_cache(handle);
                }
            }
            Err(err) => {
                warn!(error = %err, "Slice for edge split failed; pruning intermediate");
                self.prune_poisoned(&job.intermediate, err);
            }
        }
        self.unpin(&job.source);
    }

    /// Evict least-recently-used leaves until `needed` more tokens fit in
    /// the budget. Handles for victims are collected for freeing after
    /// unlock.
    fn evict_for_locked(
        &self,
        state: &mut TreeState,
        needed: usize,
        to_free: &mut Vec<CacheHandle>,
    ) -> Result<()> {
        while state.cached_tokens + needed > state.max_tokens {
            let Some(victim) = state.lru.pop_lru() else {
                return Err(ArborError::cache_capacity(format!(
                    "cannot fit {} tokens: {} cached of {} budget, nothing evictable",
                    needed, state.cached_tokens, state.max_tokens
                )));
            };

            // Eligibility may have changed since the node was queued.
            if victim.ref_count() > 0
                || !victim.is_leaf()
                || victim.is_detached()
                || !victim.is_ready()
            {
                continue;
            }

            self.detach_leaf_locked(state, &victim, to_free);
            debug!(
                cached_tokens = state.cached_tokens,
                "Evicted LRU leaf"
            );
        }
        Ok(())
    }

    /// Detach a single ready leaf and queue its parent if the removal made
    /// it eligible for eviction.
    fn detach_leaf_locked(
        &self,
        state: &mut TreeState,
        node: &Arc<Node>,
        to_free: &mut Vec<CacheHandle>,
    ) {
        if let Some(parent) = node.parent() {
            let first = node.edge.read().first().copied();
            if let Some(first) = first {
                parent.children.write().remove(&first);
            }
            self.queue_if_eligible_locked(state, &parent);
        }

        node.set_detached();
        state.cached_tokens -= node.edge_len();
        if let Some(handle) = node.handle() {
            to_free.push(handle);
        }
    }

    /// Cascading eligibility: a node whose last child was detached becomes an
    /// eviction candidate itself.
    fn queue_if_eligible_locked(&self, state: &mut TreeState, node: &Arc<Node>) {
        if !node.is_root()
            && node.is_leaf()
            && node.ref_count() == 0
            && node.is_ready()
            && !node.is_detached()
            && node.lru_stamp() == 0
        {
            state.lru.push_front(node);
        }
    }

    /// Poison `node` (waking all waiters with `err`) and detach it and every
    /// descendant from the trie, freeing their handles.
    ///
    /// Waiters observe the error and return it upstream; retry policy lives
    /// in the orchestrator.
    pub fn prune_poisoned(self: &Arc<Self>, node: &Arc<Node>, err: ArborError) {
        node.gate.poison(err.clone());

        let mut to_free: Vec<CacheHandle> = Vec::new();
        {
            let mut state = self.state.write();
            if !node.is_detached() {
                self.detach_subtree_locked(&mut state, node, &err, &mut to_free);
            }
        }
        for handle in to_free {
            self.engine.free_cache(handle);
        }
    }

    /// Detach `node` and all descendants: poison still-pending gates so
    /// their waiters wake, subtract their edges from the token meter, and
    /// collect issued handles for freeing after unlock.
    fn detach_subtree_locked(
        &self,
        state: &mut TreeState,
        node: &Arc<Node>,
        err: &ArborError,
        to_free: &mut Vec<CacheHandle>,
    ) {
        if let Some(parent) = node.parent() {
            let first = node.edge.read().first().copied();
            if let Some(first) = first {
                parent.children.write().remove(&first);
            }
            self.queue_if_eligible_locked(state, &parent);
        }

        let mut stack = vec![Arc::clone(node)];
        let mut detached = 0usize;
        while let Some(current) = stack.pop() {
            if current.is_detached() {
                continue;
            }
            current.set_detached();
            current.gate.poison(err.clone());
            state.cached_tokens -= current.edge_len();
            if let Some(handle) = current.handle() {
                to_free.push(handle);
            }
            detached += 1;

            let mut children = current.children.write();
            stack.extend(children.values().cloned());
            children.clear();
        }

        debug!(
            detached,
            cached_tokens = state.cached_tokens,
            "Pruned poisoned subtree"
        );
    }

    /// Release one pin. On a zero transition for an attached ready leaf the
    /// node is queued for eviction (re-checked under the write lock).
    pub(crate) fn unpin(&self, node: &Arc<Node>) {
        let prev = node.ref_count.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        if prev <= 0 {
            debug_assert!(false, "unpin without matching pin");
            node.ref_count
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            error!("unpin without matching pin; count restored");
            return;
        }

        if prev == 1 && node.is_ready() && !node.is_root() && !node.is_detached() {
            let mut state = self.state.write();
            if node.ref_count() == 0 && !node.is_detached() {
                self.queue_if_eligible_locked(&mut state, node);
            }
        }
    }

    /// Release an engine handle that will never be owned by the trie.
    pub(crate) fn free_handle(&self, handle: CacheHandle) {
        self.engine.free_cache(handle);
    }

    /// Sum of edge lengths currently cached.
    pub fn cached_tokens(&self) -> usize {
        self.state.read().cached_tokens
    }

    /// Token budget.
    pub fn max_tokens(&self) -> usize {
        self.state.read().max_tokens
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> TreeStats {
        let state = self.state.read();

        fn count(node: &Arc<Node>) -> usize {
            let children = node.children.read();
            children.len() + children.values().map(count).sum::<usize>()
        }

        TreeStats {
            nodes: count(&self.root),
            cached_tokens: state.cached_tokens,
            max_tokens: state.max_tokens,
            evictable: state.lru.live_len(),
        }
    }
}
