//! Eviction queue
//!
//! A move-to-front queue over weak node references with lazy invalidation:
//! membership is a stamp stored on the node, so removal (on pin, or on a node
//! acquiring a child) is a single atomic store. Stale queue entries are
//! discarded when they surface at the back.
//!
//! Front = most recently eligible, back = eviction victim.

use crate::node::Node;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

pub(crate) struct LruQueue {
    entries: VecDeque<(u64, Weak<Node>)>,
    clock: u64,
}

impl LruQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            clock: 0,
        }
    }

    /// Queue a node at the front, stamping it as a member.
    pub(crate) fn push_front(&mut self, node: &Arc<Node>) {
        self.clock += 1;
        node.lru_stamp.store(self.clock, Ordering::Release);
        self.entries.push_front((self.clock, Arc::downgrade(node)));
    }

    /// Pop the least recently queued live node; skips entries whose stamp was
    /// cleared by a pin or superseded by a re-queue.
    pub(crate) fn pop_lru(&mut self) -> Option<Arc<Node>> {
        while let Some((stamp, weak)) = self.entries.pop_back() {
            if let Some(node) = weak.upgrade() {
                if node.lru_stamp() == stamp {
                    node.clear_lru_stamp();
                    return Some(node);
                }
            }
        }
        None
    }

    /// Number of live entries. O(n); used for stats and tests only.
    pub(crate) fn live_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|(stamp, weak)| {
                weak.upgrade()
                    .map(|node| node.lru_stamp() == *stamp)
                    .unwrap_or(false)
            })
            .count()
    }
}
