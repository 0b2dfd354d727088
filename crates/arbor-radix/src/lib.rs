//! # Arbor Radix
//!
//! The RadixAttention cache manager: a concurrent prefix trie over token
//! sequences that finds the longest cached prefix for each prompt, coalesces
//! concurrent requests for the same uncached prefix onto one pending node,
//! hands out engine cache handles whose lifetime is coordinated with the
//! native runtime, evicts least-recently-used branches under a bounded token
//! budget, and survives engine failures by poisoning and pruning.
//!
//! ## Node lifecycle
//!
//! Nodes are born `pending` with one pin (the creator's), attached to the
//! trie atomically with their creation. They transition to `ready` when the
//! winning request finalizes them with a cache handle, or to `poisoned` when
//! the engine fails; both transitions wake every waiter parked on the node's
//! readiness gate. Ready leaves with no pins queue for LRU eviction; the
//! evictor (normal path) or the pruner (poison path) detaches them and frees
//! their handles.

mod gate;
mod lru;
mod node;
mod tree;

pub use gate::ReadyGate;
pub use node::Node;
pub use tree::{InsertOutcome, NodePin, PrefixMatch, RadixTree, TreeStats};
