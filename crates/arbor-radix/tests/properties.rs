//! Property-based tests for the cache manager invariants.

use arbor_engine::{CacheEngine, MockEngine};
use arbor_radix::{InsertOutcome, Node, NodePin, RadixTree};
use arbor_types::{ArborError, TokenId};
use proptest::collection::vec as pvec;
use proptest::prelude::*;
use std::sync::Arc;

/// Short sequences over a small alphabet force shared prefixes, splits, and
/// divergences.
fn arb_seq() -> impl Strategy<Value = Vec<TokenId>> {
    pvec(0u32..8, 1..10)
}

fn new_tree(max_tokens: usize) -> (Arc<RadixTree>, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine::new(64));
    let tree = RadixTree::new(engine.clone() as Arc<dyn CacheEngine>, max_tokens);
    (tree, engine)
}

/// Reconstruct the root-to-node token path through parent links.
fn path_of(node: &Arc<Node>) -> Vec<TokenId> {
    let mut parts = Vec::new();
    let mut current = Some(Arc::clone(node));
    while let Some(n) = current {
        if n.is_root() {
            break;
        }
        parts.push(n.edge_tokens());
        current = n.parent();
    }
    parts.reverse();
    parts.concat()
}

proptest! {
    /// Property 1: the matched node's path is consistent with the query, and
    /// the match covers at least every inserted sequence that prefixes it.
    #[test]
    fn match_returns_longest_ready_prefix(
        seqs in pvec(arb_seq(), 1..12),
        query in arb_seq(),
    ) {
        let (tree, _) = new_tree(10_000);
        // Finalize handles well above anything the mock generates for slices.
        let mut next_handle = 1_000_000u64;
        for seq in &seqs {
            match tree.insert_pending(seq).unwrap() {
                InsertOutcome::Created(mut pin) => {
                    pin.finalize(next_handle);
                    next_handle += 1;
                }
                InsertOutcome::Existing(pin) => {
                    // Sequential inserts resolve every node before the next.
                    prop_assert!(pin.wait().is_ok());
                }
            }
        }

        let best_inserted = seqs
            .iter()
            .filter(|seq| query.starts_with(seq))
            .map(|seq| seq.len())
            .max();

        match tree.match_prefix(&query) {
            Some(matched) => {
                let covered = matched.covered();
                prop_assert!(covered <= query.len());

                let path = path_of(matched.node());
                // The covered region agrees token-for-token, and one of the
                // two is a prefix of the other.
                let overlap = covered.min(path.len());
                prop_assert_eq!(&path[..overlap], &query[..overlap]);
                prop_assert!(
                    path.len() >= covered,
                    "node must cover at least the reported region"
                );
                if let Some(best) = best_inserted {
                    prop_assert!(covered >= best, "a ready node covers {} tokens", best);
                }
            }
            None => {
                prop_assert!(best_inserted.is_none());
            }
        }
    }

    /// Property 3: the token meter never exceeds the budget after any public
    /// operation, whatever mix of pins is outstanding.
    #[test]
    fn budget_is_never_exceeded(
        ops in pvec((arb_seq(), any::<bool>()), 1..40),
    ) {
        let budget = 12usize;
        let (tree, _) = new_tree(budget);
        let mut held: Vec<NodePin> = Vec::new();
        let mut next_handle = 1_000_000u64;

        for (seq, release_one) in ops {
            match tree.insert_pending(&seq) {
                Ok(InsertOutcome::Created(mut pin)) => {
                    pin.finalize(next_handle);
                    next_handle += 1;
                    held.push(pin);
                }
                Ok(InsertOutcome::Existing(pin)) => held.push(pin),
                Err(ArborError::CacheCapacity { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
            if release_one {
                held.pop();
            }
            prop_assert!(tree.cached_tokens() <= budget);
        }

        held.clear();
        prop_assert!(tree.cached_tokens() <= budget);
    }

    /// Property 4 (shape): no handle is ever freed twice, across arbitrary
    /// insert / release / evict interleavings.
    #[test]
    fn no_handle_is_freed_twice(
        ops in pvec(arb_seq(), 1..30),
    ) {
        let (tree, engine) = new_tree(8);
        let mut next_handle = 1_000_000u64;

        for seq in ops {
            match tree.insert_pending(&seq) {
                Ok(InsertOutcome::Created(mut pin)) => {
                    pin.finalize(next_handle);
                    next_handle += 1;
                }
                Ok(InsertOutcome::Existing(pin)) => {
                    let _ = pin.wait();
                }
                Err(ArborError::CacheCapacity { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
            // Dropping the pin immediately makes everything evictable.
        }

        let freed = engine.freed();
        let mut deduped = freed.clone();
        deduped.sort_unstable();
        deduped.dedup();
        prop_assert_eq!(deduped.len(), freed.len(), "duplicate free_cache call");
    }
}
