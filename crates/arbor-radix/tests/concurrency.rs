//! Concurrency tests for the cache manager: herd coalescing, broadcast
//! wakeups, and parallel reads against a mutating tree.

use arbor_engine::{CacheEngine, MockEngine};
use arbor_radix::{InsertOutcome, RadixTree};
use arbor_types::ArborError;
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

fn tree_with(max_tokens: usize) -> (Arc<RadixTree>, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine::new(100));
    let tree = RadixTree::new(engine.clone() as Arc<dyn CacheEngine>, max_tokens);
    (tree, engine)
}

#[test]
fn thundering_herd_coalesces_onto_one_node() {
    // Scenario D: 10 concurrent insert_pending calls for the same tokens
    // produce one node with ref_count 10 and exactly one forward pass.
    let (tree, engine) = tree_with(1000);
    let barrier = Arc::new(Barrier::new(10));
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            let outcomes = Arc::clone(&outcomes);
            thread::spawn(move || {
                barrier.wait();
                let outcome = tree.insert_pending(&[7, 8, 9]).unwrap();
                outcomes.lock().push(outcome);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 10);

    let created: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, InsertOutcome::Created(_)))
        .collect();
    assert_eq!(created.len(), 1, "exactly one caller owns the computation");

    let node = Arc::clone(outcomes[0].node());
    for outcome in outcomes.iter() {
        assert!(Arc::ptr_eq(outcome.node(), &node));
    }
    assert_eq!(node.ref_count(), 10);

    // The owner drives the single forward pass; everyone sees its handle.
    let mut logits = vec![0.0; engine.vocab_size()];
    let handle = engine.forward_with_cache(&[7, 8, 9], 0, &mut logits).unwrap();
    for outcome in outcomes.iter_mut() {
        if let InsertOutcome::Created(pin) = outcome {
            pin.finalize(handle);
        }
    }
    for outcome in outcomes.iter() {
        assert_eq!(outcome.node().wait().unwrap(), handle);
    }
    assert_eq!(engine.forward_count(), 1);

    // Releasing every pin returns the count to zero.
    outcomes.clear();
    assert_eq!(node.ref_count(), 0);
}

#[test]
fn poison_fans_out_to_every_waiter() {
    let (tree, _) = tree_with(1000);

    let owner = tree.insert_pending(&[5, 6]).unwrap();
    let InsertOutcome::Created(owner_pin) = owner else {
        panic!("expected creation");
    };

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                match tree.insert_pending(&[5, 6]).unwrap() {
                    InsertOutcome::Existing(pin) => Some(pin.wait()),
                    // Raced past the prune and created a fresh node; it is
                    // not parked on the poisoned gate.
                    InsertOutcome::Created(_) => None,
                }
            })
        })
        .collect();

    thread::sleep(std::time::Duration::from_millis(20));
    owner_pin.fail(ArborError::engine("OOM"));

    let mut errors = Vec::new();
    for waiter in waiters {
        if let Some(result) = waiter.join().unwrap() {
            errors.push(result.unwrap_err());
        }
    }
    // Nobody ever finalizes this prefix, so every coalesced waiter saw an
    // error, and those parked before the prune saw the engine's.
    assert!(errors.iter().any(|err| *err == ArborError::engine("OOM")));

    // The poisoned subtree is gone; a retry starts fresh.
    let retry = tree.insert_pending(&[5, 6]).unwrap();
    assert!(matches!(retry, InsertOutcome::Created(_)));
}

#[test]
fn concurrent_matches_run_under_shared_lock() {
    let (tree, _) = tree_with(1000);
    match tree.insert_pending(&[1, 2, 3]).unwrap() {
        InsertOutcome::Created(mut pin) => pin.finalize(100),
        InsertOutcome::Existing(_) => unreachable!(),
    }

    let readers: Vec<_> = (0..50)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let matched = tree.match_prefix(&[1, 2, 3]).expect("node is ready");
                assert_eq!(matched.handle(), 100);
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn mixed_inserts_and_matches_keep_budget() {
    let (tree, _) = tree_with(64);

    let workers: Vec<_> = (0..8u32)
        .map(|worker| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for round in 0..20u32 {
                    let base = worker * 100;
                    let tokens: Vec<u32> = (base..base + 8).collect();
                    match tree.insert_pending(&tokens) {
                        Ok(InsertOutcome::Created(mut pin)) => {
                            pin.finalize(u64::from(base + round) + 1)
                        }
                        Ok(InsertOutcome::Existing(pin)) => {
                            let _ = pin.wait();
                        }
                        Err(ArborError::CacheCapacity { .. }) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                    let _ = tree.match_prefix(&tokens);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(tree.cached_tokens() <= tree.max_tokens());
}

#[test]
fn split_waits_for_pending_edge() {
    // A second request that diverges inside a still-pending edge must wait
    // for the edge's owner before splitting, then succeed.
    let (tree, _) = tree_with(1000);

    let owner = tree.insert_pending(&[1, 2, 3, 4]).unwrap();
    let InsertOutcome::Created(mut owner_pin) = owner else {
        panic!("expected creation");
    };

    let splitter = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || tree.insert_pending(&[1, 2, 9]).unwrap())
    };

    thread::sleep(std::time::Duration::from_millis(30));
    owner_pin.finalize(100);

    let outcome = splitter.join().unwrap();
    let InsertOutcome::Created(pin) = outcome else {
        panic!("expected a new node after the split");
    };
    assert_eq!(pin.node().edge_tokens(), vec![9]);

    let intermediate = pin.node().parent().unwrap();
    assert_eq!(intermediate.edge_tokens(), vec![1, 2]);
    assert!(intermediate.is_ready());
}
