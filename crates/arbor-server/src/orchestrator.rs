//! Request orchestrator
//!
//! Drives one chat completion through the cache manager and the engine:
//! prefix match, forward pass for the uncached suffix, the autoregressive
//! generation loop, and the bulk insert of the generated run as a single
//! trie edge. Handle ownership: node handles belong to the trie and are
//! never freed here; loop temporaries belong to this orchestrator until the
//! bulk insert moves the final one into the trie.

use crate::tokenizer::EOS_TOKEN;
use arbor_engine::CacheEngine;
use arbor_radix::{InsertOutcome, NodePin, RadixTree};
use arbor_types::{ArborError, CacheHandle, Result, TokenId};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token or cancellation.
    Stop,
    /// The max_tokens ceiling.
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

/// Outcome of one completion.
#[derive(Debug)]
pub struct Generation {
    pub tokens: Vec<TokenId>,
    pub finish_reason: FinishReason,
}

/// Coordinates the per-request flow between the trie and the engine.
pub struct Orchestrator {
    tree: Arc<RadixTree>,
    engine: Arc<dyn CacheEngine>,
}

impl Orchestrator {
    pub fn new(tree: Arc<RadixTree>, engine: Arc<dyn CacheEngine>) -> Self {
        Self { tree, engine }
    }

    pub fn tree(&self) -> &Arc<RadixTree> {
        &self.tree
    }

    /// Run one completion. `cancel` is observed between generation
    /// iterations; whatever was generated by then is still cached and
    /// returned.
    pub fn generate(
        &self,
        prompt: &[TokenId],
        max_tokens: usize,
        temperature: f32,
        cancel: &AtomicBool,
    ) -> Result<Generation> {
        if prompt.is_empty() {
            return Err(ArborError::invalid_request("empty prompt"));
        }

        let mut logits = vec![0.0f32; self.engine.vocab_size()];

        // Prefix stage: deepest cached prefix, pinned for the whole request.
        let matched = self.tree.match_prefix(prompt);
        let covered = matched.as_ref().map(|m| m.covered()).unwrap_or(0);
        let suffix = &prompt[covered..];
        debug!(
            prompt_len = prompt.len(),
            covered,
            suffix_len = suffix.len(),
            "Prefix stage"
        );

        // Prompt stage: make sure a ready node covers the whole prompt.
        // `h` is the live cache handle for the generation loop; it belongs
        // to the trie until the first loop forward replaces it.
        let mut prompt_pin: Option<NodePin> = None;
        let mut h: CacheHandle;
        let mut h_owned = false;
        let mut seed_logits = false;

        if suffix.is_empty() {
            h = matched
                .as_ref()
                .expect("full cover implies a match")
                .handle();
        } else {
            match self.tree.insert_pending(prompt)? {
                InsertOutcome::Existing(pin) => {
                    // Another request owns (or owned) the forward pass.
                    h = pin.wait()?;
                    prompt_pin = Some(pin);
                }
                InsertOutcome::Created(mut pin) => {
                    let Some(parent) = pin.node().parent() else {
                        let err = ArborError::internal("pending node lost its parent");
                        pin.fail(err.clone());
                        return Err(err);
                    };
                    // The parent may itself still be pending; wait outside
                    // any lock for its owner to resolve it.
                    let base = match parent.wait() {
                        Ok(base) => base,
                        Err(err) => {
                            pin.fail(err.clone());
                            return Err(err);
                        }
                    };
                    let edge = pin.node().edge_tokens();
                    match self.engine.forward_with_cache(&edge, base, &mut logits) {
                        Ok(new_handle) => {
                            pin.finalize(new_handle);
                            h = new_handle;
                            seed_logits = true;
                            prompt_pin = Some(pin);
                        }
                        Err(err) => {
                            pin.fail(err.clone());
                            return Err(err);
                        }
                    }
                }
            }
        }

        // Generation stage: lock-free relative to the trie.
        let mut buffer: Vec<TokenId> = Vec::new();
        let mut finish_reason = FinishReason::Length;
        let mut last_token = *prompt.last().expect("prompt checked non-empty");

        // The prompt forward already produced logits for the last position;
        // the first generated token comes straight from them. On a full
        // cache hit the loop below bootstraps by re-feeding the prompt's
        // final token on the node's handle.
        if seed_logits && max_tokens > 0 {
            let next = sample(&logits, temperature);
            buffer.push(next);
            last_token = next;
            if next == EOS_TOKEN || next == 0 {
                finish_reason = FinishReason::Stop;
            }
        }

        while buffer.len() < max_tokens && finish_reason != FinishReason::Stop {
            if cancel.load(Ordering::Acquire) {
                debug!(generated = buffer.len(), "Generation cancelled");
                finish_reason = FinishReason::Stop;
                break;
            }

            let new_handle = match self.engine.forward_with_cache(&[last_token], h, &mut logits) {
                Ok(handle) => handle,
                Err(err) => {
                    if h_owned {
                        self.engine.free_cache(h);
                    }
                    return Err(err);
                }
            };
            if h_owned {
                self.engine.free_cache(h);
            }
            h = new_handle;
            h_owned = true;

            let next = sample(&logits, temperature);
            buffer.push(next);
            last_token = next;
            if next == EOS_TOKEN || next == 0 {
                finish_reason = FinishReason::Stop;
            }
        }

        // Bulk-insert stage: attach the whole run as one edge and hand the
        // final handle to the trie. Only possible when the loop produced a
        // handle of its own; a seed-only generation has no handle covering
        // prompt + buffer.
        if !buffer.is_empty() && h_owned {
            let full: Vec<TokenId> = prompt.iter().chain(buffer.iter()).copied().collect();
            match self.tree.insert_pending(&full) {
                Ok(InsertOutcome::Created(mut pin)) => {
                    pin.finalize(h);
                    h_owned = false;
                }
                Ok(InsertOutcome::Existing(_)) => {
                    // Another request cached the same run first.
                }
                Err(err) => {
                    warn!(error = %err, "Skipping generation cache insert");
                }
            }
        }
        if h_owned {
            self.engine.free_cache(h);
        }

        drop(prompt_pin);
        drop(matched);

        debug!(
            generated = buffer.len(),
            finish_reason = finish_reason.as_str(),
            "Generation complete"
        );
        Ok(Generation {
            tokens: buffer,
            finish_reason,
        })
    }
}

/// Sample a token from logits: greedy argmax at `temperature <= 0`,
/// temperature-scaled softmax otherwise.
fn sample(logits: &[f32], temperature: f32) -> TokenId {
    if temperature <= 0.0 {
        return argmax(logits);
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = logits
        .iter()
        .map(|&logit| ((logit - max) / temperature).exp())
        .collect();
    let total: f32 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return argmax(logits);
    }

    let mut target = rand::thread_rng().gen::<f32>() * total;
    for (index, weight) in weights.iter().enumerate() {
        target -= weight;
        if target <= 0.0 {
            return index as TokenId;
        }
    }
    (weights.len() - 1) as TokenId
}

fn argmax(logits: &[f32]) -> TokenId {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(index, _)| index as TokenId)
        .unwrap_or(0)
}
