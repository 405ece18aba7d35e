//! Cost-based request routing over the worker pool.
//!
//! For each worker we estimate what serving the request would cost given its
//! cached prefix and current load, then take the cheapest. The matched
//! prefix feeds back into the response as `cached_tokens`.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::pool::WorkerPool;
use super::{blockify, BlockHash};

/// Per-token unit costs and term weights for the routing score.
#[derive(Debug, Clone)]
pub struct CostWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub c_prefill: f64,
    pub c_decode: f64,
    pub c_load: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            gamma: 1.0,
            c_prefill: 1.0,
            c_decode: 2.0,
            c_load: 50.0,
        }
    }
}

impl CostWeights {
    /// Default weights with the prefill/overlap weight (alpha) overridden.
    pub fn with_overlap_weight(alpha: f64) -> Self {
        Self {
            alpha,
            ..Default::default()
        }
    }
}

/// Outcome of one routing decision, kept until request completion and
/// surfaced in cache metrics.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub worker_id: usize,
    pub prompt_tokens: u64,
    /// Prefix tokens already cached on the chosen worker (block-aligned).
    pub cached_tokens: u64,
    pub prefill_cost: f64,
    pub decode_cost: f64,
    pub load_cost: f64,
    pub total_cost: f64,
    #[serde(skip)]
    pub blocks: Vec<BlockHash>,
}

/// Aggregate routing statistics for the metrics surface.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RouterStats {
    pub requests_routed: u64,
    pub prompt_tokens_seen: u64,
    pub cached_tokens_served: u64,
    /// cached / prompt over everything routed so far.
    pub hit_ratio: f64,
}

#[derive(Debug)]
pub struct SmartRouter {
    pool: Arc<WorkerPool>,
    block_size: usize,
    weights: CostWeights,
    round_robin: AtomicUsize,
    prompt_tokens_seen: AtomicU64,
    cached_tokens_served: AtomicU64,
    requests_routed: AtomicU64,
    recent: Mutex<VecDeque<RouteDecision>>,
}

/// Bound on retained routing decisions.
const RECENT_DECISIONS: usize = 1000;

impl SmartRouter {
    pub fn new(pool: Arc<WorkerPool>, block_size: usize, weights: CostWeights) -> Self {
        Self {
            pool,
            block_size: block_size.max(1),
            weights,
            round_robin: AtomicUsize::new(0),
            prompt_tokens_seen: AtomicU64::new(0),
            cached_tokens_served: AtomicU64::new(0),
            requests_routed: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_DECISIONS)),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pick the cheapest worker for this prompt and admit the request to it.
    /// The caller must pair every `route` with exactly one `complete`.
    pub fn route(&self, token_ids: &[u32], expected_output_tokens: u64) -> RouteDecision {
        let blocks = blockify(token_ids, self.block_size);
        let prompt_tokens = token_ids.len() as u64;
        let w = &self.weights;

        let rr = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let mut best: Option<(f64, usize, usize, u64, f64, f64, f64)> = None;

        for worker in self.pool.workers() {
            let (matched_blocks, active) = worker.probe(&blocks);
            let cached = (matched_blocks * self.block_size) as u64;
            let prefill = (prompt_tokens.saturating_sub(cached)) as f64 * w.c_prefill;
            let decode = expected_output_tokens as f64 * w.c_decode;
            let load = active as f64 * w.c_load;
            let total = w.alpha * prefill + w.beta * decode + w.gamma * load;

            let better = match &best {
                None => true,
                Some((best_total, best_active, best_id, ..)) => {
                    total < *best_total
                        || (total == *best_total && active < *best_active)
                        // Final tie-break: rotate the starting worker.
                        || (total == *best_total
                            && active == *best_active
                            && (worker.id + self.pool.len() - rr % self.pool.len())
                                % self.pool.len()
                                < (*best_id + self.pool.len() - rr % self.pool.len())
                                    % self.pool.len())
                }
            };
            if better {
                best = Some((total, active, worker.id, cached, prefill, decode, load));
            }
        }

        let (total, _, worker_id, cached, prefill, decode, load) =
            best.expect("worker pool is never empty");

        self.pool.get(worker_id).admit();
        self.requests_routed.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens_seen
            .fetch_add(prompt_tokens, Ordering::Relaxed);
        self.cached_tokens_served.fetch_add(cached, Ordering::Relaxed);

        let decision = RouteDecision {
            worker_id,
            prompt_tokens,
            cached_tokens: cached,
            prefill_cost: prefill,
            decode_cost: decode,
            load_cost: load,
            total_cost: total,
            blocks,
        };

        tracing::debug!(
            worker = worker_id,
            cached = cached,
            prompt = prompt_tokens,
            cost = total,
            "routed request"
        );

        let mut recent = self.recent.lock();
        if recent.len() >= RECENT_DECISIONS {
            recent.pop_front();
        }
        recent.push_back(decision.clone());

        decision
    }

    /// Finish a routed request: free the worker slot and, when the request
    /// produced a normal completion, publish its blocks for future reuse.
    pub fn complete(&self, decision: &RouteDecision, total_tokens: u64, success: bool) {
        self.pool
            .get(decision.worker_id)
            .release(&decision.blocks, total_tokens, success);
    }

    pub fn stats(&self) -> RouterStats {
        let prompt = self.prompt_tokens_seen.load(Ordering::Relaxed);
        let cached = self.cached_tokens_served.load(Ordering::Relaxed);
        RouterStats {
            requests_routed: self.requests_routed.load(Ordering::Relaxed),
            prompt_tokens_seen: prompt,
            cached_tokens_served: cached,
            hit_ratio: if prompt > 0 {
                cached as f64 / prompt as f64
            } else {
                0.0
            },
        }
    }

    /// Most recent routing decisions, newest last.
    pub fn recent_decisions(&self, limit: usize) -> Vec<RouteDecision> {
        let recent = self.recent.lock();
        recent
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}
