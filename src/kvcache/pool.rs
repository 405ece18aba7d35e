//! Fixed pool of simulated inference workers.
//!
//! Each worker owns its prefix index and counters behind one mutex; there is
//! no cross-worker consistency, which is exactly the granularity the router
//! needs. Workers are created at startup and never destroyed.

use parking_lot::Mutex;
use serde::Serialize;

use super::radix::RadixTree;
use super::BlockHash;

#[derive(Debug)]
pub struct Worker {
    pub id: usize,
    state: Mutex<WorkerState>,
}

#[derive(Debug, Default)]
struct WorkerState {
    active_requests: usize,
    total_tokens_processed: u64,
    tree: RadixTree,
}

/// Point-in-time view of one worker, for routing math and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub active_requests: usize,
    pub total_tokens_processed: u64,
    pub cached_blocks: usize,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: Mutex::new(WorkerState::default()),
        }
    }

    /// Matched prefix length (blocks) and current load, read atomically.
    pub fn probe(&self, blocks: &[BlockHash]) -> (usize, usize) {
        let state = self.state.lock();
        (state.tree.longest_prefix(blocks), state.active_requests)
    }

    pub fn admit(&self) {
        self.state.lock().active_requests += 1;
    }

    /// Release the admission slot. On successful completion the request's
    /// blocks are inserted so later requests can reuse the prefix.
    pub fn release(&self, blocks: &[BlockHash], tokens_processed: u64, insert: bool) {
        let mut state = self.state.lock();
        state.active_requests = state.active_requests.saturating_sub(1);
        state.total_tokens_processed += tokens_processed;
        if insert && !blocks.is_empty() {
            state.tree.insert(blocks);
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.lock();
        WorkerSnapshot {
            id: self.id,
            active_requests: state.active_requests,
            total_tokens_processed: state.total_tokens_processed,
            cached_blocks: state.tree.block_count(),
        }
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        Self {
            workers: (0..num_workers.max(1)).map(Worker::new).collect(),
        }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn get(&self, id: usize) -> &Worker {
        &self.workers[id]
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(Worker::snapshot).collect()
    }

    /// Total in-flight requests across the pool.
    pub fn active_requests(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.state.lock().active_requests)
            .sum()
    }
}
