//! Arena-allocated radix tree over block hashes.
//!
//! Nodes live in one `Vec` and refer to each other by index, so the whole
//! tree can be mutated in place under a single lock and summarized cheaply
//! for metrics dumps. Because block hashes are chained (a hash identifies
//! its full prefix), each node has exactly one position in the tree and
//! lookup is a straight descent.

use super::BlockHash;

#[derive(Debug)]
struct Node {
    hash: BlockHash,
    children: Vec<u32>,
    /// Number of completed requests whose sequence passed through this block.
    touches: u32,
}

/// Prefix index for one worker.
#[derive(Debug)]
pub struct RadixTree {
    arena: Vec<Node>,
}

const ROOT: u32 = 0;

impl RadixTree {
    pub fn new() -> Self {
        Self {
            arena: vec![Node {
                hash: 0,
                children: Vec::new(),
                touches: 0,
            }],
        }
    }

    fn find_child(&self, parent: u32, hash: BlockHash) -> Option<u32> {
        self.arena[parent as usize]
            .children
            .iter()
            .copied()
            .find(|&idx| self.arena[idx as usize].hash == hash)
    }

    /// Insert a full block sequence, creating nodes below the deepest
    /// existing match and bumping touch counts along the path.
    pub fn insert(&mut self, blocks: &[BlockHash]) {
        let mut current = ROOT;
        for &hash in blocks {
            let next = match self.find_child(current, hash) {
                Some(idx) => idx,
                None => {
                    let idx = self.arena.len() as u32;
                    self.arena.push(Node {
                        hash,
                        children: Vec::new(),
                        touches: 0,
                    });
                    self.arena[current as usize].children.push(idx);
                    idx
                }
            };
            self.arena[next as usize].touches += 1;
            current = next;
        }
    }

    /// Length (in blocks) of the longest stored prefix of `blocks`.
    pub fn longest_prefix(&self, blocks: &[BlockHash]) -> usize {
        let mut current = ROOT;
        let mut matched = 0;
        for &hash in blocks {
            match self.find_child(current, hash) {
                Some(idx) => {
                    current = idx;
                    matched += 1;
                }
                None => break,
            }
        }
        matched
    }

    /// Number of distinct blocks stored (excluding the synthetic root).
    pub fn block_count(&self) -> usize {
        self.arena.len() - 1
    }
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}
