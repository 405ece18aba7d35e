//! Simulated KV-cache: block-granular prefix reuse over a fixed worker pool.
//!
//! Prompts are mapped to pseudo token-id sequences, grouped into fixed-size
//! blocks, and each block is identified by a hash chained over everything
//! before it. Chained hashing means block N's hash pins down the entire
//! prefix, so two sequences share a block hash iff they share the whole
//! prefix up to and including that block.

pub mod pool;
pub mod radix;
pub mod router;

pub use pool::{WorkerPool, WorkerSnapshot};
pub use router::{RouteDecision, SmartRouter};

/// Identity of one token block (and, transitively, of its whole prefix).
pub type BlockHash = u64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x1000_0000_01b3;

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = if seed == 0 { FNV_OFFSET } else { seed };
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map prompt text to pseudo token ids: one id per whitespace word. The ids
/// are stable across processes, which keeps routing reproducible in tests.
pub fn text_to_token_ids(text: &str) -> Vec<u32> {
    text.split_whitespace()
        .map(|word| fnv1a(0, word.as_bytes()) as u32)
        .collect()
}

/// Group `token_ids` into fully populated blocks of `block_size` and return
/// the chained block hashes. A trailing partial block is dropped: reuse is
/// only counted for complete blocks.
pub fn blockify(token_ids: &[u32], block_size: usize) -> Vec<BlockHash> {
    debug_assert!(block_size > 0);
    let mut hashes = Vec::with_capacity(token_ids.len() / block_size);
    let mut chain: u64 = 0;
    for block in token_ids.chunks_exact(block_size) {
        for &id in block {
            chain = fnv1a(chain, &id.to_le_bytes());
        }
        hashes.push(chain);
    }
    hashes
}
