//! Chain-of-thought simulation for reasoning-capable models.
//!
//! Reasoning models stream a `reasoning_content` block before their final
//! answer. The block length is derived from the prompt hash so a given
//! prompt always produces the same reasoning token count.

use rand::prelude::IndexedRandom;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Bounds on simulated reasoning length, in tokens.
const MIN_REASONING_TOKENS: u64 = 20;
const MAX_REASONING_TOKENS: u64 = 60;

const REASONING_OPENERS: &[&str] = &[
    "Let", "me", "work", "through", "this", "step", "by", "step.",
];

const REASONING_WORDS: &[&str] = &[
    "First,", "consider", "the", "question", "carefully.", "Given", "constraints", "we", "can",
    "rule", "out", "several", "options.", "Next,", "check", "whether", "assumption", "holds.",
    "That", "suggests", "simpler", "approach.", "Combining", "these", "observations", "leads",
    "to", "answer.", "Verify", "result", "against", "original", "statement.",
];

/// Whether this model streams reasoning content before its answer.
pub fn is_reasoning_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    let family = lower.rsplit('/').next().unwrap_or(&lower);
    family.starts_with("o1")
        || family.starts_with("o3")
        || family.starts_with("o4")
        || lower.contains("deepseek-r1")
        || lower.contains("qwq")
        || lower.contains("thinking")
        || lower.contains("reasoner")
}

/// Reasoning token budget for a prompt: a value in
/// `[MIN_REASONING_TOKENS, MAX_REASONING_TOKENS]` chosen from the prompt
/// hash, so reruns of the same prompt reason for the same length.
pub fn reasoning_token_count(prompt_text: &str) -> u64 {
    let digest = Sha256::digest(prompt_text.as_bytes());
    let seed = u64::from_le_bytes(digest[..8].try_into().unwrap());
    MIN_REASONING_TOKENS + seed % (MAX_REASONING_TOKENS - MIN_REASONING_TOKENS + 1)
}

/// Generate `count` reasoning emission tokens (leading-space form, like the
/// content generator, so concatenation reads as prose).
pub fn reasoning_tokens<R: Rng + ?Sized>(rng: &mut R, count: u64) -> Vec<String> {
    let count = count as usize;
    let mut tokens = Vec::with_capacity(count);
    for i in 0..count {
        let word = if i < REASONING_OPENERS.len() && count > REASONING_OPENERS.len() {
            REASONING_OPENERS[i]
        } else {
            REASONING_WORDS.choose(rng).unwrap()
        };
        if i == 0 {
            tokens.push(word.to_string());
        } else {
            tokens.push(format!(" {}", word));
        }
    }
    tokens
}
