//! Tokenizer-free text synthesis.
//!
//! Produces filler prose of an exact token length, where a "token" is one
//! emission unit of the streaming engine (a word with its leading space and
//! any attached punctuation). Content is meaningless by design; shape and
//! length are what load tests care about.

use rand::prelude::IndexedRandom;
use rand::Rng;

const NOUNS: &[&str] = &[
    "system", "model", "request", "response", "latency", "pipeline", "token", "stream", "worker",
    "cache", "signal", "result", "dataset", "service", "query", "budget", "window", "cluster",
    "metric", "session",
];

const VERBS: &[&str] = &[
    "processes", "returns", "computes", "streams", "updates", "validates", "schedules", "tracks",
    "produces", "handles", "evaluates", "aggregates", "balances", "records",
];

const ADJECTIVES: &[&str] = &[
    "current", "expected", "average", "stable", "active", "pending", "partial", "complete",
    "nominal", "overall", "typical", "relevant",
];

const CONNECTIVES: &[&str] = &[
    "and", "while", "because", "so", "then", "although", "once", "until",
];

/// Minimum sentence length in words before a period may land.
const MIN_SENTENCE_WORDS: usize = 6;
const MAX_SENTENCE_WORDS: usize = 14;

/// Generate exactly `count` emission tokens. Each entry carries its own
/// leading space (except the first), so concatenation yields normal prose.
pub fn generate_tokens<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<String> {
    let mut tokens = Vec::with_capacity(count);
    if count == 0 {
        return tokens;
    }

    let mut sentence_len = 0usize;
    let mut sentence_target = rng.random_range(MIN_SENTENCE_WORDS..=MAX_SENTENCE_WORDS);
    let mut capitalize = true;

    for i in 0..count {
        let word = pick_word(rng, sentence_len);
        let mut token = String::with_capacity(word.len() + 2);
        if i > 0 {
            token.push(' ');
        }
        if capitalize {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                token.push(first.to_ascii_uppercase());
                token.extend(chars);
            }
            capitalize = false;
        } else {
            token.push_str(word);
        }

        sentence_len += 1;
        let last = i + 1 == count;
        if last || sentence_len >= sentence_target {
            token.push('.');
            sentence_len = 0;
            sentence_target = rng.random_range(MIN_SENTENCE_WORDS..=MAX_SENTENCE_WORDS);
            capitalize = true;
        } else if sentence_len > 2 && rng.random_bool(0.12) {
            token.push(',');
        }

        tokens.push(token);
    }

    tokens
}

/// Convenience wrapper: `count` tokens joined into one string.
pub fn generate_text<R: Rng + ?Sized>(rng: &mut R, count: usize) -> String {
    generate_tokens(rng, count).concat()
}

fn pick_word<R: Rng + ?Sized>(rng: &mut R, position_in_sentence: usize) -> &'static str {
    // Rough grammar: adjective/noun openers, verbs mid-sentence, the odd
    // connective to keep it from reading like a word list.
    match position_in_sentence % 4 {
        0 => {
            if rng.random_bool(0.4) {
                ADJECTIVES.choose(rng).unwrap()
            } else {
                NOUNS.choose(rng).unwrap()
            }
        }
        1 => VERBS.choose(rng).unwrap(),
        2 => NOUNS.choose(rng).unwrap(),
        _ => {
            if rng.random_bool(0.3) {
                CONNECTIVES.choose(rng).unwrap()
            } else {
                NOUNS.choose(rng).unwrap()
            }
        }
    }
}

/// A single plausible word, length clamped to `[min_len, max_len]`. Used by
/// the structured-output engine for unconstrained string fields.
pub fn random_word<R: Rng + ?Sized>(rng: &mut R, min_len: usize, max_len: usize) -> String {
    let base = NOUNS.choose(rng).unwrap().to_string();
    let max_len = max_len.max(min_len).max(1);
    let mut word = base;
    while word.len() < min_len {
        word.push_str(NOUNS.choose(rng).unwrap());
    }
    word.truncate(max_len);
    // Never return an empty string for a non-empty request.
    if word.is_empty() {
        word.push('x');
    }
    word
}
