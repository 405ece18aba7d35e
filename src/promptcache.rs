//! Prompt cache: request fingerprint -> previously observed cached-token
//! count, with TTL expiry and LRU pressure eviction.
//!
//! The fingerprint covers only the semantically relevant request fields so
//! that retries and per-user metadata changes still hit.

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::openai::{ChatCompletionRequest, ToolDefinition};

/// Stable fingerprint over `(model, messages, tools, response_format)`.
/// Message content is trimmed and tool definitions are sorted by name, so
/// ordering noise and whitespace do not split cache entries.
pub fn fingerprint(request: &ChatCompletionRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());
    hasher.update([0]);

    for message in &request.messages {
        hasher.update(message.role.as_bytes());
        hasher.update([1]);
        if let Some(text) = message.text_content() {
            hasher.update(text.trim().as_bytes());
        }
        hasher.update([2]);
    }

    if let Some(tools) = &request.tools {
        let mut sorted: Vec<&ToolDefinition> = tools.iter().collect();
        sorted.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        for tool in sorted {
            hasher.update(tool.function.name.as_bytes());
            hasher.update([3]);
            if let Some(params) = &tool.function.parameters {
                hasher.update(params.to_string().as_bytes());
            }
            hasher.update([4]);
        }
    }

    if let Some(format) = &request.response_format {
        hasher.update(format.format_type.as_bytes());
        if let Some(schema) = &format.json_schema {
            hasher.update(schema.schema.to_string().as_bytes());
        }
    }

    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    cached_tokens: u64,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PromptCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct PromptCache {
    ttl: Duration,
    min_tokens: u64,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Default bound on retained fingerprints.
pub const DEFAULT_CAPACITY: usize = 10_000;

impl PromptCache {
    pub fn new(ttl: Duration, min_tokens: u64, capacity: usize) -> Self {
        Self {
            ttl,
            min_tokens,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Cached-token count for this fingerprint, if present and fresh.
    /// Expired entries are dropped on the way out.
    pub fn lookup(&self, fp: &str) -> Option<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let fresh = inner
            .entries
            .get(fp)
            .map(|entry| now.duration_since(entry.created_at) <= self.ttl);
        match fresh {
            Some(true) => {
                let mut tokens = 0;
                if let Some(entry) = inner.entries.get_mut(fp) {
                    entry.last_used = now;
                    tokens = entry.cached_tokens;
                }
                inner.hits += 1;
                Some(tokens)
            }
            Some(false) => {
                inner.entries.remove(fp);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Record the cached-token count observed at completion. Prompts below
    /// the caching threshold are not stored.
    pub fn insert(&self, fp: &str, prompt_tokens: u64, cached_tokens: u64) {
        if prompt_tokens < self.min_tokens {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(fp) && inner.entries.len() >= self.capacity {
            // LRU eviction under pressure.
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
            }
        }

        inner.entries.insert(
            fp.to_string(),
            CacheEntry {
                cached_tokens,
                created_at: now,
                last_used: now,
            },
        );
    }

    pub fn stats(&self) -> PromptCacheStats {
        let inner = self.inner.lock();
        PromptCacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}
