use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// Rate-limit tier table: `(requests_per_minute, tokens_per_minute)`.
///
/// Mirrors the published OpenAI tier ladder closely enough for load tests;
/// explicit `rate_limit_rpm` / `rate_limit_tpm` overrides win over the table.
pub fn tier_limits(tier: &str) -> Option<(u32, u64)> {
    match tier {
        "free" => Some((3, 200_000)),
        "tier-1" => Some((500, 2_000_000)),
        "tier-2" => Some((5_000, 4_000_000)),
        "tier-3" => Some((5_000, 10_000_000)),
        "tier-4" => Some((10_000, 30_000_000)),
        "tier-5" => Some((30_000, 150_000_000)),
        _ => None,
    }
}

/// Full simulator configuration. Deserialized from a JSON file and/or
/// overridden field-by-field from the CLI. Every knob has a default so an
/// empty config file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,

    /// Base delay applied to non-streaming responses, in seconds.
    pub response_delay: f64,
    /// Apply random variance to `response_delay`.
    pub random_delay: bool,
    /// Maximum relative variance applied when `random_delay` is set.
    pub max_variance: f64,

    /// Time-to-first-token target in milliseconds.
    pub ttft_ms: u64,
    /// Relative TTFT jitter, e.g. 0.3 = +/-30%.
    pub ttft_variance_pct: f64,
    /// Inter-token latency target in milliseconds.
    pub itl_ms: u64,
    /// Relative ITL jitter.
    pub itl_variance_pct: f64,

    pub require_api_key: bool,
    /// Accepted keys. Entries starting with `@` are file paths holding one
    /// key per line; `~` is expanded.
    pub api_keys: Vec<String>,

    pub rate_limit_enabled: bool,
    /// One of `free`, `tier-1` .. `tier-5`.
    pub rate_limit_tier: String,
    pub rate_limit_rpm: Option<u32>,
    pub rate_limit_tpm: Option<u64>,

    pub kv_cache_enabled: bool,
    pub kv_cache_block_size: usize,
    pub kv_cache_num_workers: usize,
    /// Weight of the prefill term in the routing cost (alpha).
    pub kv_overlap_weight: f64,

    pub enable_prompt_caching: bool,
    pub cache_ttl_seconds: u64,
    pub min_tokens_for_cache: u64,

    pub stream_timeout_seconds: u64,
    pub stream_token_timeout_seconds: u64,
    pub stream_keepalive_enabled: bool,
    pub stream_keepalive_interval_seconds: u64,

    pub enable_context_validation: bool,
    pub enable_moderation: bool,
    pub enable_safety_features: bool,
    pub enable_jailbreak_detection: bool,
    pub prepend_safety_message: bool,

    pub error_injection_enabled: bool,
    /// Probability in [0, 1] that a request receives an injected error.
    pub error_injection_rate: f64,
    pub error_injection_types: Vec<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            response_delay: 0.0,
            random_delay: false,
            max_variance: 0.3,
            ttft_ms: default_ttft_ms(),
            ttft_variance_pct: 0.3,
            itl_ms: default_itl_ms(),
            itl_variance_pct: 0.3,
            require_api_key: false,
            api_keys: Vec::new(),
            rate_limit_enabled: false,
            rate_limit_tier: "free".to_string(),
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            kv_cache_enabled: true,
            kv_cache_block_size: 16,
            kv_cache_num_workers: 4,
            kv_overlap_weight: 1.0,
            enable_prompt_caching: true,
            cache_ttl_seconds: 300,
            min_tokens_for_cache: 1024,
            stream_timeout_seconds: 300,
            stream_token_timeout_seconds: 30,
            stream_keepalive_enabled: true,
            stream_keepalive_interval_seconds: 15,
            enable_context_validation: false,
            enable_moderation: true,
            enable_safety_features: false,
            enable_jailbreak_detection: false,
            prepend_safety_message: false,
            error_injection_enabled: false,
            error_injection_rate: 0.0,
            error_injection_types: default_error_types(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_ttft_ms() -> u64 {
    200
}

fn default_itl_ms() -> u64 {
    50
}

fn default_error_types() -> Vec<String> {
    [
        "internal_error",
        "bad_gateway",
        "service_unavailable",
        "gateway_timeout",
        "rate_limit_quota",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl SimConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let content = fs::read_to_string(&expanded)
            .with_context(|| format!("Failed to read config file: {}", expanded))?;
        let config: SimConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check values that would otherwise fail far from their source.
    pub fn validate(&self) -> Result<()> {
        if tier_limits(&self.rate_limit_tier).is_none() {
            bail!(
                "Unknown rate_limit_tier '{}' (expected free or tier-1..tier-5)",
                self.rate_limit_tier
            );
        }
        if !(0.0..=1.0).contains(&self.error_injection_rate) {
            bail!(
                "error_injection_rate must be in [0, 1], got {}",
                self.error_injection_rate
            );
        }
        if self.kv_cache_block_size == 0 {
            bail!("kv_cache_block_size must be >= 1");
        }
        if self.kv_cache_num_workers == 0 {
            bail!("kv_cache_num_workers must be >= 1");
        }
        Ok(())
    }

    /// Effective `(rpm, tpm)` after applying explicit overrides to the tier.
    pub fn rate_limits(&self) -> (u32, u64) {
        let (tier_rpm, tier_tpm) =
            tier_limits(&self.rate_limit_tier).unwrap_or_else(|| tier_limits("free").unwrap());
        (
            self.rate_limit_rpm.unwrap_or(tier_rpm),
            self.rate_limit_tpm.unwrap_or(tier_tpm),
        )
    }

    /// Resolve the accepted API-key set, reading `@file` entries from disk.
    pub fn resolve_api_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in &self.api_keys {
            if let Some(path) = entry.strip_prefix('@') {
                let expanded = shellexpand::tilde(path).to_string();
                let content = fs::read_to_string(&expanded)
                    .with_context(|| format!("Failed to read API key file: {}", expanded))?;
                keys.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(String::from),
                );
            } else {
                keys.push(entry.clone());
            }
        }
        Ok(keys)
    }
}
