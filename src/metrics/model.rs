//! Per-model request/token/cost attribution.
//!
//! One record per model id ever seen; never evicted. The pricing table is
//! advisory: it exists so cost dashboards have plausible numbers to chew
//! on, not to reconcile invoices.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};

use super::window::percentile;

/// `(model prefix, input $/1k tokens, output $/1k tokens)`, most specific
/// prefix first. Unknown models fall through to `DEFAULT_PRICING`.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.000_15, 0.000_6),
    ("gpt-4o", 0.002_5, 0.01),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4", 0.03, 0.06),
    ("gpt-3.5-turbo", 0.000_5, 0.001_5),
    ("o1", 0.015, 0.06),
    ("o3", 0.01, 0.04),
    ("deepseek", 0.000_55, 0.002_19),
    ("meta-llama", 0.000_9, 0.000_9),
    ("claude", 0.003, 0.015),
    ("text-embedding", 0.000_1, 0.0),
];

const DEFAULT_PRICING: (f64, f64) = (0.000_5, 0.001_5);

/// Latency samples retained per model.
const LATENCY_RING: usize = 1000;

pub fn pricing_for(model: &str) -> (f64, f64) {
    for (prefix, input, output) in MODEL_PRICING {
        if model.starts_with(prefix) {
            return (*input, *output);
        }
    }
    DEFAULT_PRICING
}

#[derive(Debug, Default)]
struct ModelMetrics {
    request_count: u64,
    error_count: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    cost_usd: f64,
    latency_ms: VecDeque<f64>,
    per_endpoint: HashMap<String, u64>,
    per_user: HashMap<String, u64>,
    /// Requests per hour-of-day, UTC.
    hour_buckets: [u64; 24],
}

#[derive(Debug, Default)]
pub struct ModelMetricsRegistry {
    models: Mutex<HashMap<String, ModelMetrics>>,
}

/// Serializable view of one model's stats.
#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub model: String,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms_avg: f64,
    pub latency_ms_p50: f64,
    pub latency_ms_p99: f64,
    pub per_endpoint: HashMap<String, u64>,
    pub per_user: HashMap<String, u64>,
    pub hour_buckets: Vec<u64>,
}

impl ModelMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request (errors included).
    pub fn record(
        &self,
        model: &str,
        endpoint: &str,
        user: Option<&str>,
        prompt_tokens: u64,
        completion_tokens: u64,
        latency_ms: f64,
        is_error: bool,
    ) {
        let (input_rate, output_rate) = pricing_for(model);
        let hour = chrono::Utc::now().format("%H").to_string();
        let hour_idx: usize = hour.parse::<usize>().unwrap_or(0).min(23);

        let mut models = self.models.lock();
        let entry = models.entry(model.to_string()).or_default();
        entry.request_count += 1;
        if is_error {
            entry.error_count += 1;
        }
        entry.prompt_tokens += prompt_tokens;
        entry.completion_tokens += completion_tokens;
        entry.cost_usd += prompt_tokens as f64 / 1000.0 * input_rate
            + completion_tokens as f64 / 1000.0 * output_rate;
        if entry.latency_ms.len() >= LATENCY_RING {
            entry.latency_ms.pop_front();
        }
        entry.latency_ms.push_back(latency_ms);
        *entry.per_endpoint.entry(endpoint.to_string()).or_default() += 1;
        if let Some(user) = user {
            *entry.per_user.entry(user.to_string()).or_default() += 1;
        }
        entry.hour_buckets[hour_idx] += 1;
    }

    pub fn by_model(&self, model: &str) -> Option<ModelReport> {
        let models = self.models.lock();
        models.get(model).map(|m| report(model, m))
    }

    pub fn all(&self) -> Vec<ModelReport> {
        let models = self.models.lock();
        let mut reports: Vec<ModelReport> =
            models.iter().map(|(name, m)| report(name, m)).collect();
        reports.sort_by(|a, b| b.request_count.cmp(&a.request_count));
        reports
    }

    /// Side-by-side comparison with a winner per metric. Lower latency,
    /// lower error rate, and lower cost per request win.
    pub fn compare(&self, a: &str, b: &str) -> Option<Value> {
        let (ra, rb) = (self.by_model(a)?, self.by_model(b)?);

        let winner = |lower_wins: bool, va: f64, vb: f64| -> &str {
            if va == vb {
                "tie"
            } else if (va < vb) == lower_wins {
                a
            } else {
                b
            }
        };
        let cost_per_request = |r: &ModelReport| {
            if r.request_count > 0 {
                r.cost_usd / r.request_count as f64
            } else {
                0.0
            }
        };

        let winners = json!({
            "latency": winner(true, ra.latency_ms_avg, rb.latency_ms_avg),
            "error_rate": winner(true, ra.error_rate, rb.error_rate),
            "cost_efficiency": winner(true, cost_per_request(&ra), cost_per_request(&rb)),
            "throughput": winner(false, ra.request_count as f64, rb.request_count as f64),
        });
        let mut models = serde_json::Map::new();
        models.insert(a.to_string(), serde_json::to_value(ra).ok()?);
        models.insert(b.to_string(), serde_json::to_value(rb).ok()?);
        Some(json!({
            "models": models,
            "winners": winners,
        }))
    }

    /// Top models by a named metric.
    pub fn ranking(&self, metric: &str, limit: usize) -> Result<Vec<Value>, String> {
        let mut reports = self.all();
        match metric {
            "requests" => reports.sort_by(|x, y| y.request_count.cmp(&x.request_count)),
            "tokens" => reports.sort_by(|x, y| y.total_tokens.cmp(&x.total_tokens)),
            "errors" => reports.sort_by(|x, y| {
                y.error_rate
                    .partial_cmp(&x.error_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            "cost" => reports.sort_by(|x, y| {
                y.cost_usd
                    .partial_cmp(&x.cost_usd)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            // Fastest first.
            "latency_p50" => reports.sort_by(|x, y| {
                x.latency_ms_p50
                    .partial_cmp(&y.latency_ms_p50)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            other => return Err(format!("unknown ranking metric '{}'", other)),
        }
        Ok(reports
            .into_iter()
            .take(limit)
            .map(|r| {
                json!({
                    "model": r.model,
                    "request_count": r.request_count,
                    "total_tokens": r.total_tokens,
                    "error_rate": r.error_rate,
                    "cost_usd": r.cost_usd,
                    "latency_ms_p50": r.latency_ms_p50,
                })
            })
            .collect())
    }

    /// Total and per-model cost summary.
    pub fn costs(&self) -> Value {
        let reports = self.all();
        let total: f64 = reports.iter().map(|r| r.cost_usd).sum();
        json!({
            "total_cost_usd": total,
            "by_model": reports
                .iter()
                .map(|r| json!({"model": r.model, "cost_usd": r.cost_usd}))
                .collect::<Vec<_>>(),
        })
    }
}

fn report(name: &str, m: &ModelMetrics) -> ModelReport {
    let mut latencies: Vec<f64> = m.latency_ms.iter().copied().collect();
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let avg = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };
    ModelReport {
        model: name.to_string(),
        request_count: m.request_count,
        error_count: m.error_count,
        error_rate: if m.request_count > 0 {
            m.error_count as f64 / m.request_count as f64
        } else {
            0.0
        },
        prompt_tokens: m.prompt_tokens,
        completion_tokens: m.completion_tokens,
        total_tokens: m.prompt_tokens + m.completion_tokens,
        cost_usd: m.cost_usd,
        latency_ms_avg: avg,
        latency_ms_p50: percentile(&latencies, 50.0),
        latency_ms_p99: percentile(&latencies, 99.0),
        per_endpoint: m.per_endpoint.clone(),
        per_user: m.per_user.clone(),
        hour_buckets: m.hour_buckets.to_vec(),
    }
}
