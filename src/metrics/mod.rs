//! Metrics registries: sliding-window endpoint stats, streaming lifecycle,
//! per-model attribution, rate-limit analytics, and Prometheus export.
//!
//! Each sub-registry owns its own lock; nothing here holds a lock across
//! I/O. The Prometheus collectors are process-global (registered once) and
//! mirror the hot counters for scrape-based monitoring, while the JSON/CSV
//! views are computed from the in-process windows on demand.

pub mod model;
pub mod ratelimit;
pub mod streaming;
pub mod window;
pub mod ws;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use model::ModelMetricsRegistry;
use ratelimit::RateLimitMetricsRegistry;
use streaming::StreamingTracker;
use window::SlidingWindow;

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mocklm_requests_total",
        "Total requests per endpoint",
        &["endpoint"]
    )
    .unwrap();

    static ref FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "mocklm_failures_total",
        "Total failed requests per endpoint",
        &["endpoint"]
    )
    .unwrap();

    static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "mocklm_request_duration_seconds",
        "Request duration in seconds per endpoint",
        &["endpoint"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    static ref PROMPT_TOKENS_TOTAL: CounterVec = register_counter_vec!(
        "mocklm_prompt_tokens_total",
        "Prompt tokens processed per model",
        &["model"]
    )
    .unwrap();

    static ref COMPLETION_TOKENS_TOTAL: CounterVec = register_counter_vec!(
        "mocklm_completion_tokens_total",
        "Completion tokens generated per model",
        &["model"]
    )
    .unwrap();

    static ref CACHED_TOKENS_TOTAL: CounterVec = register_counter_vec!(
        "mocklm_cached_tokens_total",
        "Prompt tokens served from the simulated KV cache per model",
        &["model"]
    )
    .unwrap();

    static ref ACTIVE_STREAMS: Gauge = register_gauge!(
        "mocklm_active_streams",
        "Current number of active SSE streams"
    )
    .unwrap();

    static ref RATE_LIMIT_THROTTLES: CounterVec = register_counter_vec!(
        "mocklm_rate_limit_throttles_total",
        "Requests denied by the rate limiter per tier",
        &["tier"]
    )
    .unwrap();
}

/// Per-endpoint sliding windows.
#[derive(Debug, Default)]
struct EndpointMetrics {
    arrivals: SlidingWindow,
    completions: SlidingWindow,
    tokens: SlidingWindow,
    errors: SlidingWindow,
    latency_ms: SlidingWindow,
}

/// Everything the server measures, bundled for `AppState`.
#[derive(Debug)]
pub struct MetricsRegistry {
    started_at: Instant,
    endpoints: RwLock<HashMap<String, Arc<EndpointMetrics>>>,
    pub streaming: StreamingTracker,
    pub models: ModelMetricsRegistry,
    pub rate_limits: RateLimitMetricsRegistry,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            endpoints: RwLock::new(HashMap::new()),
            streaming: StreamingTracker::new(),
            models: ModelMetricsRegistry::new(),
            rate_limits: RateLimitMetricsRegistry::new(),
        }
    }

    fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        if let Some(metrics) = self.endpoints.read().get(path) {
            return metrics.clone();
        }
        self.endpoints
            .write()
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    pub fn record_arrival(&self, path: &str) {
        self.endpoint(path).arrivals.record(1.0);
        REQUESTS_TOTAL.with_label_values(&[path]).inc();
    }

    /// Record a finished request. Rate-limit denials are not errors here;
    /// they are recorded via `record_throttle` only.
    pub fn record_completion(&self, path: &str, latency_ms: f64, tokens: u64, is_error: bool) {
        let endpoint = self.endpoint(path);
        endpoint.completions.record(1.0);
        endpoint.latency_ms.record(latency_ms);
        if tokens > 0 {
            endpoint.tokens.record(tokens as f64);
        }
        if is_error {
            endpoint.errors.record(1.0);
            FAILURES_TOTAL.with_label_values(&[path]).inc();
        }
        REQUEST_DURATION
            .with_label_values(&[path])
            .observe(latency_ms / 1000.0);
    }

    pub fn record_tokens(&self, model: &str, prompt: u64, completion: u64, cached: u64) {
        PROMPT_TOKENS_TOTAL
            .with_label_values(&[model])
            .inc_by(prompt as f64);
        COMPLETION_TOKENS_TOTAL
            .with_label_values(&[model])
            .inc_by(completion as f64);
        if cached > 0 {
            CACHED_TOKENS_TOTAL
                .with_label_values(&[model])
                .inc_by(cached as f64);
        }
    }

    pub fn record_throttle(&self, tier: &str) {
        RATE_LIMIT_THROTTLES.with_label_values(&[tier]).inc();
    }

    pub fn stream_started(&self) {
        ACTIVE_STREAMS.inc();
    }

    pub fn stream_ended(&self) {
        ACTIVE_STREAMS.dec();
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// JSON snapshot of the sliding-window view plus streaming stats.
    pub fn snapshot(&self) -> Value {
        let endpoints = self.endpoints.read();
        let mut per_endpoint = serde_json::Map::new();
        for (path, m) in endpoints.iter() {
            let latency = m.latency_ms.stats();
            per_endpoint.insert(
                path.clone(),
                json!({
                    "request_rate": m.arrivals.rate(),
                    "response_rate": m.completions.rate(),
                    "token_rate": m.tokens.sum() / window::WINDOW.as_secs_f64(),
                    "error_rate": m.errors.rate(),
                    "latency_ms": latency,
                }),
            );
        }
        drop(endpoints);

        json!({
            "uptime_seconds": self.uptime_seconds(),
            "endpoints": Value::Object(per_endpoint),
            "streaming": self.streaming.stats(),
        })
    }

    /// Flat CSV export of the same windowed stats.
    pub fn csv(&self) -> String {
        let mut out = String::from("endpoint,metric,value\n");
        let endpoints = self.endpoints.read();
        let mut paths: Vec<&String> = endpoints.keys().collect();
        paths.sort();
        for path in paths {
            let m = &endpoints[path];
            let latency = m.latency_ms.stats();
            for (metric, value) in [
                ("request_rate", m.arrivals.rate()),
                ("response_rate", m.completions.rate()),
                ("error_rate", m.errors.rate()),
                ("latency_ms_avg", latency.avg),
                ("latency_ms_p50", latency.p50),
                ("latency_ms_p90", latency.p90),
                ("latency_ms_p99", latency.p99),
            ] {
                out.push_str(&format!("{},{},{:.6}\n", path, metric, value));
            }
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Prometheus text exposition of every registered collector.
pub fn prometheus_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode Prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
