//! Shared application state threaded through the axum handlers.

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SimConfig;
use crate::inject::ErrorInjector;
use crate::kvcache::{router::CostWeights, SmartRouter, WorkerPool};
use crate::metrics::ws::{Filters, MetricsStreamer};
use crate::metrics::MetricsRegistry;
use crate::openai::ModelObject;
use crate::promptcache::{PromptCache, DEFAULT_CAPACITY};
use crate::ratelimit::RateLimiter;

/// In-memory model registry: any model id mentioned by a request exists.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: Mutex<HashMap<String, ModelObject>>,
}

impl ModelRegistry {
    /// Look up a model, creating it on first sight. Repeated calls return
    /// the same object (stable `created` timestamp).
    pub fn ensure(&self, id: &str) -> ModelObject {
        let mut models = self.models.lock();
        models
            .entry(id.to_string())
            .or_insert_with(|| ModelObject {
                id: id.to_string(),
                object: "model".to_string(),
                created: crate::openai::unix_now(),
                owned_by: infer_owner(id),
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<ModelObject> {
        self.models.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<ModelObject> {
        let mut models: Vec<ModelObject> = self.models.lock().values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

fn infer_owner(model: &str) -> String {
    match model.split('/').next() {
        Some(org) if model.contains('/') => org.to_string(),
        _ if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") => {
            "openai".to_string()
        }
        _ => "organization-owner".to_string(),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SimConfig>,
    pub registry: Arc<MetricsRegistry>,
    pub pool: Arc<WorkerPool>,
    pub router: Arc<SmartRouter>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub cache: Arc<PromptCache>,
    pub models: Arc<ModelRegistry>,
    pub injector: Arc<ErrorInjector>,
    pub api_keys: Arc<HashSet<String>>,
    pub streamer: Arc<MetricsStreamer>,
}

impl AppState {
    pub fn from_config(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let api_keys: HashSet<String> = config.resolve_api_keys()?.into_iter().collect();

        let registry = Arc::new(MetricsRegistry::new());
        let pool = Arc::new(WorkerPool::new(config.kv_cache_num_workers));
        let router = Arc::new(SmartRouter::new(
            pool.clone(),
            config.kv_cache_block_size,
            CostWeights::with_overlap_weight(config.kv_overlap_weight),
        ));
        let limiter = config.rate_limit_enabled.then(|| {
            let (rpm, tpm) = config.rate_limits();
            Arc::new(RateLimiter::new(rpm, tpm))
        });
        let cache = Arc::new(PromptCache::new(
            Duration::from_secs(config.cache_ttl_seconds),
            config.min_tokens_for_cache,
            DEFAULT_CAPACITY,
        ));
        let injector = Arc::new(ErrorInjector::from_config(&config));

        let state = Self {
            config: Arc::new(config),
            registry: registry.clone(),
            pool,
            router,
            limiter,
            cache,
            models: Arc::new(ModelRegistry::default()),
            injector,
            api_keys: Arc::new(api_keys),
            // Placeholder; replaced below once the state exists to snapshot.
            streamer: MetricsStreamer::new(Arc::new(|_| Value::Null)),
        };

        let snapshot_source = state.clone();
        let streamer = MetricsStreamer::new(Arc::new(move |filters: &Filters| {
            snapshot_source.metrics_snapshot(filters)
        }));
        Ok(Self { streamer, ..state })
    }

    /// Full metrics snapshot, optionally narrowed by subscription filters.
    pub fn metrics_snapshot(&self, filters: &Filters) -> Value {
        let base = self.registry.snapshot();
        let cache_section = json!({
            "router": self.router.stats(),
            "prompt_cache": self.cache.stats(),
            "workers": self.pool.snapshots(),
            "recent_decisions": self.router.recent_decisions(20),
        });

        let mut snapshot = json!({
            "uptime_seconds": base["uptime_seconds"],
            "endpoints": base["endpoints"],
            "streaming": base["streaming"],
            "cache": cache_section,
            "models": self.registry.models.all(),
            "rate_limits": self.registry.rate_limits.summary(),
        });

        if let Some(endpoint) = &filters.endpoint {
            let narrowed = snapshot["endpoints"].get(endpoint).cloned().unwrap_or(Value::Null);
            let mut only = serde_json::Map::new();
            only.insert(endpoint.clone(), narrowed);
            snapshot["endpoints"] = Value::Object(only);
        }
        if let Some(model) = &filters.model {
            let narrowed = self
                .registry
                .models
                .by_model(model)
                .and_then(|r| serde_json::to_value(r).ok())
                .unwrap_or(Value::Null);
            snapshot["models"] = json!([narrowed]);
        }

        match filters.metric_type.as_deref() {
            None | Some("all") => snapshot,
            Some("throughput") | Some("latency") | Some("error") => json!({
                "uptime_seconds": snapshot["uptime_seconds"],
                "endpoints": snapshot["endpoints"],
            }),
            Some("streaming") | Some("queue") => json!({
                "uptime_seconds": snapshot["uptime_seconds"],
                "streaming": snapshot["streaming"],
                "cache": { "workers": snapshot["cache"]["workers"] },
            }),
            Some("cache") => json!({
                "uptime_seconds": snapshot["uptime_seconds"],
                "cache": snapshot["cache"],
            }),
            Some(_) => snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_builds_from_default_config() {
        let state = AppState::from_config(SimConfig::default()).unwrap();
        assert_eq!(state.pool.len(), 4);
        assert!(state.limiter.is_none());
    }

    #[test]
    fn rate_limiter_enabled_by_config() {
        let config = SimConfig {
            rate_limit_enabled: true,
            rate_limit_tier: "tier-1".to_string(),
            ..Default::default()
        };
        let state = AppState::from_config(config).unwrap();
        let limiter = state.limiter.as_ref().unwrap();
        assert_eq!(limiter.rpm_capacity(), 500);
    }

    #[test]
    fn model_registry_idempotent() {
        let registry = ModelRegistry::default();
        let first = registry.ensure("openai/gpt-oss-120b");
        let second = registry.ensure("openai/gpt-oss-120b");
        assert_eq!(first.created, second.created);
        assert_eq!(first.owned_by, "openai");
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn snapshot_respects_metric_type_filter() {
        let state = AppState::from_config(SimConfig::default()).unwrap();
        state.registry.record_arrival("/v1/chat/completions");

        let full = state.metrics_snapshot(&Filters::default());
        assert!(full.get("cache").is_some());

        let throughput = state.metrics_snapshot(&Filters {
            metric_type: Some("throughput".to_string()),
            ..Default::default()
        });
        assert!(throughput.get("cache").is_none());
        assert!(throughput.get("endpoints").is_some());
    }

    #[test]
    fn snapshot_endpoint_filter_narrows() {
        let state = AppState::from_config(SimConfig::default()).unwrap();
        state.registry.record_arrival("/v1/chat/completions");
        state.registry.record_arrival("/v1/embeddings");

        let filtered = state.metrics_snapshot(&Filters {
            endpoint: Some("/v1/embeddings".to_string()),
            ..Default::default()
        });
        let endpoints = filtered["endpoints"].as_object().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints.contains_key("/v1/embeddings"));
    }
}
