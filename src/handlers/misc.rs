//! Moderations, NIM rankings, model listing, and health.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::HashSet;
use std::time::Instant;

use crate::error::ApiError;
use crate::moderation;
use crate::openai::{
    ModelList, ModerationRequest, ModerationResponse, ModerationResult, RankingRequest,
    RankingResponse, RankingEntry,
};
use crate::state::AppState;
use crate::tokens;

use super::{admit, apply_headers};

pub async fn moderations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ModerationRequest>,
) -> Result<Response, ApiError> {
    let endpoint = "/v1/moderations";
    let started = Instant::now();

    if !state.config.enable_moderation {
        return Err(ApiError::NotFound(
            "moderation is disabled on this server".to_string(),
        ));
    }

    let items = request.input.items();
    if items.is_empty() {
        return Err(ApiError::InvalidRequest(
            "'input' must not be empty".to_string(),
        ));
    }
    let total_tokens: u64 = items.iter().map(|t| tokens::estimate(t)).sum();
    let admission = admit(&state, &headers, total_tokens)?;

    let model = request
        .model
        .unwrap_or_else(|| "omni-moderation-latest".to_string());
    state.models.ensure(&model);

    let results: Vec<ModerationResult> = items
        .iter()
        .map(|text| {
            let (flagged, categories, category_scores) = moderation::moderate(text);
            ModerationResult {
                flagged,
                categories,
                category_scores,
            }
        })
        .collect();

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state
        .registry
        .record_completion(endpoint, latency_ms, 0, false);

    let mut response = Json(ModerationResponse {
        id: format!("modr-{}", uuid::Uuid::new_v4().simple()),
        model,
        results,
    })
    .into_response();
    apply_headers(&mut response, &admission.headers);
    Ok(response)
}

/// Deterministic rerank logit: Jaccard word overlap between query and
/// passage, mapped onto a plausible logit range.
pub fn rank_logit(query: &str, passage: &str) -> f64 {
    let words = |text: &str| -> HashSet<String> {
        text.split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| c.is_ascii_punctuation())
                    .to_ascii_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect()
    };
    let q = words(query);
    let p = words(passage);
    if q.is_empty() || p.is_empty() {
        return -10.0;
    }
    let intersection = q.intersection(&p).count() as f64;
    let union = q.union(&p).count() as f64;
    let jaccard = intersection / union;
    // Map [0, 1] overlap onto roughly [-10, 10].
    jaccard * 20.0 - 10.0
}

pub async fn ranking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RankingRequest>,
) -> Result<Response, ApiError> {
    let endpoint = "/v1/ranking";
    let started = Instant::now();

    if request.passages.is_empty() {
        return Err(ApiError::InvalidRequest(
            "'passages' must not be empty".to_string(),
        ));
    }
    let total_tokens = tokens::estimate(&request.query.text)
        + request
            .passages
            .iter()
            .map(|p| tokens::estimate(&p.text))
            .sum::<u64>();
    let admission = admit(&state, &headers, total_tokens)?;

    let model = request
        .model
        .unwrap_or_else(|| "nvidia/nv-rerankqa-mistral-4b-v3".to_string());
    state.models.ensure(&model);

    let mut rankings: Vec<RankingEntry> = request
        .passages
        .iter()
        .enumerate()
        .map(|(index, passage)| RankingEntry {
            index,
            logit: rank_logit(&request.query.text, &passage.text),
        })
        .collect();
    rankings.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state
        .registry
        .record_completion(endpoint, latency_ms, total_tokens, false);

    let mut response = Json(RankingResponse { rankings }).into_response();
    apply_headers(&mut response, &admission.headers);
    Ok(response)
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: state.models.all(),
    })
}

/// Auto-creates any first-seen id, so GETs are idempotent and never 404 for
/// well-formed ids.
pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<crate::openai::ModelObject> {
    Json(state.models.ensure(&id))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let streaming = state.registry.streaming.stats();
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.registry.uptime_seconds(),
        "active_streams": streaming.active_streams,
        "completed_streams": streaming.completed_streams,
        "failed_streams": streaming.failed_streams,
        "workers": state.pool.snapshots(),
        "router": state.router.stats(),
        "prompt_cache": state.cache.stats(),
        "rate_limited_keys": state.limiter.as_ref().map(|l| l.key_count()).unwrap_or(0),
        "metrics_clients": state.streamer.client_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_passage_outranks_unrelated() {
        let query = "weather forecast for Boston";
        let relevant = rank_logit(query, "Boston weather forecast shows rain");
        let unrelated = rank_logit(query, "recipe for sourdough bread");
        assert!(relevant > unrelated);
    }

    #[test]
    fn identical_text_scores_highest() {
        let text = "exactly the same words";
        assert!((rank_logit(text, text) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn empty_passage_floors_out() {
        assert_eq!(rank_logit("query", ""), -10.0);
    }

    #[test]
    fn ranking_is_case_and_punct_insensitive() {
        let a = rank_logit("Boston Weather", "boston weather!");
        assert!((a - 10.0).abs() < 1e-9);
    }
}
