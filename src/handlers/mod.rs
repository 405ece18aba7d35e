//! HTTP surface: thin adapters from the wire protocols onto the simulation
//! core. Handlers validate, authenticate, rate-limit, and then hand off to
//! the planner/engine.

pub mod audio;
pub mod chat;
pub mod embeddings;
pub mod images;
pub mod metrics_http;
pub mod misc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::ApiError;
use crate::state::AppState;

/// Record every arrival, and record failed requests in the endpoint error
/// windows. Success paths record their own completions (they know token
/// counts); rate-limit denials are tracked by the rate-limit registry only,
/// per the error taxonomy.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    state.registry.record_arrival(&path);
    let started = Instant::now();
    let response = next.run(request).await;

    let status = response.status();
    if (status.is_client_error() || status.is_server_error())
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        state.registry.record_completion(
            &path,
            started.elapsed().as_secs_f64() * 1000.0,
            0,
            true,
        );
    }
    response
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/completions", post(chat::completions))
        .route("/v1/embeddings", post(embeddings::embeddings))
        .route("/v1/images/generations", post(images::generate))
        .route("/images/{id}", get(images::serve))
        .route("/v1/audio/speech", post(audio::speech))
        .route("/v1/moderations", post(misc::moderations))
        .route("/v1/ranking", post(misc::ranking))
        .route("/v1/models", get(misc::list_models))
        .route("/v1/models/{*id}", get(misc::get_model))
        .route("/health", get(misc::health))
        .route("/health/detailed", get(misc::health_detailed))
        .route("/metrics", get(metrics_http::metrics_json))
        .route("/metrics/prometheus", get(metrics_http::metrics_prometheus))
        .route("/metrics/csv", get(metrics_http::metrics_csv))
        .route("/metrics/by-model", get(metrics_http::by_model))
        .route("/metrics/compare", get(metrics_http::compare))
        .route("/metrics/ranking", get(metrics_http::ranking))
        .route("/metrics/costs", get(metrics_http::costs))
        .route("/metrics/rate-limits", get(metrics_http::rate_limits))
        .route(
            "/metrics/rate-limits/key/{id}",
            get(metrics_http::rate_limits_key),
        )
        .route("/metrics/rate-limits/tier", get(metrics_http::rate_limits_tier))
        .route(
            "/metrics/rate-limits/throttle-analytics",
            get(metrics_http::throttle_analytics),
        )
        .route(
            "/metrics/rate-limits/abuse-patterns",
            get(metrics_http::abuse_patterns),
        )
        .route("/metrics/stream", get(metrics_http::metrics_ws))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Outcome of the shared admission pipeline.
pub struct Admission {
    /// Rate-limit key: the presented API key, or "anonymous".
    pub api_key: String,
    /// Headers to copy onto the response (rate-limit bookkeeping).
    pub headers: Vec<(String, String)>,
}

/// Extract the bearer token from `Authorization`, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Shared front door for the simulated inference endpoints:
/// auth, error injection, rate limiting. Context validation is endpoint-
/// specific and happens in the handlers that know their token math.
pub fn admit(
    state: &AppState,
    headers: &HeaderMap,
    tokens_requested: u64,
) -> Result<Admission, ApiError> {
    let token = bearer_token(headers);
    if state.config.require_api_key {
        match &token {
            Some(key) if state.api_keys.contains(key) => {}
            Some(_) => {
                return Err(ApiError::Authentication(
                    "Incorrect API key provided.".to_string(),
                ))
            }
            None => {
                return Err(ApiError::Authentication(
                    "You didn't provide an API key.".to_string(),
                ))
            }
        }
    }
    let api_key = token.unwrap_or_else(|| "anonymous".to_string());

    if let Some(error) = state.injector.maybe_inject(&mut rand::rng()) {
        return Err(error);
    }

    let mut response_headers = Vec::new();
    if let Some(limiter) = &state.limiter {
        let decision = limiter.check(&api_key, tokens_requested);
        state.registry.rate_limits.record(
            &api_key,
            decision.allowed,
            tokens_requested,
            decision.retry_after_ms,
        );
        if !decision.allowed {
            state.registry.record_throttle(&state.config.rate_limit_tier);
            return Err(ApiError::RateLimited {
                message: format!(
                    "Rate limit reached for key. Please retry after {} ms.",
                    decision.retry_after_ms
                ),
                retry_after_ms: decision.retry_after_ms,
                headers: decision.headers,
            });
        }
        response_headers = decision.headers;
    }

    Ok(Admission {
        api_key,
        headers: response_headers,
    })
}

/// Copy admission headers onto an outgoing response.
pub fn apply_headers(response: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        if let (Ok(n), Ok(v)) = (
            axum::http::header::HeaderName::from_bytes(name.as_bytes()),
            value.parse(),
        ) {
            response.headers_mut().insert(n, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    fn headers_with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", key).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(
            bearer_token(&headers_with_key("sk-test")).as_deref(),
            Some("sk-test")
        );
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn auth_disabled_allows_anonymous() {
        let state = AppState::from_config(SimConfig::default()).unwrap();
        let admission = admit(&state, &HeaderMap::new(), 10).unwrap();
        assert_eq!(admission.api_key, "anonymous");
    }

    #[test]
    fn auth_required_rejects_missing_and_wrong_keys() {
        let state = AppState::from_config(SimConfig {
            require_api_key: true,
            api_keys: vec!["sk-good".to_string()],
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            admit(&state, &HeaderMap::new(), 1),
            Err(ApiError::Authentication(_))
        ));
        assert!(matches!(
            admit(&state, &headers_with_key("sk-bad"), 1),
            Err(ApiError::Authentication(_))
        ));
        assert!(admit(&state, &headers_with_key("sk-good"), 1).is_ok());
    }

    #[test]
    fn rate_limit_denial_surfaces_retry_after() {
        let state = AppState::from_config(SimConfig {
            rate_limit_enabled: true,
            rate_limit_rpm: Some(1),
            ..Default::default()
        })
        .unwrap();

        assert!(admit(&state, &HeaderMap::new(), 1).is_ok());
        match admit(&state, &HeaderMap::new(), 1) {
            Err(ApiError::RateLimited { retry_after_ms, .. }) => assert!(retry_after_ms > 0),
            other => panic!("expected rate limit denial, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn allowed_admission_carries_limit_headers() {
        let state = AppState::from_config(SimConfig {
            rate_limit_enabled: true,
            ..Default::default()
        })
        .unwrap();
        let admission = admit(&state, &HeaderMap::new(), 1).unwrap();
        assert!(admission
            .headers
            .iter()
            .any(|(n, _)| n == "X-RateLimit-Remaining-Requests"));
    }
}
