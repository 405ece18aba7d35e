//! Metrics surface: JSON snapshot, Prometheus text, CSV, per-model views,
//! rate-limit analytics, and the WebSocket stream.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::tier_limits;
use crate::error::ApiError;
use crate::metrics;
use crate::metrics::ws::{pong, Filters};
use crate::state::AppState;

pub async fn metrics_json(State(state): State<AppState>) -> Json<Value> {
    Json(state.metrics_snapshot(&Filters::default()))
}

pub async fn metrics_prometheus() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::prometheus_text(),
    )
        .into_response()
}

pub async fn metrics_csv(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/csv")],
        state.registry.csv(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ByModelQuery {
    pub model: Option<String>,
}

pub async fn by_model(
    State(state): State<AppState>,
    Query(query): Query<ByModelQuery>,
) -> Result<Json<Value>, ApiError> {
    match query.model {
        Some(model) => {
            let report = state.registry.models.by_model(&model).ok_or_else(|| {
                ApiError::NotFound(format!("no metrics recorded for model '{}'", model))
            })?;
            Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
        }
        None => Ok(Json(
            serde_json::to_value(state.registry.models.all()).unwrap_or(Value::Null),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub a: String,
    pub b: String,
}

pub async fn compare(
    State(state): State<AppState>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .models
        .compare(&query.a, &query.b)
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "metrics for both '{}' and '{}' are required for comparison",
                query.a, query.b
            ))
        })
}

#[derive(Debug, Deserialize)]
pub struct RankingQuery {
    #[serde(default = "default_ranking_metric")]
    pub metric: String,
    #[serde(default = "default_ranking_limit")]
    pub limit: usize,
}

fn default_ranking_metric() -> String {
    "requests".to_string()
}

fn default_ranking_limit() -> usize {
    10
}

pub async fn ranking(
    State(state): State<AppState>,
    Query(query): Query<RankingQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = state
        .registry
        .models
        .ranking(&query.metric, query.limit)
        .map_err(ApiError::InvalidRequest)?;
    Ok(Json(json!({ "metric": query.metric, "ranking": entries })))
}

pub async fn costs(State(state): State<AppState>) -> Json<Value> {
    Json(state.registry.models.costs())
}

pub async fn rate_limits(State(state): State<AppState>) -> Json<Value> {
    let mut summary = state.registry.rate_limits.summary();
    summary["enabled"] = json!(state.config.rate_limit_enabled);
    summary["tier"] = json!(state.config.rate_limit_tier);
    if let Some(limiter) = &state.limiter {
        summary["rpm_capacity"] = json!(limiter.rpm_capacity());
        summary["tpm_capacity"] = json!(limiter.tpm_capacity());
    }
    Json(summary)
}

pub async fn rate_limits_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .rate_limits
        .per_key(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no rate-limit activity for key '{}'", id)))
}

pub async fn rate_limits_tier(State(state): State<AppState>) -> Json<Value> {
    let (rpm, tpm) = state.config.rate_limits();
    let tier = &state.config.rate_limit_tier;
    Json(json!({
        "tier": tier,
        "rpm": rpm,
        "tpm": tpm,
        "table_rpm_tpm": tier_limits(tier),
        "overridden": state.config.rate_limit_rpm.is_some() || state.config.rate_limit_tpm.is_some(),
    }))
}

pub async fn throttle_analytics(State(state): State<AppState>) -> Json<Value> {
    Json(state.registry.rate_limits.throttle_analytics())
}

pub async fn abuse_patterns(State(state): State<AppState>) -> Json<Value> {
    Json(state.registry.rate_limits.abuse_patterns())
}

// ============================================================================
// WebSocket stream
// ============================================================================

pub async fn metrics_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    filters: Option<Filters>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, mut updates) = state.streamer.register();
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            message = incoming.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => match msg.message_type.as_str() {
                                "subscribe" => {
                                    state
                                        .streamer
                                        .subscribe(client_id, msg.filters.unwrap_or_default());
                                }
                                "unsubscribe" => state.streamer.unsubscribe(client_id),
                                "ping" => {
                                    if sink.send(Message::Text(pong().into())).await.is_err() {
                                        break;
                                    }
                                }
                                other => {
                                    tracing::debug!(
                                        client = client_id,
                                        kind = other,
                                        "ignoring unknown metrics-stream message"
                                    );
                                }
                            },
                            Err(err) => {
                                tracing::debug!(
                                    client = client_id,
                                    error = %err,
                                    "malformed metrics-stream message"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.streamer.unregister(client_id);
}
