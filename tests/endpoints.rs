//! Coverage for the non-chat endpoints: embeddings, images, audio,
//! moderations, rankings, health, and the metrics surface.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use mocklm::config::SimConfig;
use mocklm::handlers::build_router;
use mocklm::state::AppState;

fn app() -> axum::Router {
    build_router(
        AppState::from_config(SimConfig {
            ttft_ms: 0,
            itl_ms: 0,
            ..Default::default()
        })
        .unwrap(),
    )
}

async fn post_json(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn get_raw(app: &axum::Router, path: &str) -> (StatusCode, Vec<u8>, Option<String>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec(), content_type)
}

#[tokio::test]
async fn embeddings_deterministic_across_calls() {
    let app = app();
    let body = json!({"model": "text-embedding-3-small", "input": "hello world", "dimensions": 64});
    let (status, first) = post_json(&app, "/v1/embeddings", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = post_json(&app, "/v1/embeddings", body).await;

    assert_eq!(first["data"][0]["embedding"], second["data"][0]["embedding"]);
    assert_eq!(first["data"][0]["embedding"].as_array().unwrap().len(), 64);
    assert_eq!(first["object"], "list");
    assert!(first["usage"]["prompt_tokens"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn embeddings_base64_format() {
    let app = app();
    let (status, body) = post_json(
        &app,
        "/v1/embeddings",
        json!({"model": "text-embedding-3-small", "input": "x", "dimensions": 8, "encoding_format": "base64"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let encoded = body["data"][0]["embedding"].as_str().unwrap();
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
    assert_eq!(bytes.len(), 8 * 4);
}

#[tokio::test]
async fn embeddings_batch_indexes_preserved() {
    let app = app();
    let (_, body) = post_json(
        &app,
        "/v1/embeddings",
        json!({"model": "text-embedding-3-small", "input": ["a", "b", "c"], "dimensions": 8}),
    )
    .await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    for (i, item) in data.iter().enumerate() {
        assert_eq!(item["index"].as_u64().unwrap() as usize, i);
    }
}

#[tokio::test]
async fn embeddings_dimension_bounds() {
    let app = app();
    let (status, _) = post_json(
        &app,
        "/v1/embeddings",
        json!({"model": "m", "input": "x", "dimensions": 100000}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn image_url_mode_serves_png() {
    let app = app();
    let (status, body) = post_json(
        &app,
        "/v1/images/generations",
        json!({"prompt": "a lighthouse at dusk", "size": "256x256"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let url = body["data"][0]["url"].as_str().unwrap();
    let path = url.split_once("/images/").map(|(_, id)| format!("/images/{}", id)).unwrap();

    let (img_status, bytes, content_type) = get_raw(&app, &path).await;
    assert_eq!(img_status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/png"));
    assert_eq!(&bytes[1..4], b"PNG");
}

#[tokio::test]
async fn image_b64_mode_inline() {
    let app = app();
    let (status, body) = post_json(
        &app,
        "/v1/images/generations",
        json!({"prompt": "gradient", "size": "256x256", "response_format": "b64_json", "n": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data[0]["b64_json"].as_str().unwrap())
        .unwrap();
    assert_eq!(&bytes[1..4], b"PNG");
}

#[tokio::test]
async fn missing_image_404s() {
    let app = app();
    let (status, _, _) = get_raw(&app, "/images/doesnotexist.png").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn audio_speech_returns_wav_bytes() {
    let app = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/audio/speech")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"model": "tts-1", "input": "hello world", "voice": "alloy", "response_format": "wav"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "audio/wav"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..4], b"RIFF");
}

#[tokio::test]
async fn moderation_flags_and_scores() {
    let app = app();
    let (status, body) = post_json(
        &app,
        "/v1/moderations",
        json!({"input": ["sunny day in the park", "attack attack attack"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["flagged"], false);
    assert_eq!(results[1]["flagged"], true);
    assert!(results[1]["category_scores"]["violence"].as_f64().unwrap() >= 0.5);
}

#[tokio::test]
async fn ranking_orders_by_relevance() {
    let app = app();
    let (status, body) = post_json(
        &app,
        "/v1/ranking",
        json!({
            "query": {"text": "weather in Boston"},
            "passages": [
                {"text": "sourdough bread recipe"},
                {"text": "Boston weather report"},
            ],
            "truncate": "END"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rankings = body["rankings"].as_array().unwrap();
    assert_eq!(rankings.len(), 2);
    // The weather passage (original index 1) ranks first.
    assert_eq!(rankings[0]["index"], 1);
    assert!(rankings[0]["logit"].as_f64().unwrap() > rankings[1]["logit"].as_f64().unwrap());
}

#[tokio::test]
async fn health_endpoints() {
    let app = app();
    let (status, bytes, _) = get_raw(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");

    let (status, bytes, _) = get_raw(&app, "/health/detailed").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["workers"].as_array().unwrap().len(), 4);
    assert_eq!(body["active_streams"], 0);
}

#[tokio::test]
async fn metrics_exports_all_formats() {
    let app = app();
    // Generate some traffic first.
    let _ = post_json(
        &app,
        "/v1/chat/completions",
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "Hi"}], "max_tokens": 3}),
    )
    .await;

    let (status, bytes, _) = get_raw(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(snapshot["endpoints"]["/v1/chat/completions"]["request_rate"]
        .as_f64()
        .unwrap()
        > 0.0);
    assert!(snapshot["cache"]["workers"].as_array().unwrap().len() == 4);

    let (status, bytes, _) = get_raw(&app, "/metrics/prometheus").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("# HELP"));
    assert!(text.contains("# TYPE"));

    let (status, bytes, content_type) = get_raw(&app, "/metrics/csv").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/csv"));
    assert!(String::from_utf8(bytes).unwrap().starts_with("endpoint,metric,value"));
}

#[tokio::test]
async fn per_model_metrics_flow() {
    let app = app();
    for model in ["model-a", "model-b"] {
        let _ = post_json(
            &app,
            "/v1/chat/completions",
            json!({"model": model, "messages": [{"role": "user", "content": "Hi"}], "max_tokens": 3}),
        )
        .await;
    }

    let (status, bytes, _) = get_raw(&app, "/metrics/by-model?model=model-a").await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(report["request_count"], 1);

    let (status, bytes, _) = get_raw(&app, "/metrics/compare?a=model-a&b=model-b").await;
    assert_eq!(status, StatusCode::OK);
    let cmp: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(cmp["winners"]["latency"].is_string());

    let (status, bytes, _) = get_raw(&app, "/metrics/ranking?metric=requests&limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let ranking: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(ranking["ranking"].as_array().unwrap().len(), 2);

    let (status, bytes, _) = get_raw(&app, "/metrics/costs").await;
    assert_eq!(status, StatusCode::OK);
    let costs: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(costs["total_cost_usd"].as_f64().unwrap() > 0.0);

    let (status, _, _) = get_raw(&app, "/metrics/by-model?model=never-seen").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get_raw(&app, "/metrics/ranking?metric=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
