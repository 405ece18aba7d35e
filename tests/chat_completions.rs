//! End-to-end chat completion scenarios driven through the full router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use mocklm::config::SimConfig;
use mocklm::handlers::build_router;
use mocklm::state::AppState;

fn fast_config() -> SimConfig {
    SimConfig {
        ttft_ms: 0,
        itl_ms: 0,
        response_delay: 0.0,
        ..Default::default()
    }
}

fn app(config: SimConfig) -> axum::Router {
    build_router(AppState::from_config(config).unwrap())
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
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn non_reasoning_chat_basic_shape() {
    let app = app(fast_config());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "openai/gpt-oss-120b",
            "messages": [{"role": "user", "content": "Hi"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let choice = &body["choices"][0];
    assert_eq!(choice["message"]["role"], "assistant");
    assert_eq!(choice["finish_reason"], "stop");
    assert!(choice["message"].get("reasoning_content").is_none());

    let usage = &body["usage"];
    assert!(usage["prompt_tokens"].as_u64().unwrap() >= 1);
    assert!(usage["completion_tokens"].as_u64().unwrap() >= 1);
    assert_eq!(
        usage["total_tokens"].as_u64().unwrap(),
        usage["prompt_tokens"].as_u64().unwrap() + usage["completion_tokens"].as_u64().unwrap()
    );
    assert!(
        usage["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap()
            <= usage["prompt_tokens"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn empty_messages_rejected() {
    let app = app(fast_config());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({"model": "gpt-4o", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn max_tokens_zero_finishes_with_length() {
    let app = app(fast_config());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 0
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["finish_reason"], "length");
    assert_eq!(body["usage"]["completion_tokens"], 0);
}

#[tokio::test]
async fn context_window_boundary() {
    let mut config = fast_config();
    config.enable_context_validation = true;
    let app = app(config);

    // gpt-4's window is 8192; "Hi" is one prompt token.
    let (ok_status, _) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 8191
        }),
    )
    .await;
    assert_eq!(ok_status, StatusCode::OK);

    let (over_status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 8192
        }),
    )
    .await;
    assert_eq!(over_status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "context_length_exceeded");
}

#[tokio::test]
async fn strict_structured_output_conforms() {
    let app = app(fast_config());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "give me a number"}],
            "parallel_tool_calls": false,
            "response_format": {"type": "json_schema", "json_schema": {
                "name": "number", "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {"n": {"type": "integer", "minimum": 1, "maximum": 10}},
                    "required": ["n"],
                    "additionalProperties": false
                }
            }}
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let content: Value =
        serde_json::from_str(body["choices"][0]["message"]["content"].as_str().unwrap()).unwrap();
    let n = content["n"].as_i64().unwrap();
    assert!((1..=10).contains(&n));
}

#[tokio::test]
async fn strict_structured_output_rejects_parallel_tool_calls() {
    let app = app(fast_config());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "json"}],
            "parallel_tool_calls": true,
            "response_format": {"type": "json_schema", "json_schema": {
                "name": "empty", "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {},
                    "required": [],
                    "additionalProperties": false
                }
            }}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn parallel_tool_calls_have_valid_arguments() {
    let app = app(fast_config());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Get weather in Boston and NYC"}],
            "tool_choice": "required",
            "parallel_tool_calls": true,
            "tools": [
                {"type": "function", "function": {"name": "get_weather", "parameters": {
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }}},
                {"type": "function", "function": {"name": "get_forecast", "parameters": {
                    "type": "object",
                    "properties": {"city": {"type": "string"}, "days": {"type": "integer", "minimum": 1, "maximum": 7}},
                    "required": ["city", "days"]
                }}}
            ]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    let calls = body["choices"][0]["message"]["tool_calls"].as_array().unwrap();
    assert!(!calls.is_empty());

    for call in calls {
        assert_eq!(call["type"], "function");
        let arguments: Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        let obj = arguments.as_object().unwrap();
        match call["function"]["name"].as_str().unwrap() {
            "get_weather" => {
                assert!(obj["city"].is_string());
            }
            "get_forecast" => {
                assert!(obj["city"].is_string());
                let days = obj["days"].as_i64().unwrap();
                assert!((1..=7).contains(&days));
            }
            other => panic!("unexpected tool {}", other),
        }
    }
}

#[tokio::test]
async fn models_endpoint_auto_creates_and_is_idempotent() {
    let app = app(fast_config());
    let (_, first) = get(&app, "/v1/models/my-org/custom-model").await;
    let (_, second) = get(&app, "/v1/models/my-org/custom-model").await;
    assert_eq!(first, second);
    assert_eq!(first["object"], "model");

    let (_, list) = get(&app, "/v1/models").await;
    assert!(list["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m["id"] == "my-org/custom-model"));
}

#[tokio::test]
async fn auth_enforced_when_required() {
    let mut config = fast_config();
    config.require_api_key = true;
    config.api_keys = vec!["sk-valid".to_string()];
    let app = app(config);

    let request_body = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hi"}]
    });

    let (unauth, body) = post_json(&app, "/v1/chat/completions", request_body.clone()).await;
    assert_eq!(unauth, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "authentication_error");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("authorization", "Bearer sk-valid")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

async fn get(app: &axum::Router, path: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}
