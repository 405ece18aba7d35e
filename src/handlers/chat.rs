//! Chat completions and legacy text completions.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

use crate::context;
use crate::error::ApiError;
use crate::kvcache::{self, RouteDecision, SmartRouter};
use crate::moderation;
use crate::openai::{
    chat_completion_id, completion_id, system_fingerprint, unix_now, AssistantMessage,
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, CompletionChoice,
    CompletionRequest, CompletionResponse, ToolCall, ToolCallFunction, ToolChoice, Usage,
};
use crate::promptcache;
use crate::reasoning;
use crate::state::AppState;
use crate::stream::{sse_response, ContentPlan, StreamContext, StreamPlan, StreamTiming};
use crate::textgen;
use crate::tokens;
use crate::toolcalls::{self, ToolPlan};

use super::{admit, apply_headers};

/// System prelude injected when `prepend_safety_message` is on; only its
/// token cost is observable.
const SAFETY_PRELUDE: &str =
    "You are a helpful assistant. Decline harmful, hateful, or unsafe requests.";

const REFUSAL_TEXT: &str = "I can't help with that request.";

/// Sampled output length when the request does not cap `max_tokens`.
const DEFAULT_OUTPUT_MIN: u64 = 20;
const DEFAULT_OUTPUT_MAX: u64 = 100;

/// Pairs a routing decision with its completion call, so early returns and
/// client disconnects in the non-streaming path still free the worker slot.
struct RouteGuard {
    router: Arc<SmartRouter>,
    decision: RouteDecision,
    done: bool,
}

impl RouteGuard {
    fn new(router: Arc<SmartRouter>, decision: RouteDecision) -> Self {
        Self {
            router,
            decision,
            done: false,
        }
    }

    fn decision(&self) -> &RouteDecision {
        &self.decision
    }

    fn success(mut self, total_tokens: u64) {
        self.router.complete(&self.decision, total_tokens, true);
        self.done = true;
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if !self.done {
            self.router.complete(&self.decision, 0, false);
        }
    }
}

/// Everything decided before routing: what the response will contain.
struct ResponsePlan {
    content: ContentPlan,
    finish_reason: String,
    completion_tokens: u64,
    reasoning: Vec<String>,
    reasoning_tokens: u64,
}

/// Resolve content, finish reason, and token counts. All request validation
/// that can fail happens here, before any worker slot is taken.
fn build_plan(state: &AppState, request: &ChatCompletionRequest) -> Result<ResponsePlan, ApiError> {
    let mut rng = rand::rng();
    let prompt_text = request.prompt_text();

    let reasoning_tokens = if reasoning::is_reasoning_model(&request.model) {
        reasoning::reasoning_token_count(&prompt_text)
    } else {
        0
    };
    let reasoning_block = reasoning::reasoning_tokens(&mut rng, reasoning_tokens);

    // Safety screening wins over everything else.
    let jailbroken =
        state.config.enable_jailbreak_detection && moderation::looks_like_jailbreak(&prompt_text);
    let unsafe_prompt =
        state.config.enable_safety_features && moderation::moderate(&prompt_text).0;
    if jailbroken || unsafe_prompt {
        let tokens = word_tokens(REFUSAL_TEXT);
        return Ok(ResponsePlan {
            completion_tokens: tokens.len() as u64,
            content: ContentPlan::Text(tokens),
            finish_reason: "content_filter".to_string(),
            reasoning: Vec::new(),
            reasoning_tokens: 0,
        });
    }

    // Structured output.
    if let Some(format) = &request.response_format {
        if format.format_type == "json_schema" {
            let schema_format = format.json_schema.as_ref().ok_or_else(|| {
                ApiError::InvalidRequest(
                    "response_format.type is 'json_schema' but 'json_schema' is missing"
                        .to_string(),
                )
            })?;
            if schema_format.strict == Some(true) {
                crate::schema::validate_strict(&schema_format.schema)?;
                if request.parallel_tool_calls == Some(true) {
                    return Err(ApiError::InvalidRequest(
                        "'parallel_tool_calls' must be false when using a strict json_schema \
                         response format"
                            .to_string(),
                    ));
                }
            }
            let document = crate::schema::generate(&mut rng, &schema_format.schema).to_string();
            return Ok(ResponsePlan {
                completion_tokens: tokens::estimate(&document).max(1),
                content: ContentPlan::Structured(document),
                finish_reason: "stop".to_string(),
                reasoning: reasoning_block,
                reasoning_tokens,
            });
        }
    }

    // Tool calls.
    let wants_tools = request.tools.as_ref().is_some_and(|t| !t.is_empty())
        || matches!(request.tool_choice, Some(ToolChoice::Function { .. }))
        || matches!(request.tool_choice, Some(ToolChoice::Mode(ref m)) if m == "required");
    if wants_tools {
        match toolcalls::plan(&mut rng, request)? {
            ToolPlan::Calls(calls) => {
                let completion_tokens = calls
                    .iter()
                    .map(|c| tokens::estimate(&c.arguments).max(1))
                    .sum();
                return Ok(ResponsePlan {
                    content: ContentPlan::ToolCalls(calls),
                    finish_reason: "tool_calls".to_string(),
                    completion_tokens,
                    reasoning: reasoning_block,
                    reasoning_tokens,
                });
            }
            ToolPlan::Text => {}
        }
    } else if let Some(ToolChoice::Mode(mode)) = &request.tool_choice {
        // Still surface bogus modes even without tools declared.
        if !matches!(mode.as_str(), "auto" | "none" | "required") {
            return Err(ApiError::InvalidRequest(format!(
                "unrecognized tool_choice '{}'",
                mode
            )));
        }
    }

    // Plain text.
    let cap = request.output_cap();
    let (target, finish_reason) = match cap {
        Some(0) => (0, "length"),
        Some(cap) => {
            let sampled = rng.random_range(DEFAULT_OUTPUT_MIN..=DEFAULT_OUTPUT_MAX);
            if sampled >= cap {
                (cap, "length")
            } else {
                (sampled, "stop")
            }
        }
        None => (
            rng.random_range(DEFAULT_OUTPUT_MIN..=DEFAULT_OUTPUT_MAX),
            "stop",
        ),
    };
    let tokens = textgen::generate_tokens(&mut rng, target as usize);
    Ok(ResponsePlan {
        completion_tokens: tokens.len() as u64,
        content: ContentPlan::Text(tokens),
        finish_reason: finish_reason.to_string(),
        reasoning: reasoning_block,
        reasoning_tokens,
    })
}

fn word_tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .enumerate()
        .map(|(i, w)| {
            if i == 0 {
                w.to_string()
            } else {
                format!(" {}", w)
            }
        })
        .collect()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let endpoint = "/v1/chat/completions";
    let started = Instant::now();

    if request.messages.is_empty() {
        return Err(ApiError::InvalidRequest(
            "'messages' must contain at least one message".to_string(),
        ));
    }

    let mut prompt_tokens = tokens::estimate_chat_prompt(&request);
    if state.config.prepend_safety_message {
        prompt_tokens += tokens::estimate(SAFETY_PRELUDE);
    }
    let output_cap = request.output_cap();

    let admission = admit(
        &state,
        &headers,
        prompt_tokens + output_cap.unwrap_or(0),
    )?;

    if state.config.enable_context_validation {
        context::validate_context(&request.model, prompt_tokens, output_cap)?;
    }
    state.models.ensure(&request.model);

    // Decide the full response before taking a worker slot; nothing after
    // routing can fail.
    let plan = build_plan(&state, &request)?;

    let fingerprint = promptcache::fingerprint(&request);
    let cache_hit = if state.config.enable_prompt_caching {
        state.cache.lookup(&fingerprint)
    } else {
        None
    };

    let token_ids = if state.config.kv_cache_enabled {
        kvcache::text_to_token_ids(&request.prompt_text())
    } else {
        Vec::new()
    };
    let decision = state
        .router
        .route(&token_ids, output_cap.unwrap_or(plan.completion_tokens));

    let cached_tokens = decision
        .cached_tokens
        .max(cache_hit.unwrap_or(0))
        .min(prompt_tokens);
    let mut usage = Usage::new(prompt_tokens, plan.completion_tokens).with_cached(cached_tokens);
    if plan.reasoning_tokens > 0 {
        usage = usage.with_reasoning(plan.reasoning_tokens);
    }

    let cache_handle = state
        .config
        .enable_prompt_caching
        .then(|| (state.cache.clone(), fingerprint));

    if request.stream {
        let stream_plan = StreamPlan {
            id: chat_completion_id(),
            model: request.model.clone(),
            created: unix_now(),
            reasoning: plan.reasoning,
            content: plan.content,
            finish_reason: plan.finish_reason,
            usage,
            include_usage: request
                .stream_options
                .as_ref()
                .is_some_and(|o| o.include_usage),
        };
        let ctx = StreamContext {
            registry: state.registry.clone(),
            router: state.router.clone(),
            decision,
            cache: cache_handle,
            endpoint,
            user: request.user.clone(),
            started,
        };
        let mut response = sse_response(stream_plan, StreamTiming::from_config(&state.config), ctx);
        apply_headers(&mut response, &admission.headers);
        return Ok(response);
    }

    // Non-streaming: simulate the whole generation, then answer at once.
    let guard = RouteGuard::new(state.router.clone(), decision);
    simulate_latency(&state).await;

    let message = assemble_message(&plan);
    let response_body = ChatCompletionResponse {
        id: chat_completion_id(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: request.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: plan.finish_reason.clone(),
        }],
        usage: usage.clone(),
        system_fingerprint: system_fingerprint(),
    };

    let cached_for_insert = guard.decision().cached_tokens;
    guard.success(usage.prompt_tokens + usage.completion_tokens);
    if let Some((cache, fp)) = &cache_handle {
        cache.insert(fp, usage.prompt_tokens, cached_for_insert);
    }

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.registry.models.record(
        &request.model,
        endpoint,
        request.user.as_deref(),
        usage.prompt_tokens,
        usage.completion_tokens,
        latency_ms,
        false,
    );
    state
        .registry
        .record_completion(endpoint, latency_ms, usage.completion_tokens, false);
    state
        .registry
        .record_tokens(&request.model, usage.prompt_tokens, usage.completion_tokens, cached_tokens);

    let mut response = Json(response_body).into_response();
    apply_headers(&mut response, &admission.headers);
    Ok(response)
}

fn assemble_message(plan: &ResponsePlan) -> AssistantMessage {
    let reasoning_content = if plan.reasoning.is_empty() {
        None
    } else {
        Some(plan.reasoning.concat())
    };
    match &plan.content {
        ContentPlan::Text(tokens) => AssistantMessage {
            role: "assistant".to_string(),
            content: Some(tokens.concat()),
            reasoning_content,
            tool_calls: None,
        },
        ContentPlan::Structured(document) => AssistantMessage {
            role: "assistant".to_string(),
            content: Some(document.clone()),
            reasoning_content,
            tool_calls: None,
        },
        ContentPlan::ToolCalls(calls) => AssistantMessage {
            role: "assistant".to_string(),
            content: None,
            reasoning_content,
            tool_calls: Some(
                calls
                    .iter()
                    .map(|call| ToolCall {
                        id: call.id.clone(),
                        call_type: "function".to_string(),
                        function: ToolCallFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            ),
        },
    }
}

/// Non-streaming think time: the configured response delay plus one TTFT
/// sample.
async fn simulate_latency(state: &AppState) {
    let config = &state.config;
    let mut delay_s = config.response_delay.max(0.0);
    if config.random_delay && delay_s > 0.0 && config.max_variance > 0.0 {
        let mut rng = rand::rng();
        delay_s *= 1.0 + rng.random_range(-config.max_variance..config.max_variance);
    }
    let ttft = {
        let mut rng = rand::rng();
        StreamTiming::from_config(config).sample_ttft(&mut rng)
    };
    let total = std::time::Duration::from_secs_f64(delay_s.max(0.0)) + ttft;
    if !total.is_zero() {
        tokio::time::sleep(total).await;
    }
}

// ============================================================================
// Legacy text completions
// ============================================================================

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let endpoint = "/v1/completions";
    let started = Instant::now();

    let prompt = request.prompt.joined();
    let prompt_tokens = tokens::estimate(&prompt);
    let admission = admit(
        &state,
        &headers,
        prompt_tokens + request.max_tokens.unwrap_or(0),
    )?;
    if state.config.enable_context_validation {
        context::validate_context(&request.model, prompt_tokens, request.max_tokens)?;
    }
    state.models.ensure(&request.model);

    let (target, finish_reason, generated) = {
        let mut rng = rand::rng();
        let (target, finish_reason) = match request.max_tokens {
            Some(0) => (0, "length"),
            Some(cap) => {
                let sampled = rng.random_range(DEFAULT_OUTPUT_MIN..=DEFAULT_OUTPUT_MAX);
                if sampled >= cap {
                    (cap, "length")
                } else {
                    (sampled, "stop")
                }
            }
            None => (
                rng.random_range(DEFAULT_OUTPUT_MIN..=DEFAULT_OUTPUT_MAX),
                "stop",
            ),
        };
        let generated = textgen::generate_tokens(&mut rng, target as usize);
        (target, finish_reason, generated)
    };
    let usage = Usage::new(prompt_tokens, generated.len() as u64);

    let token_ids = if state.config.kv_cache_enabled {
        kvcache::text_to_token_ids(&prompt)
    } else {
        Vec::new()
    };
    let decision = state.router.route(&token_ids, target);
    let guard = RouteGuard::new(state.router.clone(), decision);

    if request.stream {
        return Ok(stream_completion(
            state.clone(),
            request,
            guard,
            generated,
            usage,
            finish_reason,
            admission.headers,
            started,
        ));
    }

    simulate_latency(&state).await;

    let mut text = generated.concat();
    if request.echo {
        text = format!("{}{}", prompt, text);
    }
    let body = CompletionResponse {
        id: completion_id(),
        object: "text_completion".to_string(),
        created: unix_now(),
        model: request.model.clone(),
        choices: vec![CompletionChoice {
            text,
            index: 0,
            logprobs: None,
            finish_reason: finish_reason.to_string(),
        }],
        usage: usage.clone(),
    };

    guard.success(usage.prompt_tokens + usage.completion_tokens);
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.registry.models.record(
        &request.model,
        endpoint,
        request.user.as_deref(),
        usage.prompt_tokens,
        usage.completion_tokens,
        latency_ms,
        false,
    );
    state
        .registry
        .record_completion(endpoint, latency_ms, usage.completion_tokens, false);
    state
        .registry
        .record_tokens(&request.model, usage.prompt_tokens, usage.completion_tokens, 0);

    let mut response = Json(body).into_response();
    apply_headers(&mut response, &admission.headers);
    Ok(response)
}

/// Streaming legacy completions: `text_completion` chunks, one emission
/// token per ITL. Dropping the body cancels the generator, and the route
/// guard captured inside frees the worker slot.
#[allow(clippy::too_many_arguments)]
fn stream_completion(
    state: AppState,
    request: CompletionRequest,
    guard: RouteGuard,
    generated: Vec<String>,
    usage: Usage,
    finish_reason: &'static str,
    limit_headers: Vec<(String, String)>,
    started: Instant,
) -> Response {
    let timing = StreamTiming::from_config(&state.config);
    let id = completion_id();
    let model = request.model.clone();
    let endpoint = "/v1/completions";

    let body_stream = async_stream::stream! {
        // Moved into the generator so cancellation (body drop) releases it.
        let guard = guard;

        for token in &generated {
            let delay = {
                let mut rng = rand::rng();
                timing.sample_itl(&mut rng)
            };
            tokio::time::sleep(delay).await;
            let chunk = serde_json::json!({
                "id": id,
                "object": "text_completion",
                "created": unix_now(),
                "model": model,
                "choices": [{"text": token, "index": 0, "logprobs": null, "finish_reason": null}],
            });
            yield Ok::<Bytes, std::io::Error>(Bytes::from(format!("data: {}\n\n", chunk)));
        }

        let final_chunk = serde_json::json!({
            "id": id,
            "object": "text_completion",
            "created": unix_now(),
            "model": model,
            "choices": [{"text": "", "index": 0, "logprobs": null, "finish_reason": finish_reason}],
            "usage": usage.clone(),
        });
        yield Ok(Bytes::from(format!("data: {}\n\n", final_chunk)));
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));

        guard.success(usage.prompt_tokens + usage.completion_tokens);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        state.registry.models.record(
            &model,
            endpoint,
            request.user.as_deref(),
            usage.prompt_tokens,
            usage.completion_tokens,
            latency_ms,
            false,
        );
        state
            .registry
            .record_completion(endpoint, latency_ms, usage.completion_tokens, false);
        state
            .registry
            .record_tokens(&model, usage.prompt_tokens, usage.completion_tokens, 0);
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .expect("static response headers");
    apply_headers(&mut response, &limit_headers);
    response
}
