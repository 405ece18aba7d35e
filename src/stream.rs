//! The streaming engine: turns a response plan into an SSE stream with
//! realistic timing.
//!
//! Each stream runs as its own task feeding a bounded channel; axum streams
//! the receiver to the client. Every sleep is a select over the timer and
//! channel closure, so client disconnects cancel the stream within one
//! inter-token interval. A drop guard finalizes session, worker, and metric
//! state on every exit path, including cancellation.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::SimConfig;
use crate::error::ErrorDetail;
use crate::kvcache::{RouteDecision, SmartRouter};
use crate::metrics::MetricsRegistry;
use crate::openai::{
    system_fingerprint, ChatCompletionChunk, ChunkChoice, Delta, ToolCallDelta,
    ToolCallFunctionDelta, Usage,
};
use crate::promptcache::PromptCache;
use crate::toolcalls::{split_arguments, PlannedCall};

/// Channel capacity in frames; a slow client applies backpressure here.
const CHANNEL_CAPACITY: usize = 32;

/// Timing knobs for one stream, sampled from config with jitter.
#[derive(Debug, Clone)]
pub struct StreamTiming {
    pub ttft: Duration,
    pub ttft_variance: f64,
    pub itl: Duration,
    pub itl_variance: f64,
    pub total_timeout: Duration,
    pub token_timeout: Duration,
    pub keepalive: Option<Duration>,
}

impl StreamTiming {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            ttft: Duration::from_millis(config.ttft_ms),
            ttft_variance: config.ttft_variance_pct,
            itl: Duration::from_millis(config.itl_ms),
            itl_variance: config.itl_variance_pct,
            total_timeout: Duration::from_secs(config.stream_timeout_seconds),
            token_timeout: Duration::from_secs(config.stream_token_timeout_seconds),
            keepalive: config
                .stream_keepalive_enabled
                .then(|| Duration::from_secs(config.stream_keepalive_interval_seconds.max(1))),
        }
    }

    fn jittered<R: Rng + ?Sized>(base: Duration, variance: f64, rng: &mut R) -> Duration {
        if variance <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rng.random_range(-variance..variance);
        base.mul_f64(factor.max(0.0))
    }

    pub fn sample_ttft<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Self::jittered(self.ttft, self.ttft_variance, rng)
    }

    pub fn sample_itl<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Self::jittered(self.itl, self.itl_variance, rng)
    }
}

/// What the stream should emit after the role chunk.
#[derive(Debug, Clone)]
pub enum ContentPlan {
    /// Ordinary text, one emission token per chunk.
    Text(Vec<String>),
    /// Structured output: one chunk carrying the whole JSON document.
    Structured(String),
    /// Tool calls split across deltas per the wire format.
    ToolCalls(Vec<PlannedCall>),
}

/// Fully planned response, computed before the first byte is sent.
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub reasoning: Vec<String>,
    pub content: ContentPlan,
    pub finish_reason: String,
    pub usage: Usage,
    pub include_usage: bool,
}

/// Shared handles the engine needs to finalize a stream.
pub struct StreamContext {
    pub registry: Arc<MetricsRegistry>,
    pub router: Arc<SmartRouter>,
    pub decision: RouteDecision,
    /// `(cache, fingerprint)` to refresh on successful completion.
    pub cache: Option<(Arc<PromptCache>, String)>,
    pub endpoint: &'static str,
    pub user: Option<String>,
    pub started: Instant,
}

/// Build the SSE response and spawn the stream task.
pub fn sse_response(plan: StreamPlan, timing: StreamTiming, ctx: StreamContext) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);
    tokio::spawn(run_stream(plan, timing, ctx, tx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response headers")
}

enum Abort {
    /// Client went away; the connection can take no more frames.
    Cancelled,
    /// A timeout fired; an error chunk was already emitted.
    TimedOut,
}

struct Emitter {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    last_frame: Instant,
    keepalive: Option<Duration>,
}

impl Emitter {
    async fn send(&mut self, frame: Bytes) -> Result<(), Abort> {
        if self.tx.send(Ok(frame)).await.is_err() {
            return Err(Abort::Cancelled);
        }
        self.last_frame = Instant::now();
        Ok(())
    }

    /// Sleep for `delay`, emitting keep-alive comments if the gap since the
    /// last frame grows past the configured interval. Cancellation is
    /// observed at every wake-up.
    async fn sleep(&mut self, delay: Duration) -> Result<(), Abort> {
        let wake_at = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }
            let until_wake = wake_at - now;
            let nap = match self.keepalive {
                Some(interval) => {
                    let since_frame = now.duration_since(self.last_frame);
                    let until_keepalive = interval.saturating_sub(since_frame);
                    if until_keepalive.is_zero() {
                        self.send(Bytes::from_static(b": keepalive\n\n")).await?;
                        continue;
                    }
                    until_wake.min(until_keepalive)
                }
                None => until_wake,
            };

            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = self.tx.closed() => return Err(Abort::Cancelled),
            }
        }
    }
}

/// Finalizes stream state exactly once on every exit path. Reaching `Drop`
/// without an explicit outcome means the task was torn down mid-flight
/// (client cancellation), which counts as a failure without an error chunk.
struct StreamGuard {
    stream_id: String,
    ctx: StreamContext,
    plan_usage: Usage,
    model: String,
    tokens_emitted: u64,
    finished: bool,
}

impl StreamGuard {
    fn new(stream_id: String, model: String, plan_usage: Usage, ctx: StreamContext) -> Self {
        ctx.registry.streaming.start(&stream_id);
        ctx.registry.stream_started();
        Self {
            stream_id,
            ctx,
            plan_usage,
            model,
            tokens_emitted: 0,
            finished: false,
        }
    }

    fn token(&mut self) {
        self.tokens_emitted += 1;
        self.ctx.registry.streaming.token(&self.stream_id);
    }

    fn finish(&mut self, success: bool, failure_reason: Option<&str>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let registry = &self.ctx.registry;
        if success {
            registry.streaming.complete(&self.stream_id);
        } else {
            registry
                .streaming
                .fail(&self.stream_id, failure_reason.unwrap_or("stream failed"));
        }
        registry.stream_ended();

        let usage = &self.plan_usage;
        let total_tokens = usage.prompt_tokens + self.tokens_emitted;
        self.ctx
            .router
            .complete(&self.ctx.decision, total_tokens, success);

        if success {
            if let Some((cache, fingerprint)) = &self.ctx.cache {
                cache.insert(fingerprint, usage.prompt_tokens, self.ctx.decision.cached_tokens);
            }
        }

        let latency_ms = self.ctx.started.elapsed().as_secs_f64() * 1000.0;
        registry.models.record(
            &self.model,
            self.ctx.endpoint,
            self.ctx.user.as_deref(),
            usage.prompt_tokens,
            if success { usage.completion_tokens } else { self.tokens_emitted },
            latency_ms,
            !success,
        );
        registry.record_completion(self.ctx.endpoint, latency_ms, usage.completion_tokens, !success);
        registry.record_tokens(
            &self.model,
            usage.prompt_tokens,
            if success { usage.completion_tokens } else { self.tokens_emitted },
            self.ctx.decision.cached_tokens,
        );
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(stream = %self.stream_id, "stream cancelled by client");
            self.finish(false, Some("Stream cancelled by client"));
        }
    }
}

async fn run_stream(
    plan: StreamPlan,
    timing: StreamTiming,
    ctx: StreamContext,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut guard = StreamGuard::new(plan.id.clone(), plan.model.clone(), plan.usage.clone(), ctx);
    let mut emitter = Emitter {
        tx,
        last_frame: Instant::now(),
        keepalive: timing.keepalive,
    };

    match drive(&plan, &timing, &mut guard, &mut emitter).await {
        Ok(()) => guard.finish(true, None),
        Err(Abort::Cancelled) => {
            // No error chunk: the connection is already gone. The guard
            // handles state when we return.
            guard.finish(false, Some("Stream cancelled by client"));
        }
        Err(Abort::TimedOut) => guard.finish(false, Some("stream timed out")),
    }
}

async fn drive(
    plan: &StreamPlan,
    timing: &StreamTiming,
    guard: &mut StreamGuard,
    emitter: &mut Emitter,
) -> Result<(), Abort> {
    let deadline = Instant::now() + timing.total_timeout;

    // Phase 1: role announcement.
    emitter.send(frame(&chunk(
        plan,
        Delta {
            role: Some("assistant".to_string()),
            ..Default::default()
        },
        None,
    )))
    .await?;

    // Phase 2: TTFT.
    let ttft = {
        let mut rng = rand::rng();
        timing.sample_ttft(&mut rng)
    };
    emitter.sleep(ttft).await?;

    // The per-token clock starts at the first emitted token, so a tiny
    // token timeout still lets the first token out.
    let mut last_token: Option<Instant> = None;

    // Phase 3: reasoning.
    for token in &plan.reasoning {
        pace(plan, timing, emitter, deadline, last_token).await?;
        emitter.send(frame(&chunk(
            plan,
            Delta {
                reasoning_content: Some(token.clone()),
                ..Default::default()
            },
            None,
        )))
        .await?;
        guard.token();
        last_token = Some(Instant::now());
    }

    // Phase 4: content.
    match &plan.content {
        ContentPlan::Text(tokens) => {
            for token in tokens {
                pace(plan, timing, emitter, deadline, last_token).await?;
                emitter.send(frame(&chunk(
                    plan,
                    Delta {
                        content: Some(token.clone()),
                        ..Default::default()
                    },
                    None,
                )))
                .await?;
                guard.token();
                last_token = Some(Instant::now());
            }
        }
        ContentPlan::Structured(document) => {
            pace(plan, timing, emitter, deadline, last_token).await?;
            emitter.send(frame(&chunk(
                plan,
                Delta {
                    content: Some(document.clone()),
                    ..Default::default()
                },
                None,
            )))
            .await?;
            guard.token();
        }
        ContentPlan::ToolCalls(calls) => {
            for (index, call) in calls.iter().enumerate() {
                pace(plan, timing, emitter, deadline, last_token).await?;
                emitter.send(frame(&chunk(
                    plan,
                    Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: Some(call.id.clone()),
                            call_type: Some("function".to_string()),
                            function: Some(ToolCallFunctionDelta {
                                name: Some(call.name.clone()),
                                arguments: None,
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                )))
                .await?;
                guard.token();
                last_token = Some(Instant::now());

                for fragment in split_arguments(&call.arguments) {
                    pace(plan, timing, emitter, deadline, last_token).await?;
                    emitter.send(frame(&chunk(
                        plan,
                        Delta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index,
                                id: None,
                                call_type: None,
                                function: Some(ToolCallFunctionDelta {
                                    name: None,
                                    arguments: Some(fragment),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    )))
                    .await?;
                    guard.token();
                    last_token = Some(Instant::now());
                }
            }
        }
    }

    // Phase 5: final chunk and terminator.
    let mut final_chunk = chunk(plan, Delta::default(), Some(plan.finish_reason.clone()));
    if plan.include_usage {
        final_chunk.usage = Some(plan.usage.clone());
    }
    emitter.send(frame(&final_chunk)).await?;
    emitter.send(Bytes::from_static(b"data: [DONE]\n\n")).await?;
    Ok(())
}

/// One inter-token step: timeout checks, then the ITL sleep.
async fn pace(
    plan: &StreamPlan,
    timing: &StreamTiming,
    emitter: &mut Emitter,
    deadline: Instant,
    last_token: Option<Instant>,
) -> Result<(), Abort> {
    if Instant::now() > deadline {
        emit_timeout(plan, emitter, "Stream exceeded the total timeout").await?;
        return Err(Abort::TimedOut);
    }
    if let Some(last) = last_token {
        if last.elapsed() > timing.token_timeout {
            emit_timeout(plan, emitter, "Stream exceeded the per-token timeout").await?;
            return Err(Abort::TimedOut);
        }
    }

    let itl = {
        let mut rng = rand::rng();
        timing.sample_itl(&mut rng)
    };
    emitter.sleep(itl).await?;

    // Re-check after sleeping so a too-small token timeout cannot be
    // outrun by the ITL itself.
    if let Some(last) = last_token {
        if last.elapsed() > timing.token_timeout {
            emit_timeout(plan, emitter, "Stream exceeded the per-token timeout").await?;
            return Err(Abort::TimedOut);
        }
    }
    Ok(())
}

async fn emit_timeout(plan: &StreamPlan, emitter: &mut Emitter, message: &str) -> Result<(), Abort> {
    let mut error_chunk = chunk(plan, Delta::default(), Some("error".to_string()));
    error_chunk.error =
        Some(ErrorDetail::new("timeout_error", message).with_code("timeout_error"));
    emitter.send(frame(&error_chunk)).await?;
    emitter.send(Bytes::from_static(b"data: [DONE]\n\n")).await?;
    Ok(())
}

fn chunk(plan: &StreamPlan, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: plan.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: plan.created,
        model: plan.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        system_fingerprint: system_fingerprint(),
        usage: None,
        error: None,
    }
}

fn frame(chunk: &ChatCompletionChunk) -> Bytes {
    let json = serde_json::to_string(chunk).expect("chunk serialization cannot fail");
    Bytes::from(format!("data: {}\n\n", json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvcache::{router::CostWeights, WorkerPool};
    use crate::openai::unix_now;
    use tokio_stream::StreamExt;

    fn test_ctx(registry: Arc<MetricsRegistry>, router: Arc<SmartRouter>) -> StreamContext {
        let decision = router.route(&[1, 2, 3], 5);
        StreamContext {
            registry,
            router,
            decision,
            cache: None,
            endpoint: "/v1/chat/completions",
            user: None,
            started: Instant::now(),
        }
    }

    fn fast_timing() -> StreamTiming {
        StreamTiming {
            ttft: Duration::ZERO,
            ttft_variance: 0.0,
            itl: Duration::ZERO,
            itl_variance: 0.0,
            total_timeout: Duration::from_secs(300),
            token_timeout: Duration::from_secs(30),
            keepalive: None,
        }
    }

    fn text_plan(tokens: Vec<&str>, reasoning: Vec<&str>) -> StreamPlan {
        let completion = tokens.len() as u64;
        StreamPlan {
            id: "chatcmpl-test".to_string(),
            model: "gpt-4o".to_string(),
            created: unix_now(),
            reasoning: reasoning.into_iter().map(String::from).collect(),
            content: ContentPlan::Text(tokens.into_iter().map(String::from).collect()),
            finish_reason: "stop".to_string(),
            usage: Usage::new(10, completion),
            include_usage: true,
        }
    }

    async fn collect_frames(
        plan: StreamPlan,
        timing: StreamTiming,
        ctx: StreamContext,
    ) -> Vec<String> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_stream(plan, timing, ctx, tx));
        let mut frames = Vec::new();
        let mut stream = ReceiverStream::new(rx);
        while let Some(Ok(bytes)) = stream.next().await {
            frames.push(String::from_utf8(bytes.to_vec()).unwrap());
        }
        frames
    }

    fn parse(frame: &str) -> serde_json::Value {
        serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap()
    }

    #[tokio::test]
    async fn chunk_order_role_content_final_done() {
        let registry = Arc::new(MetricsRegistry::new());
        let router = Arc::new(SmartRouter::new(
            Arc::new(WorkerPool::new(2)),
            16,
            CostWeights::default(),
        ));
        let frames = collect_frames(
            text_plan(vec![" a", " b", " c"], vec![]),
            fast_timing(),
            test_ctx(registry.clone(), router),
        )
        .await;

        assert_eq!(frames.len(), 6); // role + 3 content + final + DONE
        assert_eq!(parse(&frames[0])["choices"][0]["delta"]["role"], "assistant");
        for frame in &frames[1..4] {
            assert!(parse(frame)["choices"][0]["delta"]["content"].is_string());
        }
        let final_chunk = parse(&frames[4]);
        assert_eq!(final_chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(final_chunk["usage"]["completion_tokens"], 3);
        assert_eq!(frames[5], "data: [DONE]\n\n");

        let stats = registry.streaming.stats();
        assert_eq!(stats.completed_streams, 1);
        assert_eq!(stats.failed_streams, 0);
    }

    #[tokio::test]
    async fn reasoning_precedes_content() {
        let registry = Arc::new(MetricsRegistry::new());
        let router = Arc::new(SmartRouter::new(
            Arc::new(WorkerPool::new(1)),
            16,
            CostWeights::default(),
        ));
        let frames = collect_frames(
            text_plan(vec![" answer"], vec!["Think", " hard"]),
            fast_timing(),
            test_ctx(registry, router),
        )
        .await;

        // role, 2 reasoning, 1 content, final, DONE.
        assert_eq!(frames.len(), 6);
        assert!(parse(&frames[1])["choices"][0]["delta"]["reasoning_content"].is_string());
        assert!(parse(&frames[2])["choices"][0]["delta"]["reasoning_content"].is_string());
        assert!(parse(&frames[3])["choices"][0]["delta"]["content"].is_string());
    }

    #[tokio::test]
    async fn zero_token_plan_emits_role_and_final_only() {
        let registry = Arc::new(MetricsRegistry::new());
        let router = Arc::new(SmartRouter::new(
            Arc::new(WorkerPool::new(1)),
            16,
            CostWeights::default(),
        ));
        let mut plan = text_plan(vec![], vec![]);
        plan.finish_reason = "length".to_string();
        let frames = collect_frames(plan, fast_timing(), test_ctx(registry, router)).await;

        assert_eq!(frames.len(), 3); // role + final + DONE
        let final_chunk = parse(&frames[1]);
        assert_eq!(final_chunk["choices"][0]["finish_reason"], "length");
        assert_eq!(final_chunk["usage"]["completion_tokens"], 0);
    }

    #[tokio::test]
    async fn tool_call_split_across_deltas() {
        let registry = Arc::new(MetricsRegistry::new());
        let router = Arc::new(SmartRouter::new(
            Arc::new(WorkerPool::new(1)),
            16,
            CostWeights::default(),
        ));
        let mut plan = text_plan(vec![], vec![]);
        plan.content = ContentPlan::ToolCalls(vec![PlannedCall {
            id: "call_1".to_string(),
            name: "get_weather".to_string(),
            arguments: r#"{"city":"Boston","unit":"celsius"}"#.to_string(),
        }]);
        plan.finish_reason = "tool_calls".to_string();

        let frames = collect_frames(plan, fast_timing(), test_ctx(registry, router)).await;

        // Header delta carries id + name, no arguments.
        let header = parse(&frames[1]);
        let call = &header["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["id"], "call_1");
        assert_eq!(call["function"]["name"], "get_weather");
        assert!(call["function"].get("arguments").is_none());

        // Argument fragments concatenate to the original JSON.
        let mut arguments = String::new();
        for frame in &frames[2..frames.len() - 2] {
            let delta = parse(frame);
            arguments.push_str(
                delta["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"]
                    .as_str()
                    .unwrap(),
            );
        }
        assert_eq!(arguments, r#"{"city":"Boston","unit":"celsius"}"#);
        assert_eq!(
            parse(&frames[frames.len() - 2])["choices"][0]["finish_reason"],
            "tool_calls"
        );
    }

    #[tokio::test]
    async fn cancellation_marks_failed_and_frees_worker() {
        let registry = Arc::new(MetricsRegistry::new());
        let pool = Arc::new(WorkerPool::new(1));
        let router = Arc::new(SmartRouter::new(pool.clone(), 16, CostWeights::default()));
        let ctx = test_ctx(registry.clone(), router);

        let mut timing = fast_timing();
        timing.itl = Duration::from_millis(20);

        let tokens: Vec<&str> = vec![" tok"; 500];
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run_stream(text_plan(tokens, vec![]), timing, ctx, tx));

        // Read a few frames, then hang up.
        let mut stream = ReceiverStream::new(rx);
        for _ in 0..5 {
            let _ = stream.next().await;
        }
        drop(stream);
        handle.await.unwrap();

        let stats = registry.streaming.stats();
        assert_eq!(stats.failed_streams, 1);
        assert_eq!(stats.completed_streams, 0);
        assert_eq!(pool.active_requests(), 0);

        let record = &registry.streaming.recent(1)[0];
        assert_eq!(record.error.as_deref(), Some("Stream cancelled by client"));
    }

    #[tokio::test]
    async fn zero_token_timeout_fails_after_first_token() {
        let registry = Arc::new(MetricsRegistry::new());
        let router = Arc::new(SmartRouter::new(
            Arc::new(WorkerPool::new(1)),
            16,
            CostWeights::default(),
        ));
        let mut timing = fast_timing();
        timing.token_timeout = Duration::ZERO;
        timing.itl = Duration::from_millis(5);

        let frames = collect_frames(
            text_plan(vec![" a", " b"], vec![]),
            timing,
            test_ctx(registry.clone(), router),
        )
        .await;

        // The error chunk ends the stream.
        let last_data = parse(&frames[frames.len() - 2]);
        assert_eq!(last_data["choices"][0]["finish_reason"], "error");
        assert_eq!(last_data["error"]["type"], "timeout_error");
        assert_eq!(last_data["error"]["code"], "timeout_error");
        assert_eq!(registry.streaming.stats().failed_streams, 1);
    }

    #[tokio::test]
    async fn keepalive_comment_emitted_during_long_gap() {
        let registry = Arc::new(MetricsRegistry::new());
        let router = Arc::new(SmartRouter::new(
            Arc::new(WorkerPool::new(1)),
            16,
            CostWeights::default(),
        ));
        let mut timing = fast_timing();
        timing.ttft = Duration::from_millis(80);
        timing.keepalive = Some(Duration::from_millis(20));

        let frames = collect_frames(
            text_plan(vec![" a"], vec![]),
            timing,
            test_ctx(registry, router),
        )
        .await;

        assert!(
            frames.iter().any(|f| f.starts_with(": keepalive")),
            "expected a keepalive comment in {:?}",
            frames
        );
    }

    #[tokio::test]
    async fn successful_stream_refreshes_prompt_cache() {
        let registry = Arc::new(MetricsRegistry::new());
        let router = Arc::new(SmartRouter::new(
            Arc::new(WorkerPool::new(1)),
            16,
            CostWeights::default(),
        ));
        let cache = Arc::new(PromptCache::new(Duration::from_secs(60), 0, 100));
        let mut ctx = test_ctx(registry, router);
        ctx.cache = Some((cache.clone(), "fp-1".to_string()));

        let _ = collect_frames(text_plan(vec![" a"], vec![]), fast_timing(), ctx).await;
        // Entry exists (cached count is the router's matched prefix, 0 here).
        assert_eq!(cache.lookup("fp-1"), Some(0));
    }
}
