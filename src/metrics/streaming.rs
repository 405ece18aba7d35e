//! Streaming-lifecycle tracking: TTFT, throughput, and terminal-state
//! accounting for every SSE stream.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use super::window::percentile;

/// Archived terminal streams retained for percentile stats.
const ARCHIVE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct LiveStream {
    started_at: Instant,
    first_token_at: Option<Instant>,
    last_token_at: Option<Instant>,
    token_count: u64,
}

/// Terminal record kept in the bounded archive.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    pub stream_id: String,
    pub state: StreamState,
    pub ttft_ms: Option<f64>,
    pub duration_ms: f64,
    pub token_count: u64,
    pub tokens_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: HashMap<String, LiveStream>,
    archive: VecDeque<StreamRecord>,
    completed: u64,
    failed: u64,
}

#[derive(Debug, Default)]
pub struct StreamingTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StreamingStats {
    pub active_streams: usize,
    pub completed_streams: u64,
    pub failed_streams: u64,
    pub ttft_ms_avg: f64,
    pub ttft_ms_p50: f64,
    pub ttft_ms_p99: f64,
    pub tokens_per_second_avg: f64,
    pub tokens_per_second_p50: f64,
    pub tokens_per_second_p99: f64,
}

impl StreamingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, stream_id: &str) {
        let mut inner = self.inner.lock();
        inner.active.insert(
            stream_id.to_string(),
            LiveStream {
                started_at: Instant::now(),
                first_token_at: None,
                last_token_at: None,
                token_count: 0,
            },
        );
    }

    /// Record one emitted token; the first call also pins TTFT.
    pub fn token(&self, stream_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.active.get_mut(stream_id) {
            let now = Instant::now();
            if stream.first_token_at.is_none() {
                stream.first_token_at = Some(now);
            }
            stream.last_token_at = Some(now);
            stream.token_count += 1;
        }
    }

    pub fn complete(&self, stream_id: &str) {
        self.finish(stream_id, StreamState::Completed, None);
    }

    pub fn fail(&self, stream_id: &str, error: &str) {
        self.finish(stream_id, StreamState::Failed, Some(error.to_string()));
    }

    fn finish(&self, stream_id: &str, state: StreamState, error: Option<String>) {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.active.remove(stream_id) else {
            return;
        };

        let duration = stream.started_at.elapsed();
        let ttft_ms = stream
            .first_token_at
            .map(|t| t.duration_since(stream.started_at).as_secs_f64() * 1000.0);
        let generation_secs = match (stream.first_token_at, stream.last_token_at) {
            (Some(first), Some(last)) => last.duration_since(first).as_secs_f64(),
            _ => 0.0,
        };
        let tokens_per_second = if generation_secs > 0.0 {
            stream.token_count as f64 / generation_secs
        } else {
            0.0
        };

        match state {
            StreamState::Completed => inner.completed += 1,
            StreamState::Failed => inner.failed += 1,
            StreamState::Active => unreachable!("finish is only called with terminal states"),
        }

        if inner.archive.len() >= ARCHIVE_CAPACITY {
            inner.archive.pop_front();
        }
        inner.archive.push_back(StreamRecord {
            stream_id: stream_id.to_string(),
            state,
            ttft_ms,
            duration_ms: duration.as_secs_f64() * 1000.0,
            token_count: stream.token_count,
            tokens_per_second,
            error,
        });
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn stats(&self) -> StreamingStats {
        let inner = self.inner.lock();

        let mut ttfts: Vec<f64> = inner.archive.iter().filter_map(|r| r.ttft_ms).collect();
        ttfts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut rates: Vec<f64> = inner
            .archive
            .iter()
            .filter(|r| r.tokens_per_second > 0.0)
            .map(|r| r.tokens_per_second)
            .collect();
        rates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let avg = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        StreamingStats {
            active_streams: inner.active.len(),
            completed_streams: inner.completed,
            failed_streams: inner.failed,
            ttft_ms_avg: avg(&ttfts),
            ttft_ms_p50: percentile(&ttfts, 50.0),
            ttft_ms_p99: percentile(&ttfts, 99.0),
            tokens_per_second_avg: avg(&rates),
            tokens_per_second_p50: percentile(&rates, 50.0),
            tokens_per_second_p99: percentile(&rates, 99.0),
        }
    }

    /// Recent terminal records, newest last.
    pub fn recent(&self, limit: usize) -> Vec<StreamRecord> {
        let inner = self.inner.lock();
        inner
            .archive
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}
