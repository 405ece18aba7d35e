//! Rate-limit analytics: per-key attempt/throttle accounting, retry-after
//! distributions, and abuse-pattern detection.
//!
//! This registry is observational only; admission decisions are made by the
//! limiter itself. 429s recorded here deliberately do not feed the endpoint
//! error-rate windows.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::window::percentile;

const RETRY_SAMPLES: usize = 1000;
const THROTTLE_TIMES: usize = 100;

/// A key is called abusive when at least this share of its attempts are
/// throttled (with a minimum sample size), or when it hammers the limiter
/// with a burst of throttled retries.
const ABUSE_THROTTLE_RATIO: f64 = 0.5;
const ABUSE_MIN_ATTEMPTS: u64 = 10;
const BURST_WINDOW: Duration = Duration::from_secs(10);
const BURST_THROTTLES: usize = 5;

#[derive(Debug, Default)]
struct KeyStats {
    attempts: u64,
    allowed: u64,
    throttled: u64,
    tokens_admitted: u64,
    retry_after_ms: VecDeque<f64>,
    throttle_times: VecDeque<Instant>,
}

#[derive(Debug, Default)]
pub struct RateLimitMetricsRegistry {
    keys: Mutex<HashMap<String, KeyStats>>,
}

impl RateLimitMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, allowed: bool, tokens: u64, retry_after_ms: u64) {
        let mut keys = self.keys.lock();
        let stats = keys.entry(key.to_string()).or_default();
        stats.attempts += 1;
        if allowed {
            stats.allowed += 1;
            stats.tokens_admitted += tokens;
        } else {
            stats.throttled += 1;
            if stats.retry_after_ms.len() >= RETRY_SAMPLES {
                stats.retry_after_ms.pop_front();
            }
            stats.retry_after_ms.push_back(retry_after_ms as f64);
            if stats.throttle_times.len() >= THROTTLE_TIMES {
                stats.throttle_times.pop_front();
            }
            stats.throttle_times.push_back(Instant::now());
        }
    }

    pub fn per_key(&self, key: &str) -> Option<Value> {
        let keys = self.keys.lock();
        keys.get(key).map(|s| key_report(key, s))
    }

    pub fn summary(&self) -> Value {
        let keys = self.keys.lock();
        let attempts: u64 = keys.values().map(|s| s.attempts).sum();
        let throttled: u64 = keys.values().map(|s| s.throttled).sum();
        json!({
            "keys_seen": keys.len(),
            "attempts": attempts,
            "allowed": attempts - throttled,
            "throttled": throttled,
            "throttle_rate": if attempts > 0 { throttled as f64 / attempts as f64 } else { 0.0 },
            "tokens_admitted": keys.values().map(|s| s.tokens_admitted).sum::<u64>(),
        })
    }

    /// Retry-after distribution across all throttles, with coarse buckets
    /// for dashboard bars.
    pub fn throttle_analytics(&self) -> Value {
        let keys = self.keys.lock();
        let mut samples: Vec<f64> = keys
            .values()
            .flat_map(|s| s.retry_after_ms.iter().copied())
            .collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut buckets = [0u64; 4];
        for &ms in &samples {
            let idx = if ms < 1_000.0 {
                0
            } else if ms < 5_000.0 {
                1
            } else if ms < 30_000.0 {
                2
            } else {
                3
            };
            buckets[idx] += 1;
        }

        json!({
            "throttle_count": samples.len(),
            "retry_after_ms": {
                "p50": percentile(&samples, 50.0),
                "p90": percentile(&samples, 90.0),
                "p99": percentile(&samples, 99.0),
            },
            "retry_after_buckets": {
                "under_1s": buckets[0],
                "1s_to_5s": buckets[1],
                "5s_to_30s": buckets[2],
                "over_30s": buckets[3],
            },
        })
    }

    /// Keys whose behavior looks abusive: persistently throttled, or
    /// retrying in tight bursts while throttled.
    pub fn abuse_patterns(&self) -> Value {
        let keys = self.keys.lock();
        let now = Instant::now();
        let mut offenders = Vec::new();

        for (key, stats) in keys.iter() {
            let ratio = if stats.attempts > 0 {
                stats.throttled as f64 / stats.attempts as f64
            } else {
                0.0
            };
            let persistent =
                stats.attempts >= ABUSE_MIN_ATTEMPTS && ratio >= ABUSE_THROTTLE_RATIO;

            let recent_burst = stats
                .throttle_times
                .iter()
                .filter(|t| now.duration_since(**t) <= BURST_WINDOW)
                .count()
                >= BURST_THROTTLES;

            if persistent || recent_burst {
                let mut patterns = Vec::new();
                if persistent {
                    patterns.push("persistent_throttling");
                }
                if recent_burst {
                    patterns.push("rapid_retry_burst");
                }
                offenders.push(json!({
                    "key": key,
                    "attempts": stats.attempts,
                    "throttled": stats.throttled,
                    "throttle_rate": ratio,
                    "patterns": patterns,
                }));
            }
        }

        json!({ "offenders": offenders })
    }

    pub fn all_keys(&self) -> Value {
        let keys = self.keys.lock();
        let reports: Vec<Value> = keys.iter().map(|(k, s)| key_report(k, s)).collect();
        json!({ "keys": reports })
    }
}

fn key_report(key: &str, s: &KeyStats) -> Value {
    json!({
        "key": key,
        "attempts": s.attempts,
        "allowed": s.allowed,
        "throttled": s.throttled,
        "throttle_rate": if s.attempts > 0 { s.throttled as f64 / s.attempts as f64 } else { 0.0 },
        "tokens_admitted": s.tokens_admitted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_split_by_outcome() {
        let reg = RateLimitMetricsRegistry::new();
        reg.record("k", true, 100, 0);
        reg.record("k", true, 50, 0);
        reg.record("k", false, 80, 2000);

        let report = reg.per_key("k").unwrap();
        assert_eq!(report["attempts"], 3);
        assert_eq!(report["allowed"], 2);
        assert_eq!(report["throttled"], 1);
        assert_eq!(report["tokens_admitted"], 150);
    }

    #[test]
    fn summary_aggregates_keys() {
        let reg = RateLimitMetricsRegistry::new();
        reg.record("a", true, 10, 0);
        reg.record("b", false, 10, 500);
        let summary = reg.summary();
        assert_eq!(summary["keys_seen"], 2);
        assert_eq!(summary["attempts"], 2);
        assert_eq!(summary["throttled"], 1);
    }

    #[test]
    fn throttle_buckets_classify_retry_after() {
        let reg = RateLimitMetricsRegistry::new();
        reg.record("k", false, 1, 500);
        reg.record("k", false, 1, 2_000);
        reg.record("k", false, 1, 10_000);
        reg.record("k", false, 1, 45_000);

        let analytics = reg.throttle_analytics();
        assert_eq!(analytics["throttle_count"], 4);
        assert_eq!(analytics["retry_after_buckets"]["under_1s"], 1);
        assert_eq!(analytics["retry_after_buckets"]["1s_to_5s"], 1);
        assert_eq!(analytics["retry_after_buckets"]["5s_to_30s"], 1);
        assert_eq!(analytics["retry_after_buckets"]["over_30s"], 1);
    }

    #[test]
    fn persistent_throttling_flagged() {
        let reg = RateLimitMetricsRegistry::new();
        for _ in 0..6 {
            reg.record("noisy", false, 1, 1000);
        }
        for _ in 0..4 {
            reg.record("noisy", true, 1, 0);
        }
        reg.record("quiet", true, 1, 0);

        let abuse = reg.abuse_patterns();
        let offenders = abuse["offenders"].as_array().unwrap();
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0]["key"], "noisy");
        assert!(offenders[0]["patterns"]
            .as_array()
            .unwrap()
            .contains(&json!("persistent_throttling")));
    }

    #[test]
    fn burst_detection_fires_on_rapid_throttles() {
        let reg = RateLimitMetricsRegistry::new();
        for _ in 0..BURST_THROTTLES {
            reg.record("bursty", false, 1, 100);
        }
        let abuse = reg.abuse_patterns();
        let offenders = abuse["offenders"].as_array().unwrap();
        assert!(offenders
            .iter()
            .any(|o| o["key"] == "bursty"
                && o["patterns"].as_array().unwrap().contains(&json!("rapid_retry_burst"))));
    }

    #[test]
    fn clean_keys_not_flagged() {
        let reg = RateLimitMetricsRegistry::new();
        for _ in 0..100 {
            reg.record("good", true, 10, 0);
        }
        assert!(reg.abuse_patterns()["offenders"]
            .as_array()
            .unwrap()
            .is_empty());
    }
}
