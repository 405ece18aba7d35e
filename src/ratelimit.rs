//! Per-key rate limiting with dual token buckets.
//!
//! Every API key gets an RPM bucket (one unit per request) and a TPM bucket
//! (debited by the request's estimated token count). Buckets refill lazily
//! from the wall clock on each check. A check that returns `allowed` has
//! already debited both buckets; there is no separate commit step.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of an admission check, including the headers to attach to the
/// response regardless of outcome.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_ms: u64,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct KeyBucket {
    rpm: f64,
    tpm: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rpm_capacity: f64,
    tpm_capacity: f64,
    keys: RwLock<HashMap<String, Arc<Mutex<KeyBucket>>>>,
}

impl RateLimiter {
    pub fn new(rpm: u32, tpm: u64) -> Self {
        Self {
            rpm_capacity: rpm.max(1) as f64,
            tpm_capacity: tpm.max(1) as f64,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn rpm_capacity(&self) -> u64 {
        self.rpm_capacity as u64
    }

    pub fn tpm_capacity(&self) -> u64 {
        self.tpm_capacity as u64
    }

    fn bucket_for(&self, key: &str) -> Arc<Mutex<KeyBucket>> {
        if let Some(bucket) = self.keys.read().get(key) {
            return bucket.clone();
        }
        let mut keys = self.keys.write();
        keys.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(KeyBucket {
                    rpm: self.rpm_capacity,
                    tpm: self.tpm_capacity,
                    last_refill: Instant::now(),
                }))
            })
            .clone()
    }

    /// Check and (if allowed) debit both buckets for one request wanting
    /// `tokens_requested` tokens.
    pub fn check(&self, key: &str, tokens_requested: u64) -> RateLimitDecision {
        self.check_at(key, tokens_requested, Instant::now())
    }

    /// Clock-injected variant used by tests.
    pub fn check_at(&self, key: &str, tokens_requested: u64, now: Instant) -> RateLimitDecision {
        let bucket = self.bucket_for(key);
        let mut b = bucket.lock();

        // Lazy refill from elapsed wall clock.
        let elapsed = now.saturating_duration_since(b.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            b.rpm = (b.rpm + elapsed * self.rpm_capacity / 60.0).min(self.rpm_capacity);
            b.tpm = (b.tpm + elapsed * self.tpm_capacity / 60.0).min(self.tpm_capacity);
            b.last_refill = now;
        }

        let tokens = tokens_requested as f64;
        if b.rpm >= 1.0 && b.tpm >= tokens {
            b.rpm -= 1.0;
            b.tpm -= tokens;
            let headers = self.headers_locked(&b);
            return RateLimitDecision {
                allowed: true,
                retry_after_ms: 0,
                headers,
            };
        }

        // Soonest instant at which a deficient bucket could be satisfied.
        let mut waits = Vec::with_capacity(2);
        if b.rpm < 1.0 {
            waits.push((1.0 - b.rpm) * 60.0 / self.rpm_capacity);
        }
        if b.tpm < tokens {
            if tokens > self.tpm_capacity {
                // Can never be satisfied at this tier.
                waits.push(f64::INFINITY);
            } else {
                waits.push((tokens - b.tpm) * 60.0 / self.tpm_capacity);
            }
        }
        let wait_s = waits.iter().cloned().fold(f64::INFINITY, f64::min);
        let retry_after_ms = if wait_s.is_finite() {
            (wait_s * 1000.0).ceil().max(1.0) as u64
        } else {
            // Request wants more tokens than the bucket can ever hold.
            60_000
        };

        let headers = self.headers_locked(&b);
        tracing::debug!(
            key = key,
            tokens = tokens_requested,
            retry_after_ms = retry_after_ms,
            "rate limit denial"
        );
        RateLimitDecision {
            allowed: false,
            retry_after_ms,
            headers,
        }
    }

    /// Current `X-RateLimit-*` headers for a key without debiting anything.
    pub fn headers(&self, key: &str) -> Vec<(String, String)> {
        let bucket = self.bucket_for(key);
        let b = bucket.lock();
        self.headers_locked(&b)
    }

    fn headers_locked(&self, b: &KeyBucket) -> Vec<(String, String)> {
        let reset_requests =
            Duration::from_secs_f64((self.rpm_capacity - b.rpm).max(0.0) * 60.0 / self.rpm_capacity);
        let reset_tokens =
            Duration::from_secs_f64((self.tpm_capacity - b.tpm).max(0.0) * 60.0 / self.tpm_capacity);
        vec![
            (
                "X-RateLimit-Limit-Requests".to_string(),
                format!("{}", self.rpm_capacity as u64),
            ),
            (
                "X-RateLimit-Limit-Tokens".to_string(),
                format!("{}", self.tpm_capacity as u64),
            ),
            (
                "X-RateLimit-Remaining-Requests".to_string(),
                format!("{}", b.rpm.floor().max(0.0) as u64),
            ),
            (
                "X-RateLimit-Remaining-Tokens".to_string(),
                format!("{}", b.tpm.floor().max(0.0) as u64),
            ),
            (
                "X-RateLimit-Reset-Requests".to_string(),
                humantime::format_duration(round_millis(reset_requests)).to_string(),
            ),
            (
                "X-RateLimit-Reset-Tokens".to_string(),
                humantime::format_duration(round_millis(reset_tokens)).to_string(),
            ),
        ]
    }

    /// Number of keys seen so far.
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }
}

/// Truncate sub-millisecond noise so header values stay short.
fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_key_starts_full() {
        let limiter = RateLimiter::new(10, 1000);
        let decision = limiter.check("k", 100);
        assert!(decision.allowed);
        assert_eq!(decision.retry_after_ms, 0);
    }

    #[test]
    fn rpm_exhaustion_denies_with_retry_after() {
        let limiter = RateLimiter::new(2, 1_000_000);
        let now = Instant::now();
        assert!(limiter.check_at("k", 10, now).allowed);
        assert!(limiter.check_at("k", 10, now).allowed);

        let third = limiter.check_at("k", 10, now);
        assert!(!third.allowed);
        assert!(third.retry_after_ms > 0);
        // One request unit refills in 60/2 = 30s.
        assert!(third.retry_after_ms <= 30_000);
    }

    #[test]
    fn tpm_exhaustion_denies() {
        let limiter = RateLimiter::new(1000, 100);
        let now = Instant::now();
        assert!(limiter.check_at("k", 80, now).allowed);
        let denied = limiter.check_at("k", 80, now);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }

    #[test]
    fn refill_restores_capacity() {
        let limiter = RateLimiter::new(60, 6000);
        let now = Instant::now();
        assert!(limiter.check_at("k", 0, now).allowed);

        // 60 rpm = 1 unit per second; after 2 simulated seconds the bucket
        // holds at least its pre-check level plus ~2 units.
        let later = now + Duration::from_secs(2);
        let decision = limiter.check_at("k", 0, later);
        assert!(decision.allowed);
    }

    #[test]
    fn allowed_check_debits_atomically() {
        let limiter = RateLimiter::new(5, 500);
        let now = Instant::now();
        let before = limiter.check_at("k", 100, now);
        assert!(before.allowed);

        let remaining: u64 = before
            .headers
            .iter()
            .find(|(name, _)| name == "X-RateLimit-Remaining-Tokens")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap();
        assert_eq!(remaining, 400);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 1000);
        let now = Instant::now();
        assert!(limiter.check_at("a", 1, now).allowed);
        assert!(!limiter.check_at("a", 1, now).allowed);
        assert!(limiter.check_at("b", 1, now).allowed);
        assert_eq!(limiter.key_count(), 2);
    }

    #[test]
    fn headers_always_present() {
        let limiter = RateLimiter::new(2, 200);
        let decision = limiter.check("k", 50);
        let names: Vec<&str> = decision.headers.iter().map(|(n, _)| n.as_str()).collect();
        for expected in [
            "X-RateLimit-Limit-Requests",
            "X-RateLimit-Limit-Tokens",
            "X-RateLimit-Remaining-Requests",
            "X-RateLimit-Remaining-Tokens",
            "X-RateLimit-Reset-Requests",
            "X-RateLimit-Reset-Tokens",
        ] {
            assert!(names.contains(&expected), "missing header {}", expected);
        }
    }

    #[test]
    fn oversized_request_gets_capped_retry() {
        let limiter = RateLimiter::new(10, 100);
        let decision = limiter.check("k", 1_000_000);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 60_000);
    }
}
