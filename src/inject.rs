//! Fault injection: randomly fail a configurable fraction of requests with
//! realistic upstream error shapes.

use axum::http::StatusCode;
use rand::Rng;

use crate::config::SimConfig;
use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct ErrorInjector {
    enabled: bool,
    rate: f64,
    kinds: Vec<String>,
}

impl ErrorInjector {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            enabled: config.error_injection_enabled,
            rate: config.error_injection_rate.clamp(0.0, 1.0),
            kinds: config.error_injection_types.clone(),
        }
    }

    /// Sample this request: `Some(error)` means the handler should return
    /// the injected failure instead of a simulated response.
    pub fn maybe_inject<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ApiError> {
        if !self.enabled || self.rate <= 0.0 || self.kinds.is_empty() {
            return None;
        }
        if !rng.random_bool(self.rate) {
            return None;
        }
        let kind = &self.kinds[rng.random_range(0..self.kinds.len())];
        let error = build_error(kind);
        tracing::warn!(kind = %kind, "injecting error");
        Some(error)
    }
}

fn build_error(kind: &str) -> ApiError {
    match kind {
        "bad_gateway" => ApiError::Injected {
            status: StatusCode::BAD_GATEWAY,
            error_type: "bad_gateway".to_string(),
            message: "The upstream model server returned an invalid response.".to_string(),
            retry_after_s: None,
        },
        "service_unavailable" => ApiError::Injected {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error_type: "service_unavailable".to_string(),
            message: "The model is temporarily overloaded. Please retry.".to_string(),
            retry_after_s: Some(5),
        },
        "gateway_timeout" => ApiError::Injected {
            status: StatusCode::GATEWAY_TIMEOUT,
            error_type: "gateway_timeout".to_string(),
            message: "The upstream model server timed out.".to_string(),
            retry_after_s: None,
        },
        "rate_limit_quota" => ApiError::Injected {
            status: StatusCode::TOO_MANY_REQUESTS,
            error_type: "insufficient_quota".to_string(),
            message: "You exceeded your current quota. Please check your plan and billing."
                .to_string(),
            retry_after_s: Some(30),
        },
        // "internal_error" and anything unrecognized.
        _ => ApiError::Injected {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_type: "server_error".to_string(),
            message: "The server had an error while processing your request.".to_string(),
            retry_after_s: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector(rate: f64) -> ErrorInjector {
        ErrorInjector::from_config(&SimConfig {
            error_injection_enabled: true,
            error_injection_rate: rate,
            ..Default::default()
        })
    }

    #[test]
    fn disabled_never_injects() {
        let inj = ErrorInjector::from_config(&SimConfig::default());
        let mut rng = rand::rng();
        assert!((0..100).all(|_| inj.maybe_inject(&mut rng).is_none()));
    }

    #[test]
    fn rate_one_always_injects() {
        let inj = injector(1.0);
        let mut rng = rand::rng();
        assert!((0..100).all(|_| inj.maybe_inject(&mut rng).is_some()));
    }

    #[test]
    fn injected_kinds_have_expected_status() {
        assert_eq!(
            build_error("bad_gateway").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            build_error("rate_limit_quota").status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            build_error("internal_error").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_half_injects_sometimes() {
        let inj = injector(0.5);
        let mut rng = rand::rng();
        let hits = (0..1000)
            .filter(|_| inj.maybe_inject(&mut rng).is_some())
            .count();
        assert!(hits > 300 && hits < 700, "rate wildly off: {}", hits);
    }
}
