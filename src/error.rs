use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// OpenAI-style error body: `{"error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorDetail {
    pub fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.to_string(),
            param: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// Typed request-level failures. Everything that can terminate a request
/// before (or instead of) a simulated response funnels through here so the
/// wire shape stays consistent across endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    NotFound(String),

    #[error("rate limit exceeded")]
    RateLimited {
        message: String,
        retry_after_ms: u64,
        headers: Vec<(String, String)>,
    },

    #[error("{message}")]
    Injected {
        status: StatusCode,
        error_type: String,
        message: String,
        retry_after_s: Option<u64>,
    },

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::ContextLengthExceeded(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Injected { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        match self {
            ApiError::InvalidRequest(msg) => ErrorDetail::new("invalid_request_error", msg.clone()),
            ApiError::ContextLengthExceeded(msg) => {
                ErrorDetail::new("invalid_request_error", msg.clone())
                    .with_code("context_length_exceeded")
            }
            ApiError::Authentication(msg) => ErrorDetail::new("authentication_error", msg.clone()),
            ApiError::NotFound(msg) => ErrorDetail::new("not_found_error", msg.clone()),
            ApiError::RateLimited { message, .. } => {
                ErrorDetail::new("rate_limit_exceeded", message.clone())
            }
            ApiError::Injected {
                error_type,
                message,
                ..
            } => ErrorDetail::new(error_type, message.clone()),
            ApiError::Internal(_) => {
                // Internal detail is logged, not surfaced.
                ErrorDetail::new("server_error", "The server had an error processing your request.")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(msg) = &self {
            tracing::error!(error = %msg, "internal error");
        }

        let status = self.status();
        let mut headers = HeaderMap::new();
        match &self {
            ApiError::RateLimited {
                retry_after_ms,
                headers: limit_headers,
                ..
            } => {
                let retry_secs = retry_after_ms.div_ceil(1000).max(1);
                if let Ok(v) = retry_secs.to_string().parse() {
                    headers.insert(header::RETRY_AFTER, v);
                }
                for (name, value) in limit_headers {
                    if let (Ok(n), Ok(v)) = (
                        header::HeaderName::from_bytes(name.as_bytes()),
                        value.parse(),
                    ) {
                        headers.insert(n, v);
                    }
                }
            }
            ApiError::Injected {
                retry_after_s: Some(secs),
                ..
            } => {
                if let Ok(v) = secs.to_string().parse() {
                    headers.insert(header::RETRY_AFTER, v);
                }
            }
            _ => {}
        }

        let body = Json(ErrorEnvelope {
            error: self.detail(),
        });
        (status, headers, body).into_response()
    }
}
