//! Embeddings: deterministic L2-normalized vectors.
//!
//! The PRNG is seeded from the SHA-256 of the input text, so the same input
//! always yields bit-identical vectors. Client test suites rely on that for
//! cache and dedup logic.

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use sha2::{Digest, Sha256};
use std::time::Instant;

use crate::error::ApiError;
use crate::openai::{
    EmbeddingObject, EmbeddingsRequest, EmbeddingsResponse, EmbeddingsUsage,
};
use crate::state::AppState;
use crate::tokens;

use super::{admit, apply_headers};

const DEFAULT_DIMENSIONS: usize = 1536;
const MAX_DIMENSIONS: usize = 3072;

/// One deterministic unit vector for `text`.
pub fn embed(text: &str, dimensions: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let seed = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    let mut rng = StdRng::seed_from_u64(seed);

    let mut vector: Vec<f32> = (0..dimensions)
        .map(|_| {
            let sample: f64 = StandardNormal.sample(&mut rng);
            sample as f32
        })
        .collect();

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Pack a float vector as base64 little-endian f32, the OpenAI
/// `encoding_format: "base64"` layout.
fn pack_base64(vector: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EmbeddingsRequest>,
) -> Result<Response, ApiError> {
    let endpoint = "/v1/embeddings";
    let started = Instant::now();

    let items = request.input.items();
    if items.is_empty() {
        return Err(ApiError::InvalidRequest(
            "'input' must not be empty".to_string(),
        ));
    }

    let dimensions = request.dimensions.unwrap_or(DEFAULT_DIMENSIONS);
    if dimensions == 0 || dimensions > MAX_DIMENSIONS {
        return Err(ApiError::InvalidRequest(format!(
            "'dimensions' must be between 1 and {}",
            MAX_DIMENSIONS
        )));
    }

    let base64_output = match request.encoding_format.as_deref() {
        None | Some("float") => false,
        Some("base64") => true,
        Some(other) => {
            return Err(ApiError::InvalidRequest(format!(
                "unsupported encoding_format '{}'",
                other
            )))
        }
    };

    let prompt_tokens: u64 = items.iter().map(|t| tokens::estimate(t)).sum();
    let admission = admit(&state, &headers, prompt_tokens)?;
    state.models.ensure(&request.model);

    let data: Vec<EmbeddingObject> = items
        .iter()
        .enumerate()
        .map(|(index, text)| {
            let vector = embed(text, dimensions);
            let embedding = if base64_output {
                serde_json::Value::String(pack_base64(&vector))
            } else {
                serde_json::to_value(&vector).expect("float vector serializes")
            };
            EmbeddingObject {
                object: "embedding".to_string(),
                index,
                embedding,
            }
        })
        .collect();

    let body = EmbeddingsResponse {
        object: "list".to_string(),
        data,
        model: request.model.clone(),
        usage: EmbeddingsUsage {
            prompt_tokens,
            total_tokens: prompt_tokens,
        },
    };

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.registry.models.record(
        &request.model,
        endpoint,
        request.user.as_deref(),
        prompt_tokens,
        0,
        latency_ms,
        false,
    );
    state
        .registry
        .record_completion(endpoint, latency_ms, prompt_tokens, false);
    state
        .registry
        .record_tokens(&request.model, prompt_tokens, 0, 0);

    let mut response = Json(body).into_response();
    apply_headers(&mut response, &admission.headers);
    Ok(response)
}
