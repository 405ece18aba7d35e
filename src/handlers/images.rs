//! Image generation: real PNG bytes, synthetic content.
//!
//! Images are a vertical two-stop gradient seeded from the prompt hash with
//! a grid pattern overlay. The output decodes in any PNG reader, is cheap
//! to produce, and is visually distinct per prompt. URL-mode images are parked in an
//! in-memory store with a TTL and served by `GET /images/{id}`.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;
use std::time::{Duration, Instant};

use crate::error::ApiError;
use crate::openai::{unix_now, ImageGenerationRequest, ImageGenerationResponse, ImageObject};
use crate::state::AppState;

use super::{admit, apply_headers};

const ALLOWED_SIZES: &[&str] = &["256x256", "512x512", "1024x1024", "1792x1024", "1024x1792"];
const MAX_IMAGES_PER_REQUEST: u32 = 4;
const STORE_TTL: Duration = Duration::from_secs(3600);

lazy_static! {
    static ref IMAGE_STORE: Mutex<HashMap<String, (Vec<u8>, Instant)>> =
        Mutex::new(HashMap::new());
}

fn store_image(bytes: Vec<u8>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let mut store = IMAGE_STORE.lock();
    let now = Instant::now();
    store.retain(|_, (_, created)| now.duration_since(*created) < STORE_TTL);
    store.insert(id.clone(), (bytes, now));
    id
}

fn fetch_image(id: &str) -> Option<Vec<u8>> {
    let store = IMAGE_STORE.lock();
    let (bytes, created) = store.get(id)?;
    if created.elapsed() >= STORE_TTL {
        return None;
    }
    Some(bytes.clone())
}

/// Render one PNG for `prompt` at the given size. `index` varies the seed
/// so `n > 1` requests produce distinct images.
pub fn render_png(prompt: &str, width: u32, height: u32, index: u32) -> Vec<u8> {
    let digest = Sha256::digest(format!("{}#{}", prompt, index).as_bytes());
    let top = Rgb([digest[0], digest[1], digest[2]]);
    let bottom = Rgb([digest[3], digest[4], digest[5]]);
    let grid = 32 + (digest[6] as u32 % 32);

    let mut img = RgbImage::new(width, height);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let t = y as f32 / height.max(1) as f32;
        let mut channels = [0u8; 3];
        for c in 0..3 {
            let blended = top.0[c] as f32 * (1.0 - t) + bottom.0[c] as f32 * t;
            channels[c] = blended as u8;
        }
        // Grid overlay.
        if x % grid == 0 || y % grid == 0 {
            for channel in &mut channels {
                *channel = channel.saturating_add(24);
            }
        }
        *pixel = Rgb(channels);
    }

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("in-memory PNG encoding cannot fail");
    bytes
}

fn parse_size(size: Option<&str>) -> Result<(u32, u32), ApiError> {
    let size = size.unwrap_or("1024x1024");
    if !ALLOWED_SIZES.contains(&size) {
        return Err(ApiError::InvalidRequest(format!(
            "invalid 'size' {}; expected one of {}",
            size,
            ALLOWED_SIZES.join(", ")
        )));
    }
    let (w, h) = size.split_once('x').expect("validated format");
    Ok((
        w.parse().expect("validated format"),
        h.parse().expect("validated format"),
    ))
}

pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ImageGenerationRequest>,
) -> Result<Response, ApiError> {
    let endpoint = "/v1/images/generations";
    let started = Instant::now();

    if request.prompt.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "'prompt' must not be empty".to_string(),
        ));
    }
    let n = request.n.unwrap_or(1);
    if n == 0 || n > MAX_IMAGES_PER_REQUEST {
        return Err(ApiError::InvalidRequest(format!(
            "'n' must be between 1 and {}",
            MAX_IMAGES_PER_REQUEST
        )));
    }
    let (width, height) = parse_size(request.size.as_deref())?;
    let b64_mode = match request.response_format.as_deref() {
        None | Some("url") => false,
        Some("b64_json") => true,
        Some(other) => {
            return Err(ApiError::InvalidRequest(format!(
                "invalid 'response_format' {}; expected 'url' or 'b64_json'",
                other
            )))
        }
    };

    let prompt_tokens = crate::tokens::estimate(&request.prompt);
    let admission = admit(&state, &headers, prompt_tokens)?;
    let model = request.model.as_deref().unwrap_or("stabilityai/sdxl-turbo");
    state.models.ensure(model);

    let data: Vec<ImageObject> = (0..n)
        .map(|index| {
            let bytes = render_png(&request.prompt, width, height, index);
            if b64_mode {
                ImageObject {
                    url: None,
                    b64_json: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                }
            } else {
                let id = store_image(bytes);
                ImageObject {
                    url: Some(format!(
                        "http://{}:{}/images/{}",
                        state.config.host, state.config.port, id
                    )),
                    b64_json: None,
                }
            }
        })
        .collect();

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state
        .registry
        .models
        .record(model, endpoint, None, prompt_tokens, 0, latency_ms, false);
    state
        .registry
        .record_completion(endpoint, latency_ms, 0, false);

    let mut response = Json(ImageGenerationResponse {
        created: unix_now(),
        data,
    })
    .into_response();
    apply_headers(&mut response, &admission.headers);
    Ok(response)
}

pub async fn serve(Path(id): Path<String>) -> Response {
    let id = id.trim_end_matches(".png");
    match fetch_image(id) {
        Some(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/png")],
            bytes,
        )
            .into_response(),
        None => ApiError::NotFound(format!("image '{}' not found or expired", id)).into_response(),
    }
}
