//! Speech synthesis: a valid WAV container holding a synthetic tone.
//!
//! Duration scales with the input length and `speed`; the voice picks the
//! base pitch. Non-WAV formats are served as the same PCM payload with the
//! requested content type, which is enough for clients that only check
//! headers and duration.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::time::Instant;

use crate::error::ApiError;
use crate::openai::SpeechRequest;
use crate::state::AppState;
use crate::tokens;

use super::{admit, apply_headers};

const SAMPLE_RATE: u32 = 16_000;
/// Speaking rate used to derive clip length from text length.
const CHARS_PER_SECOND: f64 = 15.0;
const MAX_DURATION_S: f64 = 60.0;

/// 44-byte RIFF/WAVE header for 16-bit mono PCM.
fn wav_header(num_samples: u32) -> [u8; 44] {
    let data_len = num_samples * 2;
    let mut header = [0u8; 44];
    header[..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&1u16.to_le_bytes()); // mono
    header[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
    header[28..32].copy_from_slice(&(SAMPLE_RATE * 2).to_le_bytes());
    header[32..34].copy_from_slice(&2u16.to_le_bytes());
    header[34..36].copy_from_slice(&16u16.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

/// Synthesize the audio payload for `text` at the given speed and voice.
pub fn synthesize(text: &str, voice: &str, speed: f64) -> Vec<u8> {
    let speed = speed.clamp(0.25, 4.0);
    let duration_s =
        (text.chars().count() as f64 / (CHARS_PER_SECOND * speed)).clamp(0.1, MAX_DURATION_S);
    let num_samples = (duration_s * SAMPLE_RATE as f64) as u32;

    // Voice-dependent base pitch in a comfortable band.
    let voice_hash: u32 = voice.bytes().fold(0u32, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(b as u32)
    });
    let pitch_hz = 140.0 + (voice_hash % 160) as f64;

    let mut bytes = Vec::with_capacity(44 + num_samples as usize * 2);
    bytes.extend_from_slice(&wav_header(num_samples));
    for i in 0..num_samples {
        let t = i as f64 / SAMPLE_RATE as f64;
        // Tone with a slow wobble so it does not sound like a flatline test
        // signal in players.
        let wobble = 1.0 + 0.02 * (t * 2.0).sin();
        let sample = (t * pitch_hz * wobble * std::f64::consts::TAU).sin();
        let amplitude = (sample * 0.25 * i16::MAX as f64) as i16;
        bytes.extend_from_slice(&amplitude.to_le_bytes());
    }
    bytes
}

fn content_type(format: Option<&str>) -> Result<&'static str, ApiError> {
    match format.unwrap_or("mp3") {
        "wav" => Ok("audio/wav"),
        "mp3" => Ok("audio/mpeg"),
        "opus" => Ok("audio/opus"),
        "aac" => Ok("audio/aac"),
        "flac" => Ok("audio/flac"),
        "pcm" => Ok("audio/pcm"),
        other => Err(ApiError::InvalidRequest(format!(
            "unsupported audio response_format '{}'",
            other
        ))),
    }
}

pub async fn speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SpeechRequest>,
) -> Result<Response, ApiError> {
    let endpoint = "/v1/audio/speech";
    let started = Instant::now();

    if request.input.is_empty() {
        return Err(ApiError::InvalidRequest(
            "'input' must not be empty".to_string(),
        ));
    }
    let mime = content_type(request.response_format.as_deref())?;

    let prompt_tokens = tokens::estimate(&request.input);
    let admission = admit(&state, &headers, prompt_tokens)?;
    state.models.ensure(&request.model);

    let bytes = synthesize(
        &request.input,
        &request.voice,
        request.speed.unwrap_or(1.0) as f64,
    );

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.registry.models.record(
        &request.model,
        endpoint,
        None,
        prompt_tokens,
        0,
        latency_ms,
        false,
    );
    state
        .registry
        .record_completion(endpoint, latency_ms, 0, false);

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime)],
        bytes,
    )
        .into_response();
    apply_headers(&mut response, &admission.headers);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_is_valid() {
        let bytes = synthesize("hello there", "alloy", 1.0);
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[36..40], b"data");
        let data_len = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
        assert_eq!(bytes.len(), 44 + data_len as usize);
    }

    #[test]
    fn duration_scales_with_input_length() {
        let short = synthesize("hi", "alloy", 1.0);
        let long = synthesize(&"word ".repeat(100), "alloy", 1.0);
        assert!(long.len() > short.len());
    }

    #[test]
    fn speed_shortens_output() {
        let normal = synthesize(&"word ".repeat(40), "alloy", 1.0);
        let fast = synthesize(&"word ".repeat(40), "alloy", 2.0);
        assert!(fast.len() < normal.len());
    }

    #[test]
    fn voices_change_waveform_not_length() {
        let a = synthesize("same input text", "alloy", 1.0);
        let b = synthesize("same input text", "onyx", 1.0);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn format_validation() {
        assert!(content_type(Some("wav")).is_ok());
        assert!(content_type(None).is_ok());
        assert!(content_type(Some("ogg-vorbis-ancient")).is_err());
    }
}
