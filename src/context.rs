//! Per-model context-window validation.

use crate::error::ApiError;

/// Context window (in tokens) for known model families. Unknown models get
/// a generous default so the simulator stays permissive by default.
pub fn context_window(model: &str) -> u64 {
    // Most specific prefixes first.
    const WINDOWS: &[(&str, u64)] = &[
        ("gpt-4o", 128_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-4-32k", 32_768),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo-16k", 16_384),
        ("gpt-3.5-turbo", 16_385),
        ("o1", 200_000),
        ("o3", 200_000),
        ("o4", 200_000),
        ("openai/gpt-oss", 131_072),
        ("deepseek-ai/DeepSeek-R1", 131_072),
        ("deepseek", 65_536),
        ("meta-llama/Llama-3", 131_072),
        ("meta-llama", 8_192),
        ("mistralai/Mixtral", 32_768),
        ("claude", 200_000),
        ("text-embedding", 8_191),
    ];

    for (prefix, window) in WINDOWS {
        if model.starts_with(prefix) {
            return *window;
        }
    }
    128_000
}

/// Reject requests whose prompt plus requested output cannot fit in the
/// model's window. `prompt + max == window` is allowed; one more is not.
pub fn validate_context(
    model: &str,
    prompt_tokens: u64,
    max_output_tokens: Option<u64>,
) -> Result<(), ApiError> {
    let window = context_window(model);
    let requested = prompt_tokens + max_output_tokens.unwrap_or(0);
    if requested > window {
        return Err(ApiError::ContextLengthExceeded(format!(
            "This model's maximum context length is {} tokens. However, you requested {} tokens \
             ({} in the messages, {} in the completion). Please reduce the length of the messages \
             or completion.",
            window,
            requested,
            prompt_tokens,
            max_output_tokens.unwrap_or(0),
        )));
    }
    Ok(())
}
