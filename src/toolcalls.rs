//! Tool-call synthesis under the `tool_choice` policy.
//!
//! Decides which declared tools to invoke and generates arguments matching
//! each function's parameter schema. The streaming engine splits each call
//! across deltas per the OpenAI wire format: a header delta carrying
//! `id`/`type`/`function.name`, then argument fragments.

use rand::Rng;

use crate::error::ApiError;
use crate::openai::{ChatCompletionRequest, ToolChoice, ToolDefinition};
use crate::schema;

/// Upper bound on simultaneous calls when `parallel_tool_calls` is on.
const MAX_PARALLEL_CALLS: usize = 3;

/// Size of each streamed argument fragment, in bytes of JSON text.
pub const ARGUMENT_CHUNK_BYTES: usize = 24;

/// What the response should contain for a request that declares tools.
#[derive(Debug, Clone)]
pub enum ToolPlan {
    /// Emit ordinary text content.
    Text,
    /// Emit these calls and finish with `finish_reason: "tool_calls"`.
    Calls(Vec<PlannedCall>),
}

#[derive(Debug, Clone)]
pub struct PlannedCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object conforming to the tool's schema.
    pub arguments: String,
}

/// Resolve the `tool_choice` policy for this request.
pub fn plan<R: Rng + ?Sized>(
    rng: &mut R,
    request: &ChatCompletionRequest,
) -> Result<ToolPlan, ApiError> {
    let tools = request.tools.as_deref().unwrap_or(&[]);

    let choice = match &request.tool_choice {
        None => "auto".to_string(),
        Some(ToolChoice::Mode(mode)) => mode.clone(),
        Some(ToolChoice::Function { function, .. }) => {
            let tool = tools
                .iter()
                .find(|t| t.function.name == function.name)
                .ok_or_else(|| {
                    ApiError::InvalidRequest(format!(
                        "tool_choice names function '{}' but no such tool is declared",
                        function.name
                    ))
                })?;
            return Ok(ToolPlan::Calls(vec![synthesize_call(rng, tool)]));
        }
    };

    match choice.as_str() {
        "none" => Ok(ToolPlan::Text),
        "required" => {
            if tools.is_empty() {
                return Err(ApiError::InvalidRequest(
                    "tool_choice is 'required' but no tools were declared".to_string(),
                ));
            }
            Ok(ToolPlan::Calls(pick_calls(rng, request, tools)))
        }
        "auto" => {
            if tools.is_empty() {
                Ok(ToolPlan::Text)
            } else {
                // Deterministic policy: auto always calls when tools exist,
                // which keeps test suites built on this simulator stable.
                Ok(ToolPlan::Calls(pick_calls(rng, request, tools)))
            }
        }
        other => Err(ApiError::InvalidRequest(format!(
            "unrecognized tool_choice '{}'",
            other
        ))),
    }
}

fn pick_calls<R: Rng + ?Sized>(
    rng: &mut R,
    request: &ChatCompletionRequest,
    tools: &[ToolDefinition],
) -> Vec<PlannedCall> {
    let parallel = request.parallel_tool_calls.unwrap_or(true);
    let count = if parallel {
        tools.len().min(MAX_PARALLEL_CALLS)
    } else {
        1
    };
    tools
        .iter()
        .take(count)
        .map(|tool| synthesize_call(rng, tool))
        .collect()
}

fn synthesize_call<R: Rng + ?Sized>(rng: &mut R, tool: &ToolDefinition) -> PlannedCall {
    let arguments = match &tool.function.parameters {
        Some(params) => schema::generate(rng, params).to_string(),
        None => "{}".to_string(),
    };
    PlannedCall {
        id: crate::openai::tool_call_id(),
        name: tool.function.name.clone(),
        arguments,
    }
}

/// Split a JSON argument string into streamable fragments whose
/// concatenation reproduces the original exactly.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    if arguments.is_empty() {
        return vec![String::new()];
    }
    let bytes = arguments.as_bytes();
    let mut fragments = Vec::with_capacity(bytes.len() / ARGUMENT_CHUNK_BYTES + 1);
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + ARGUMENT_CHUNK_BYTES).min(bytes.len());
        // Keep UTF-8 boundaries intact.
        while end < bytes.len() && !arguments.is_char_boundary(end) {
            end += 1;
        }
        fragments.push(arguments[start..end].to_string());
        start = end;
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(extra: serde_json::Value) -> ChatCompletionRequest {
        let mut base = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Get weather in Boston and NYC"}],
            "tools": [
                {"type": "function", "function": {"name": "get_weather", "parameters": {
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }}},
                {"type": "function", "function": {"name": "get_time", "parameters": {
                    "type": "object",
                    "properties": {"tz": {"type": "string"}},
                    "required": ["tz"]
                }}}
            ]
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn none_means_text() {
        let req = request(serde_json::json!({"tool_choice": "none"}));
        let plan = plan(&mut rand::rng(), &req).unwrap();
        assert!(matches!(plan, ToolPlan::Text));
    }

    #[test]
    fn auto_with_tools_calls() {
        let req = request(serde_json::json!({}));
        match plan(&mut rand::rng(), &req).unwrap() {
            ToolPlan::Calls(calls) => {
                assert_eq!(calls.len(), 2);
                assert_ne!(calls[0].id, calls[1].id);
            }
            ToolPlan::Text => panic!("expected calls"),
        }
    }

    #[test]
    fn auto_without_tools_is_text() {
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "m", "messages": [], "tool_choice": "auto"
        }))
        .unwrap();
        assert!(matches!(plan(&mut rand::rng(), &req).unwrap(), ToolPlan::Text));
    }

    #[test]
    fn required_without_tools_is_invalid() {
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "m", "messages": [], "tool_choice": "required"
        }))
        .unwrap();
        assert!(plan(&mut rand::rng(), &req).is_err());
    }

    #[test]
    fn serial_mode_emits_one_call() {
        let req = request(serde_json::json!({"parallel_tool_calls": false}));
        match plan(&mut rand::rng(), &req).unwrap() {
            ToolPlan::Calls(calls) => assert_eq!(calls.len(), 1),
            ToolPlan::Text => panic!("expected calls"),
        }
    }

    #[test]
    fn pinned_function_called_exactly_once() {
        let req = request(serde_json::json!({
            "tool_choice": {"type": "function", "function": {"name": "get_time"}}
        }));
        match plan(&mut rand::rng(), &req).unwrap() {
            ToolPlan::Calls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "get_time");
            }
            ToolPlan::Text => panic!("expected calls"),
        }
    }

    #[test]
    fn pinned_unknown_function_rejected() {
        let req = request(serde_json::json!({
            "tool_choice": {"type": "function", "function": {"name": "nope"}}
        }));
        assert!(plan(&mut rand::rng(), &req).is_err());
    }

    #[test]
    fn arguments_match_schema() {
        let req = request(serde_json::json!({"tool_choice": "required"}));
        match plan(&mut rand::rng(), &req).unwrap() {
            ToolPlan::Calls(calls) => {
                for call in calls {
                    let parsed: serde_json::Value =
                        serde_json::from_str(&call.arguments).unwrap();
                    assert!(parsed.is_object());
                    // Both declared schemas have exactly one string field.
                    assert_eq!(parsed.as_object().unwrap().len(), 1);
                }
            }
            ToolPlan::Text => panic!("expected calls"),
        }
    }

    #[test]
    fn split_arguments_round_trips() {
        let args = r#"{"city":"Boston","unit":"celsius","days":7,"verbose":true}"#;
        let fragments = split_arguments(args);
        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), args);
    }

    #[test]
    fn split_handles_multibyte() {
        let args = r#"{"note":"ünïcödé ünïcödé ünïcödé ünïcödé"}"#;
        assert_eq!(split_arguments(args).concat(), args);
    }
}
