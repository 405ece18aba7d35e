//! Structured-output support: strict-mode JSON-schema validation and
//! generation of values that conform to a caller-supplied schema.
//!
//! Generation walks the schema recursively. Enum picks are keyed off the
//! property path so the same schema yields the same choices across calls;
//! free-form scalars are random within their declared bounds.

use rand::Rng;
use serde_json::{json, Map, Value};

use crate::error::ApiError;
use crate::textgen;

/// Enforce the strict-mode subset on a `json_schema` response format:
///
/// 1. root `type` must be `"object"`
/// 2. root and every nested object carry `additionalProperties: false`
/// 3. every key in `properties` appears in `required`
/// 4. `anyOf` is not allowed at the root
///
/// (The request-level `parallel_tool_calls: false` rule is checked by the
/// handler, since it lives outside the schema.)
pub fn validate_strict(schema: &Value) -> Result<(), ApiError> {
    if schema.get("anyOf").is_some() {
        return Err(invalid("'anyOf' is not permitted at the schema root in strict mode"));
    }
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(invalid("strict mode requires the root schema type to be 'object'"));
    }
    validate_object_tree(schema, "$")
}

fn invalid(message: &str) -> ApiError {
    ApiError::InvalidRequest(message.to_string())
}

fn validate_object_tree(schema: &Value, path: &str) -> Result<(), ApiError> {
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            if schema.get("additionalProperties") != Some(&Value::Bool(false)) {
                return Err(invalid(&format!(
                    "strict mode requires 'additionalProperties: false' on object at {}",
                    path
                )));
            }

            let properties = schema
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let required: Vec<&str> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();

            for key in properties.keys() {
                if !required.contains(&key.as_str()) {
                    return Err(invalid(&format!(
                        "strict mode requires every property to be listed in 'required'; \
                         '{}' at {} is missing",
                        key, path
                    )));
                }
            }

            for (key, sub) in &properties {
                validate_object_tree(sub, &format!("{}.{}", path, key))?;
            }
            Ok(())
        }
        Some("array") => match schema.get("items") {
            Some(items) => validate_object_tree(items, &format!("{}[]", path)),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Generate a value conforming to `schema`. Works for any reasonable schema,
/// strict or not; unknown constructs degrade to a plausible scalar.
pub fn generate<R: Rng + ?Sized>(rng: &mut R, schema: &Value) -> Value {
    generate_at(rng, schema, "$")
}

fn generate_at<R: Rng + ?Sized>(rng: &mut R, schema: &Value, path: &str) -> Value {
    if let Some(constant) = schema.get("const") {
        return constant.clone();
    }
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.is_empty() {
            // Path-keyed pick: stable for a given schema shape.
            return options[path_hash(path) as usize % options.len()].clone();
        }
    }
    if let Some(variants) = schema
        .get("anyOf")
        .or_else(|| schema.get("oneOf"))
        .and_then(Value::as_array)
    {
        if let Some(first) = variants.first() {
            return generate_at(rng, first, path);
        }
    }

    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            let mut out = Map::new();
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (key, sub) in properties {
                    out.insert(
                        key.clone(),
                        generate_at(rng, sub, &format!("{}.{}", path, key)),
                    );
                }
            }
            Value::Object(out)
        }
        Some("array") => {
            let min = schema
                .get("minItems")
                .and_then(Value::as_u64)
                .unwrap_or(1) as usize;
            let max = schema
                .get("maxItems")
                .and_then(Value::as_u64)
                .map(|m| m as usize)
                .unwrap_or(min + 3)
                .min(min + 3)
                .max(min);
            let len = rng.random_range(min..=max);
            let items = schema.get("items").cloned().unwrap_or(json!({}));
            (0..len)
                .map(|i| generate_at(rng, &items, &format!("{}[{}]", path, i)))
                .collect()
        }
        Some("string") => Value::String(generate_string(rng, schema, path)),
        Some("integer") => {
            let (low, high) = integer_bounds(schema);
            json!(rng.random_range(low..=high))
        }
        Some("number") => {
            let (low, high) = number_bounds(schema);
            json!(rng.random_range(low..=high))
        }
        Some("boolean") => json!(rng.random_bool(0.5)),
        Some("null") => Value::Null,
        _ => Value::String(textgen::random_word(rng, 3, 12)),
    }
}

fn generate_string<R: Rng + ?Sized>(rng: &mut R, schema: &Value, path: &str) -> String {
    if let Some(format) = schema.get("format").and_then(Value::as_str) {
        return format_value(rng, format, path);
    }
    let min_len = schema
        .get("minLength")
        .and_then(Value::as_u64)
        .unwrap_or(3) as usize;
    let max_len = schema
        .get("maxLength")
        .and_then(Value::as_u64)
        .map(|m| m as usize)
        .unwrap_or(min_len.max(3) + 9)
        .max(min_len);
    textgen::random_word(rng, min_len, max_len)
}

fn format_value<R: Rng + ?Sized>(rng: &mut R, format: &str, path: &str) -> String {
    match format {
        "email" => format!("{}@example.com", textgen::random_word(rng, 4, 10)),
        "date-time" => chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "date" => chrono::Utc::now().format("%Y-%m-%d").to_string(),
        "time" => chrono::Utc::now().format("%H:%M:%S").to_string(),
        "uuid" => uuid::Uuid::new_v4().to_string(),
        "uri" => format!("https://example.com/{}", textgen::random_word(rng, 4, 10)),
        "hostname" => format!("{}.example.com", textgen::random_word(rng, 4, 10)),
        "ipv4" => format!(
            "{}.{}.{}.{}",
            rng.random_range(1..=223u8),
            rng.random_range(0..=255u8),
            rng.random_range(0..=255u8),
            rng.random_range(1..=254u8)
        ),
        "ipv6" => {
            let h = path_hash(path);
            format!(
                "2001:db8:{:x}:{:x}::{:x}",
                (h >> 32) & 0xffff,
                (h >> 16) & 0xffff,
                h & 0xffff
            )
        }
        _ => textgen::random_word(rng, 3, 12),
    }
}

fn integer_bounds(schema: &Value) -> (i64, i64) {
    let mut low = schema.get("minimum").and_then(Value::as_i64).unwrap_or(0);
    let mut high = schema
        .get("maximum")
        .and_then(Value::as_i64)
        .unwrap_or(1000);
    if let Some(excl) = schema.get("exclusiveMinimum").and_then(Value::as_i64) {
        low = low.max(excl + 1);
    }
    if let Some(excl) = schema.get("exclusiveMaximum").and_then(Value::as_i64) {
        high = high.min(excl - 1);
    }
    if low > high {
        high = low;
    }
    (low, high)
}

fn number_bounds(schema: &Value) -> (f64, f64) {
    let mut low = schema.get("minimum").and_then(Value::as_f64).unwrap_or(0.0);
    let mut high = schema.get("maximum").and_then(Value::as_f64).unwrap_or(1.0);
    if let Some(excl) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
        low = low.max(excl + f64::EPSILON);
    }
    if let Some(excl) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
        high = high.min(excl - f64::EPSILON);
    }
    if low > high {
        high = low;
    }
    (low, high)
}

fn path_hash(path: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in path.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}
