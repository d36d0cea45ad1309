//! Robust JSON extraction from LLM responses.
//!
//! Models return JSON wrapped in code fences, prefixed with prose, or as a
//! single object where a list was requested. The extractor tolerates all
//! of these; a response with no recoverable JSON yields a parse error the
//! pipeline treats as an empty result.

use serde_json::Value;

use crate::error::{Error, Result};

/// Strip markdown code fences, keeping the fenced body.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // Skip a language tag on the fence line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Locate the first balanced JSON array or object in `text`.
fn find_json_slice(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find(['[', '{'])?;
    let open = bytes[start];
    let close = if open == b'[' { b']' } else { b'}' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract a JSON value from a raw LLM response.
pub fn extract_json(response: &str) -> Result<Value> {
    let cleaned = strip_code_fences(response);

    // Fast path: the whole response is valid JSON.
    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return Ok(value);
    }

    // Otherwise find the first balanced array/object and ignore
    // surrounding commentary.
    let slice = find_json_slice(cleaned)
        .ok_or_else(|| Error::Parse(format!("no JSON found in response: {}", preview(response))))?;
    serde_json::from_str(slice)
        .map_err(|e| Error::Parse(format!("invalid JSON in response ({e}): {}", preview(slice))))
}

/// Extract a JSON list, wrapping a lone object into a one-element list.
pub fn extract_json_list(response: &str) -> Result<Vec<Value>> {
    match extract_json(response)? {
        Value::Array(items) => Ok(items),
        Value::Object(obj) => Ok(vec![Value::Object(obj)]),
        other => Err(Error::Parse(format!(
            "expected JSON list, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}
