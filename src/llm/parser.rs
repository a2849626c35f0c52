//! Response parsing for structured LLM output.
//!
//! Models rarely return bare JSON: it arrives fenced, prefixed with prose,
//! or embedded mid-sentence. The extractor tries fenced code blocks first,
//! then a progressive balanced-brace scan for objects, then arrays.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Structured-output validation failure, carrying the raw content and
/// validator diagnostics.
#[derive(Debug, Error)]
#[error("failed to parse structured response: {reason}")]
pub struct ResponseParseError {
    pub reason: String,
    pub raw: String,
    pub diagnostics: Vec<String>,
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence regex is valid")
    })
}

/// Extract the first JSON object or array substring from free-form text.
///
/// Order: fenced code block (optionally labeled `json`), balanced-brace
/// object scan, balanced-bracket array scan. Returns the exact substring
/// that parses as JSON.
pub fn extract_json(content: &str) -> Option<String> {
    if let Some(captures) = fence_regex().captures(content) {
        let fenced = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if serde_json::from_str::<Value>(fenced).is_ok() {
            return Some(fenced.to_string());
        }
    }

    balanced_scan(content, '{', '}').or_else(|| balanced_scan(content, '[', ']'))
}

/// Progressive scan: from each opening delimiter, find the balanced close
/// (string- and escape-aware) and return the first candidate that parses.
fn balanced_scan(content: &str, open: char, close: char) -> Option<String> {
    let bytes: Vec<char> = content.chars().collect();

    for start in 0..bytes.len() {
        if bytes[start] != open {
            continue;
        }

        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (offset, &c) in bytes[start..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                c if c == open && !in_string => depth += 1,
                c if c == close && !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate: String = bytes[start..=start + offset].iter().collect();
                        if serde_json::from_str::<Value>(&candidate).is_ok() {
                            return Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    None
}

/// Parse LLM output, optionally validating against a JSON Schema.
///
/// With no schema the raw string is returned untouched. With a schema the
/// first embedded JSON value is extracted, decoded, and validated.
pub fn parse_response(content: &str, schema: Option<&Value>) -> Result<Value, ResponseParseError> {
    let Some(schema) = schema else {
        return Ok(Value::String(content.to_string()));
    };

    let raw = extract_json(content).ok_or_else(|| ResponseParseError {
        reason: "no JSON value found in response".to_string(),
        raw: content.to_string(),
        diagnostics: Vec::new(),
    })?;

    let value: Value = serde_json::from_str(&raw).map_err(|e| ResponseParseError {
        reason: format!("extracted candidate is not valid JSON: {}", e),
        raw: content.to_string(),
        diagnostics: Vec::new(),
    })?;

    let validator = jsonschema::validator_for(schema).map_err(|e| ResponseParseError {
        reason: format!("invalid return schema: {}", e),
        raw: content.to_string(),
        diagnostics: Vec::new(),
    })?;

    let diagnostics: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| e.to_string())
        .collect();
    if !diagnostics.is_empty() {
        return Err(ResponseParseError {
            reason: "response does not match the return schema".to_string(),
            raw: content.to_string(),
            diagnostics,
        });
    }

    Ok(value)
}
