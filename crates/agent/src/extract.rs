//! Structured extraction from free-form model output.
//!
//! Models are asked for JSON but often wrap it in prose or code fences.
//! [`extract_json`] tries, in order:
//!
//! 1. the whole (trimmed) text as JSON
//! 2. the body of the first fenced block (```` ```json ```` or bare ```` ``` ````)
//! 3. the first balanced `{…}` or `[…]` span that parses, scanning
//!    string- and escape-aware so braces inside string literals don't count
//!
//! [`parse_json`] then deserializes into the target type. Missing fields are
//! an error unless the target type declares a serde default for them.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("no JSON found in model output")]
    NotFound,

    #[error("invalid JSON in model output: {0}")]
    Invalid(String),
}

/// Locate and parse the JSON value embedded in `text`.
pub fn extract_json(text: &str) -> Result<Value, ExtractError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::NotFound);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(body) = fenced_block(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(body.trim())
    {
        return Ok(value);
    }

    let mut last_error = None;
    for (start, _) in trimmed.match_indices(['{', '[']) {
        let candidate = &trimmed[start..];
        let Some(end) = balanced_end(candidate) else {
            continue;
        };
        match serde_json::from_str::<Value>(&candidate[..end]) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Err(last_error.map_or(ExtractError::NotFound, ExtractError::Invalid))
}

/// Extract and deserialize into `T`.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ExtractError> {
    let value = extract_json(text)?;
    serde_json::from_value(value).map_err(|e| ExtractError::Invalid(e.to_string()))
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    // Skip the info string ("json", "JSON", ...) up to the end of the line.
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Byte length of the balanced span at the start of `text`, which must begin
/// with `{` or `[`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.pop() != Some(c) {
                    return None;
                }
                if closers.is_empty() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
