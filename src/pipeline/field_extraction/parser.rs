use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::types::RawExtraction;
use super::ExtractionError;

/// Raw output kept on a malformed-response error, for diagnostics.
pub const RAW_EXCERPT_CHARS: usize = 500;

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Parse a model response into a `field key -> raw entry` map.
///
/// Recovery order: the first top-level JSON object found by brace-depth
/// scanning, then the contents of a fenced code block, then the whole
/// trimmed response. Each candidate is also retried with trailing commas
/// removed. Only JSON objects are accepted.
pub fn parse_extraction_response(response: &str) -> Result<RawExtraction, ExtractionError> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err(malformed("Empty model response", response));
    }

    let candidates = top_level_objects(trimmed)
        .into_iter()
        .chain(fenced_block(trimmed))
        .chain(std::iter::once(trimmed));

    for candidate in candidates {
        if let Some(map) = parse_object(candidate) {
            return Ok(map);
        }
    }

    Err(malformed("No parseable JSON object in model response", response))
}

fn parse_object(candidate: &str) -> Option<RawExtraction> {
    let as_object = |text: &str| match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };

    as_object(candidate).or_else(|| {
        let cleaned = TRAILING_COMMA.replace_all(candidate, "$1");
        as_object(&cleaned)
    })
}

/// Every balanced top-level `{...}` span, in order of appearance.
///
/// Braces inside JSON string literals (including escaped quotes) are ignored
/// once scanning is inside an object.
fn top_level_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if depth > 0 && in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    spans
}

/// Contents of the first fenced code block (```json or bare ```).
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n').unwrap_or(0);
    let (label, body) = after_fence.split_at(body_start);
    let body = if label.trim().chars().all(|c| c.is_ascii_alphanumeric()) {
        body
    } else {
        after_fence
    };
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Truncate on a char boundary for inclusion in error messages.
pub fn excerpt(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

fn malformed(message: &str, raw: &str) -> ExtractionError {
    ExtractionError::Malformed {
        message: message.to_string(),
        raw_excerpt: excerpt(raw, RAW_EXCERPT_CHARS),
    }
}
