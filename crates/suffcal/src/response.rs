//! Parsing of model output into JSON.
//!
//! Small models wrap their answer in prose, use single quotes, leave trailing
//! commas or stop in the middle of an object. Each repair step is tried in
//! turn until one yields a JSON object or array.

use serde_json::Value;

use crate::error::{Error, Result};

/// Parse a model answer into a JSON object or array
pub fn parse_ai_response(text: &str) -> Result<Value> {
    let cleaned = default_cleanup(text.trim());
    if let Some(value) = parse_structured(&cleaned) {
        return Ok(value);
    }

    match extract_json_substring(&cleaned) {
        Some(candidate) => {
            let candidate = default_cleanup(candidate);
            if let Some(value) = parse_structured(&candidate) {
                return Ok(value);
            }
            let completed = default_cleanup(&complete_truncated_json(&candidate));
            if let Some(value) = parse_structured(&completed) {
                return Ok(value);
            }
        }
        None => {
            // Output cut off before the first bracket was closed
            if let Some(start) = cleaned.find(['{', '[']) {
                let completed = default_cleanup(&complete_truncated_json(&cleaned[start..]));
                if let Some(value) = parse_structured(&completed) {
                    tracing::debug!("Recovered truncated model output");
                    return Ok(value);
                }
            }
        }
    }

    Err(Error::UnparsableResponse(text.to_string()))
}

fn parse_structured(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// Normalise the most common deviations from strict JSON
pub fn default_cleanup(text: &str) -> String {
    text.replace('\n', " ")
        .replace('\'', "\"")
        .replace(",}", "}")
        .replace(",]", "]")
}

/// First balanced `{...}` or `[...]` in the text.
///
/// Only brackets of the opening kind are counted, so a `[` inside an object
/// does not affect where the object ends.
pub fn extract_json_substring(text: &str) -> Option<&str> {
    for (start, open) in text.char_indices() {
        let close = match open {
            '{' => '}',
            '[' => ']',
            _ => continue,
        };

        let mut depth = 0usize;
        for (offset, ch) in text[start..].char_indices() {
            if ch == open {
                depth += 1;
            } else if ch == close {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
        }
    }
    None
}

/// Append the closing braces and brackets a truncated answer is missing
pub fn complete_truncated_json(text: &str) -> String {
    let count = |c: char| text.chars().filter(|&x| x == c).count();
    let missing_curly = count('{').saturating_sub(count('}'));
    let missing_square = count('[').saturating_sub(count(']'));

    let mut completed = String::with_capacity(text.len() + missing_curly + missing_square);
    completed.push_str(text);
    completed.extend(std::iter::repeat('}').take(missing_curly));
    completed.extend(std::iter::repeat(']').take(missing_square));
    completed
}
