//! Forbidden-character screening for request payloads and free text.
//!
//! This is a second line of defense: executors still apply their own
//! allowlists before anything reaches a shell wrapper. Anything that could
//! chain, substitute or redirect a command is refused here, as are control
//! characters that could forge extra lines in downstream logs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::ApprovalError;

static FORBIDDEN_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[;&|`$<>\\\x00\r\n]").unwrap());

/// Nesting limit for payload objects/arrays.
const MAX_DEPTH: usize = 16;

/// Maximum length of a free-text field, in characters.
pub const MAX_TEXT_LEN: usize = 4096;

/// Validate a free-text field such as `reason` or `comment`.
pub fn check_text(field: &str, text: &str) -> Result<(), ApprovalError> {
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(ApprovalError::Validation(format!(
            "{} exceeds {} characters",
            field, MAX_TEXT_LEN
        )));
    }
    if let Some(m) = FORBIDDEN_CHARS.find(text) {
        return Err(ApprovalError::Validation(format!(
            "{} contains forbidden character {:?}",
            field,
            m.as_str()
        )));
    }
    Ok(())
}

/// Validate every key and string value in a structured payload.
pub fn check_payload(payload: &Value) -> Result<(), ApprovalError> {
    check_value("payload", payload, 0)
}

fn check_value(path: &str, v: &Value, depth: usize) -> Result<(), ApprovalError> {
    if depth > MAX_DEPTH {
        return Err(ApprovalError::Validation(format!(
            "{} nests deeper than {} levels",
            path, MAX_DEPTH
        )));
    }
    match v {
        Value::String(s) => check_text(path, s),
        Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                check_value(&format!("{}[{}]", path, i), item, depth + 1)?;
            }
            Ok(())
        }
        Value::Object(obj) => {
            for (key, val) in obj {
                let child = format!("{}.{}", path, key);
                check_text(&child, key)?;
                check_value(&child, val, depth + 1)?;
            }
            Ok(())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}
