//! Deterministic repair rules for failed sandbox attempts.
//!
//! Each rule recognizes one error message and rewrites the payload. Errors
//! that no payload edit can cure make the whole failure unfixable.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static ESCAPING_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^path escapes workdir: (.+)$").expect("valid regex"));
static UNKNOWN_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"no such field: (\S+)").expect("valid regex"));
static MISSING_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^missing payload field '(\w+)'$").expect("valid regex"));

const UNFIXABLE_MARKERS: &[&str] = &[
    "permission denied",
    "resource not found",
    "timed out",
    "out-of-scope access",
    "unsupported task type",
];

/// Payload aliases accepted for a missing field, in preference order.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("content", &["contents", "body", "text", "data"]),
    ("resource", &["filename", "file", "target"]),
    ("updates", &["changes", "set", "values"]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub payload: Value,
    pub note: String,
}

fn file_name(raw: &str) -> Option<String> {
    raw.rsplit(['/', '\\'])
        .find(|part| !part.is_empty() && *part != "." && *part != "..")
        .map(str::to_string)
}

fn rename_alias(payload: &mut Map<String, Value>, field: &str) -> Option<String> {
    let (_, aliases) = FIELD_ALIASES.iter().find(|(name, _)| *name == field)?;
    let alias = aliases.iter().find(|alias| payload.contains_key(**alias))?;
    let value = payload.remove(*alias)?;
    payload.insert(field.to_string(), value);
    Some(format!("renamed '{alias}' to '{field}'"))
}

fn apply_rule(payload: &mut Map<String, Value>, error: &str) -> Option<String> {
    if let Some(caps) = ESCAPING_PATH_RE.captures(error) {
        let original = caps.get(1)?.as_str();
        let name = file_name(original)?;
        for key in ["resource", "path", "file_path"] {
            if payload.get(key).and_then(Value::as_str) == Some(original) {
                payload.insert(key.to_string(), Value::String(name.clone()));
                return Some(format!("rewrote escaping path '{original}' to '{name}'"));
            }
        }
        return None;
    }

    if let Some(caps) = UNKNOWN_FIELD_RE.captures(error) {
        let field = caps.get(1)?.as_str();
        let fields = payload.get_mut("fields")?.as_array_mut()?;
        let before = fields.len();
        fields.retain(|f| f.as_str() != Some(field));
        return (fields.len() < before).then(|| format!("dropped unknown field '{field}'"));
    }

    if let Some(caps) = MISSING_FIELD_RE.captures(error) {
        let field = caps.get(1)?.as_str();
        if let Some(note) = rename_alias(payload, field) {
            return Some(note);
        }
        if field == "content" {
            payload.insert("content".to_string(), Value::String(String::new()));
            return Some("set missing 'content' to an empty string".to_string());
        }
    }
    None
}

/// Propose a revised payload for a failed attempt, or `None` if unfixable.
pub fn propose_fix(payload: &Value, errors: &[String]) -> Option<Fix> {
    let lowered: Vec<String> = errors.iter().map(|e| e.to_ascii_lowercase()).collect();
    if lowered
        .iter()
        .any(|e| UNFIXABLE_MARKERS.iter().any(|marker| e.contains(marker)))
    {
        return None;
    }

    let mut revised = payload.as_object()?.clone();
    let notes: Vec<String> = errors
        .iter()
        .filter_map(|error| apply_rule(&mut revised, error))
        .collect();
    if notes.is_empty() {
        return None;
    }
    Some(Fix {
        payload: Value::Object(revised),
        note: notes.join("; "),
    })
}
