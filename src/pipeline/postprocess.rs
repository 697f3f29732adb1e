//! Post-processing: turn a raw VLM reply into region analyses.
//!
//! Models are asked for a bare JSON array but still wrap it in fences, put
//! a sentence in front of it or sprinkle invisible characters. The cleanup
//! here is deterministic and tolerant about presentation. It is strict
//! about shape: anything that is not a JSON array of objects (or nulls) is a
//! [`ClassificationError::MalformedResponse`].
//!
//! Field values are read leniently: unknown roles map to `other`, weights
//! may be numbers or names, colours must be hex. A field that cannot be read
//! is left unset so the detection default survives.

use crate::error::ClassificationError;
use crate::pipeline::classify::RegionAnalysis;
use crate::region::{FontWeight, Rgb, Role, TextCase};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// Parse a classifier reply into one optional analysis per element.
///
/// Rules (applied in order):
/// 1. Strip outer code fences
/// 2. Strip invisible Unicode (BOM, zero-width spaces)
/// 3. Extract the outermost JSON array
/// 4. Read each element: object → analysis, `null` → unclassified
pub fn parse_analyses(raw: &str) -> Result<Vec<Option<RegionAnalysis>>, ClassificationError> {
    let s = strip_code_fences(raw);
    let s = remove_invisible_chars(&s);
    let array = extract_json_array(&s).ok_or_else(|| ClassificationError::MalformedResponse {
        detail: format!("no JSON array in reply: {}", preview(raw)),
    })?;

    let value: Value = serde_json::from_str(array).map_err(|e| ClassificationError::MalformedResponse {
        detail: format!("invalid JSON: {e}"),
    })?;
    let Value::Array(items) = value else {
        return Err(ClassificationError::MalformedResponse {
            detail: "reply is not a JSON array".into(),
        });
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Null => Ok(None),
            Value::Object(map) => Ok(Some(analysis_from_object(&map))),
            other => Err(ClassificationError::MalformedResponse {
                detail: format!("element {i} is not an object: {other}"),
            }),
        })
        .collect()
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*)\n```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Strip invisible characters ───────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{00AD}'))
        .collect()
}

// ── Rule 3: Extract the JSON array ───────────────────────────────────────────

static RE_JSON_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[.*\]").unwrap());

fn extract_json_array(input: &str) -> Option<&str> {
    RE_JSON_ARRAY.find(input).map(|m| m.as_str())
}

// ── Rule 4: Lenient field reading ────────────────────────────────────────────

fn analysis_from_object(map: &Map<String, Value>) -> RegionAnalysis {
    let str_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let role = str_field(&["role"]).map(Role::parse_lenient).unwrap_or_default();
    let analysis = RegionAnalysis {
        role,
        text: map.get("text").and_then(Value::as_str).map(str::to_string),
        font: str_field(&["font", "primary_font", "font_family"]).map(str::to_string),
        weight: ["font_weight", "weight"]
            .iter()
            .find_map(|k| map.get(*k))
            .and_then(FontWeight::parse_lenient),
        color: str_field(&["text_color", "color"]).and_then(Rgb::from_hex),
        text_case: str_field(&["text_case", "case"]).map(TextCase::parse_lenient),
    };
    debug!("Parsed analysis: {:?}", analysis);
    analysis
}

fn preview(s: &str) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(80) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
