//! Best-effort JSON extraction from noisy CLI output, plus the small
//! normalizers (status vocabulary, id extraction, csv/plan parsing) that
//! keep shape-sniffing out of the control-flow code.
//!
//! The wrapped CLI is not guaranteed to emit clean single-line JSON, so
//! [`parse_json_payload`] runs three tiers: whole-text parse, then the
//! longest streaming decode starting at any `{`/`[`, then the last
//! JSON-looking line.

use crate::core::error::BinderyError;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

const UUID_PATTERN: &str =
    r"\b([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\b";

/// Extract one JSON value from raw command output.
pub fn parse_json_payload(raw: &str) -> Result<Value, BinderyError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(BinderyError::MalformedOutput(
            "no JSON found in empty output".to_string(),
        ));
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    // Embedded JSON mid-log: try a streaming decode from every `{`/`[`
    // offset and keep the decode that consumes the most characters.
    let mut best: Option<(usize, Value)> = None;
    for (index, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[index..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            let end = index + stream.byte_offset();
            if best.as_ref().map(|(e, _)| end > *e).unwrap_or(true) {
                best = Some((end, value));
            }
        }
    }
    if let Some((_, value)) = best {
        return Ok(value);
    }

    for line in text.lines().rev() {
        let line = line.trim();
        if line.starts_with('{') || line.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(line) {
                return Ok(value);
            }
        }
    }

    Err(BinderyError::MalformedOutput(format!(
        "no JSON object found in output: {}",
        crate::core::exec::tail(text, 200)
    )))
}

/// Like [`parse_json_payload`] but requires a JSON object.
pub fn parse_json_object(raw: &str) -> Result<serde_json::Map<String, Value>, BinderyError> {
    match parse_json_payload(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(BinderyError::MalformedOutput(format!(
            "expected JSON object, got {}",
            kind_name(&other)
        ))),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Normalize the CLI's heterogeneous list shapes into a row list. Rows may
/// live at the top level, under one of `keys` in preference order, or inside
/// whatever list-valued field turns up first.
pub fn rows_from_any(payload: &Value, keys: &[&str]) -> Vec<serde_json::Map<String, Value>> {
    let rows_of = |value: &Value| -> Vec<serde_json::Map<String, Value>> {
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default()
    };

    if payload.is_array() {
        return rows_of(payload);
    }

    if let Some(map) = payload.as_object() {
        for key in keys {
            if let Some(value) = map.get(*key) {
                if value.is_array() {
                    return rows_of(value);
                }
            }
        }
        let mut gathered = Vec::new();
        for value in map.values() {
            if value.is_array() {
                gathered.extend(rows_of(value));
            }
        }
        if !gathered.is_empty() {
            return gathered;
        }
    }

    Vec::new()
}

fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn id_from_value(payload: &Value, keys: &[&str], nested: &[&str]) -> Option<String> {
    match payload {
        Value::Object(map) => {
            for key in keys {
                if let Some(id) = string_field(map, key) {
                    return Some(id);
                }
            }
            for key in nested {
                if let Some(Value::Object(block)) = map.get(*key) {
                    for id_key in keys {
                        if let Some(id) = string_field(block, id_key) {
                            return Some(id);
                        }
                    }
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| {
            item.as_object().and_then(|map| {
                keys.iter().find_map(|key| string_field(map, key))
            })
        }),
        _ => None,
    }
}

/// Pull an artifact id out of create-command output: structured JSON first,
/// then the `Artifact ID: <uuid>` line, then any bare UUID.
pub fn extract_artifact_id(raw: &str) -> Option<String> {
    if let Ok(payload) = parse_json_payload(raw) {
        if let Some(id) = id_from_value(
            &payload,
            &["artifact_id", "id"],
            &["artifact", "result", "data"],
        ) {
            return Some(id);
        }
    }

    let labeled = Regex::new(r"(?i)Artifact ID:\s*([0-9a-fA-F-]{36})").expect("valid regex");
    if let Some(caps) = labeled.captures(raw) {
        return Some(caps[1].to_string());
    }

    let uuid = Regex::new(UUID_PATTERN).expect("valid regex");
    uuid.captures(raw).map(|caps| caps[1].to_string())
}

/// Pull a source id out of `source add` output. Unlike artifacts the CLI
/// never labels these in free text, so JSON shapes only.
pub fn extract_source_id(raw: &str) -> Option<String> {
    let payload = parse_json_payload(raw).ok()?;
    id_from_value(&payload, &["id", "source_id"], &["source", "result", "data"])
}

/// Parse a notebook id from `notebook create` free-text output: an
/// `ID: <uuid>` line or any bare UUID.
pub fn parse_notebook_id_from_text(raw: &str) -> Option<String> {
    let labeled = Regex::new(r"\bID:\s*([0-9a-fA-F-]{36})\b").expect("valid regex");
    if let Some(caps) = labeled.captures(raw) {
        return Some(caps[1].to_string());
    }
    let uuid = Regex::new(UUID_PATTERN).expect("valid regex");
    uuid.captures(raw).map(|caps| caps[1].to_string())
}

/// Find a notebook id anywhere inside a structured payload, breadth-first.
pub fn notebook_id_from_payload(payload: &Value) -> Option<String> {
    let mut queue = std::collections::VecDeque::from([payload]);
    while let Some(current) = queue.pop_front() {
        match current {
            Value::Object(map) => {
                for key in ["notebook_id", "notebookId", "id"] {
                    if let Some(id) = string_field(map, key) {
                        return Some(id);
                    }
                }
                queue.extend(map.values().filter(|v| v.is_object() || v.is_array()));
            }
            Value::Array(items) => {
                queue.extend(items.iter().filter(|v| v.is_object() || v.is_array()));
            }
            _ => {}
        }
    }
    None
}

/// Map raw status fields (numeric codes or free text) into the canonical
/// vocabulary: `completed`, `failed`, `in_progress`, `unknown`, or the
/// lowercased original when unrecognized.
pub fn normalize_status(raw: Option<&Value>) -> String {
    let Some(raw) = raw else {
        return "unknown".to_string();
    };
    match raw {
        Value::Null => "unknown".to_string(),
        Value::Number(n) => match n.as_i64() {
            Some(1) => "in_progress".to_string(),
            Some(3) => "completed".to_string(),
            Some(4) => "failed".to_string(),
            _ => n.to_string(),
        },
        other => {
            let text = match other {
                Value::String(s) => s.trim().to_lowercase(),
                _ => other.to_string().trim().to_lowercase(),
            };
            match text.as_str() {
                "complete" | "success" | "succeeded" => "completed".to_string(),
                "in progress" | "running" => "in_progress".to_string(),
                _ => text,
            }
        }
    }
}

/// Locate the studio row whose `id`/`artifact_id` matches.
pub fn find_row_by_id<'a>(
    rows: &'a [serde_json::Map<String, Value>],
    artifact_id: &str,
) -> Option<&'a serde_json::Map<String, Value>> {
    rows.iter().find(|row| {
        ["id", "artifact_id"]
            .iter()
            .any(|key| row.get(*key).and_then(Value::as_str) == Some(artifact_id))
    })
}

/// Split comma-separated ids; numeric tokens lose leading zeros so "03" and
/// "3" name the same chapter.
pub fn parse_csv_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            if token.chars().all(|c| c.is_ascii_digit()) {
                token
                    .parse::<u64>()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|_| token.to_string())
            } else {
                token.to_string()
            }
        })
        .collect()
}

/// Parse and alias-normalize an artifact plan, deduplicated and
/// order-preserving.
pub fn parse_plan(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in raw.split(',') {
        let token = part.trim().to_lowercase();
        if token.is_empty() {
            continue;
        }
        let normalized = match token.as_str() {
            "podcast" | "podcasts" => "audio",
            "slide" | "slide_deck" | "deck" => "slides",
            "infographics" => "infographic",
            "data_table" | "datatable" => "data-table",
            "mind_map" => "mindmap",
            other => other,
        }
        .to_string();
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

/// Parse `type:count,...` per-type budget limits; malformed parts are
/// skipped.
pub fn parse_budget_per_type(raw: &str) -> BTreeMap<String, u32> {
    let mut out = BTreeMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        let Some((key, value)) = part.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        if let Ok(limit) = value.trim().parse::<u32>() {
            out.insert(key, limit);
        }
    }
    out
}
