//! Run manifest model and its persistence: a schema-versioned JSON document
//! rewritten in full after every stage, paired with an append-only event
//! log. The manifest reflects current state, the event log reflects history.

use crate::core::error::BinderyError;
use crate::core::state_machine::RunState;
use crate::core::time::{self, Clock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub const MANIFEST_SCHEMA_VERSION: u32 = 2;
pub const MANIFEST_FILENAME: &str = "run_manifest_v2.json";
pub const EVENTS_FILENAME: &str = "events.jsonl";

fn default_manifest_schema() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

fn value_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Notebook identity reuse policy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NotebookStrategy {
    /// Fresh notebook per run, never reused.
    #[default]
    Run,
    /// One persistent notebook per content-hash asset, reused across runs.
    Object,
    /// Run notebook is active; the object notebook is kept for caching.
    Hybrid,
}

impl NotebookStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            NotebookStrategy::Run => "run",
            NotebookStrategy::Object => "object",
            NotebookStrategy::Hybrid => "hybrid",
        }
    }

    pub fn uses_object_notebook(self) -> bool {
        matches!(self, NotebookStrategy::Object | NotebookStrategy::Hybrid)
    }

    pub fn uses_run_notebook(self) -> bool {
        matches!(self, NotebookStrategy::Run | NotebookStrategy::Hybrid)
    }
}

impl std::fmt::Display for NotebookStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterMenuItem {
    pub chapter_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub char_count: Option<i64>,
}

impl ChapterMenuItem {
    /// Lenient row decode; rows without a chapter id are dropped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let chapter_id = value_to_string(map.get("chapter_id"));
        if chapter_id.is_empty() {
            return None;
        }
        Some(ChapterMenuItem {
            chapter_id,
            title: value_to_string(map.get("title")),
            score: map.get("score").and_then(Value::as_f64),
            char_count: map.get("char_count").and_then(Value::as_i64),
        })
    }

    pub fn parse_menu(rows: Option<&Value>) -> Vec<ChapterMenuItem> {
        rows.and_then(Value::as_array)
            .map(|items| items.iter().filter_map(ChapterMenuItem::from_value).collect())
            .unwrap_or_default()
    }
}

/// One artifact creation attempt's outcome. Records are never mutated after
/// creation; corrections are new records.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ArtifactRecord {
    pub artifact_type: String,
    pub status: String,
    #[serde(default)]
    pub artifact_id: String,
    #[serde(default)]
    pub chapter_id: String,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub detail: serde_json::Map<String, Value>,
}

const ARTIFACT_ALIAS_KEYS: &[&str] = &[
    "artifact_type",
    "type",
    "status",
    "outcome",
    "artifact_id",
    "id",
    "chapter_id",
    "source_id",
    "path",
    "output_path",
    "error",
    "reason",
];

impl ArtifactRecord {
    /// Decode a loosely-shaped outcome row: alias keys are folded into the
    /// named fields, everything else lands in `detail`.
    pub fn from_value(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return ArtifactRecord {
                artifact_type: "unknown".to_string(),
                status: "unknown".to_string(),
                ..ArtifactRecord::default()
            };
        };

        let first = |keys: &[&str]| -> String {
            keys.iter()
                .map(|k| value_to_string(map.get(*k)))
                .find(|v| !v.is_empty())
                .unwrap_or_default()
        };

        let mut artifact_type = first(&["artifact_type", "type"]);
        if artifact_type.is_empty() {
            artifact_type = "unknown".to_string();
        }
        let mut status = first(&["status", "outcome"]);
        if status.is_empty() {
            status = "unknown".to_string();
        }

        let detail: serde_json::Map<String, Value> = map
            .iter()
            .filter(|(key, _)| !ARTIFACT_ALIAS_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        ArtifactRecord {
            artifact_type,
            status,
            artifact_id: first(&["artifact_id", "id"]),
            chapter_id: first(&["chapter_id"]),
            source_id: first(&["source_id"]),
            path: first(&["path", "output_path"]),
            error: first(&["error", "reason"]),
            detail,
        }
    }
}

/// One orchestration run's full state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default = "default_manifest_schema")]
    pub schema_version: u32,
    pub run_id: String,
    #[serde(default)]
    pub status: RunState,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub workspace_root: String,
    #[serde(default)]
    pub book_title: String,
    #[serde(default)]
    pub notebook_id: String,
    #[serde(default)]
    pub notebook_strategy: NotebookStrategy,
    #[serde(default)]
    pub object_notebook_id: String,
    #[serde(default)]
    pub run_notebook_id: String,
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default)]
    pub ranked_json: String,
    #[serde(default)]
    pub selected_chapter_ids: Vec<String>,
    #[serde(default)]
    pub selected_source_ids: Vec<String>,
    #[serde(default)]
    pub source_map: BTreeMap<String, String>,
    #[serde(default)]
    pub menu: Vec<ChapterMenuItem>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub stages: BTreeMap<String, Value>,
    #[serde(default)]
    pub next_action: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl RunManifest {
    pub fn new(run_id: &str, workspace_root: &str, plan: Vec<String>, clock: &dyn Clock) -> Self {
        let now = time::now_iso(clock);
        RunManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            status: RunState::Started,
            created_at: now.clone(),
            updated_at: now,
            workspace_root: workspace_root.to_string(),
            book_title: String::new(),
            notebook_id: String::new(),
            notebook_strategy: NotebookStrategy::Run,
            object_notebook_id: String::new(),
            run_notebook_id: String::new(),
            plan,
            ranked_json: String::new(),
            selected_chapter_ids: Vec::new(),
            selected_source_ids: Vec::new(),
            source_map: BTreeMap::new(),
            menu: Vec::new(),
            artifacts: Vec::new(),
            stages: BTreeMap::new(),
            next_action: String::new(),
            errors: Vec::new(),
        }
    }

    /// `updated_at` is monotonically non-decreasing; every mutation routes
    /// through here.
    pub fn touch(&mut self, clock: &dyn Clock) {
        self.updated_at = time::now_iso(clock);
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

pub fn read_manifest(path: &Path) -> Result<RunManifest, BinderyError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| BinderyError::ValidationError(format!("manifest decode: {e}")))
}

/// Full-document rewrite, touching `updated_at` first.
pub fn write_manifest(
    path: &Path,
    manifest: &mut RunManifest,
    clock: &dyn Clock,
) -> Result<(), BinderyError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    manifest.touch(clock);
    let raw = serde_json::to_string_pretty(manifest)
        .map_err(|e| BinderyError::ValidationError(format!("manifest encode: {e}")))?;
    std::fs::write(path, raw)?;
    Ok(())
}

/// Append `{ts, event, payload}` to the run event log.
pub fn append_event(
    path: &Path,
    clock: &dyn Clock,
    event: &str,
    payload: &Value,
) -> Result<(), BinderyError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let row = json!({
        "ts": time::now_iso(clock),
        "event": event,
        "payload": payload,
    });
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{row}")?;
    Ok(())
}

/// Idempotent-by-overwrite stage recording: the manifest stores the latest
/// payload under the stage name while the event log keeps every recording.
pub fn record_stage(
    manifest: &mut RunManifest,
    manifest_path: &Path,
    events_path: &Path,
    clock: &dyn Clock,
    stage: &str,
    payload: &Value,
) -> Result<(), BinderyError> {
    manifest.stages.insert(stage.to_string(), payload.clone());
    write_manifest(manifest_path, manifest, clock)?;
    append_event(events_path, clock, stage, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;

    #[test]
    fn test_artifact_record_aliases_and_detail() {
        let record = ArtifactRecord::from_value(&json!({
            "type": "slides",
            "outcome": "completed",
            "id": "art-1",
            "output_path": "/tmp/x.pdf",
            "reason": "",
            "extra_field": 42,
        }));
        assert_eq!(record.artifact_type, "slides");
        assert_eq!(record.status, "completed");
        assert_eq!(record.artifact_id, "art-1");
        assert_eq!(record.path, "/tmp/x.pdf");
        assert_eq!(record.detail["extra_field"], json!(42));
        assert!(!record.detail.contains_key("output_path"));
    }

    #[test]
    fn test_artifact_record_defaults_to_unknown() {
        let record = ArtifactRecord::from_value(&json!({}));
        assert_eq!(record.artifact_type, "unknown");
        assert_eq!(record.status, "unknown");
    }

    #[test]
    fn test_menu_rows_drop_missing_chapter_id() {
        let rows = json!([
            {"chapter_id": "3", "title": "Three", "score": 0.8},
            {"title": "no id"},
            {"chapter_id": 7, "char_count": 1200},
        ]);
        let menu = ChapterMenuItem::parse_menu(Some(&rows));
        assert_eq!(menu.len(), 2);
        assert_eq!(menu[0].chapter_id, "3");
        assert_eq!(menu[1].chapter_id, "7");
        assert_eq!(menu[1].char_count, Some(1200));
    }

    #[test]
    fn test_manifest_round_trip() {
        let clock = SystemClock;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join(MANIFEST_FILENAME);

        let mut manifest = RunManifest::new(
            "bindery-test",
            "/tmp/ws",
            vec!["slides".to_string()],
            &clock,
        );
        manifest.source_map.insert("1".to_string(), "src-a".to_string());
        write_manifest(&path, &mut manifest, &clock).unwrap();

        let loaded = read_manifest(&path).unwrap();
        assert_eq!(loaded.run_id, "bindery-test");
        assert_eq!(loaded.schema_version, MANIFEST_SCHEMA_VERSION);
        assert_eq!(loaded.status, RunState::Started);
        assert_eq!(loaded.source_map["1"], "src-a");
    }

    #[test]
    fn test_record_stage_overwrites_manifest_appends_events() {
        let clock = SystemClock;
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join(MANIFEST_FILENAME);
        let events_path = dir.path().join(EVENTS_FILENAME);

        let mut manifest = RunManifest::new("bindery-test", "/tmp/ws", vec![], &clock);
        record_stage(
            &mut manifest,
            &manifest_path,
            &events_path,
            &clock,
            "prepare",
            &json!({"status": "ok", "try": 1}),
        )
        .unwrap();
        record_stage(
            &mut manifest,
            &manifest_path,
            &events_path,
            &clock,
            "prepare",
            &json!({"status": "ok", "try": 2}),
        )
        .unwrap();

        assert_eq!(manifest.stages["prepare"]["try"], json!(2));
        let events = std::fs::read_to_string(&events_path).unwrap();
        assert_eq!(events.lines().count(), 2);
    }
}
