//! Chapter-at-a-time infographic generation: resolve (or create) a source
//! per chapter, create the infographic, poll it to a terminal state, and
//! download the finished image. Same lifecycle as the guarded plan loop,
//! driven per chapter instead of per artifact type.

use crate::core::error::BinderyError;
use crate::core::exec::tail;
use crate::core::lifecycle::{PollConfig, FAIL_STATES, SUCCESS_STATES};
use crate::core::nlm::NlmClient;
use crate::core::time;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STAGE_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone)]
pub struct InfographicRequest {
    pub notebook_id: String,
    /// Ranked-chapters JSON file produced by the prepare stage.
    pub ranked_json: PathBuf,
    /// Optional chapter filter; empty means all ranked chapters.
    pub chapter_ids: Vec<String>,
    /// Seed chapter->source mappings reused instead of re-adding text.
    pub source_map: BTreeMap<String, String>,
    pub chars_per_chapter: usize,
    /// `0` means no cap.
    pub max_chapters: usize,
    pub out_dir: PathBuf,
    pub run_id: String,
}

#[derive(Debug, Clone, Default)]
struct RankedChapter {
    chapter_id: String,
    title: String,
    text: String,
    score: Option<f64>,
    char_count: Option<i64>,
}

impl RankedChapter {
    fn from_value(value: &Value, fallback_id: usize) -> Self {
        let map = value.as_object();
        let get_str = |key: &str| -> String {
            map.and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let mut chapter_id = get_str("chapter_id").trim().to_string();
        if chapter_id.is_empty() {
            if let Some(id) = map
                .and_then(|m| m.get("chapter_id"))
                .and_then(Value::as_i64)
            {
                chapter_id = id.to_string();
            }
        }
        if chapter_id.is_empty() {
            chapter_id = fallback_id.to_string();
        }
        let title = {
            let t = get_str("title");
            if t.is_empty() {
                format!("chapter-{chapter_id}")
            } else {
                t
            }
        };
        RankedChapter {
            chapter_id: chapter_id.clone(),
            title,
            text: get_str("text"),
            score: map.and_then(|m| m.get("score")).and_then(Value::as_f64),
            char_count: map
                .and_then(|m| m.get("char_count"))
                .and_then(Value::as_i64),
        }
    }
}

/// Read ranked chapters from the prepare stage's output file.
fn load_ranked_chapters(path: &Path) -> Result<Vec<Value>, BinderyError> {
    let raw = std::fs::read_to_string(path)?;
    let data: Value = serde_json::from_str(&raw)
        .map_err(|e| BinderyError::ValidationError(format!("ranked json decode: {e}")))?;
    for key in ["selected_chapters", "chapters"] {
        if let Some(rows) = data.get(key).and_then(Value::as_array) {
            return Ok(rows.iter().filter(|v| v.is_object()).cloned().collect());
        }
    }
    Err(BinderyError::ValidationError(format!(
        "unable to read chapters from {}",
        path.display()
    )))
}

fn select_chapters(
    rows: &[Value],
    chapter_ids: &[String],
    max_chapters: usize,
) -> Vec<RankedChapter> {
    let normalized: Vec<RankedChapter> = rows
        .iter()
        .enumerate()
        .map(|(idx, row)| RankedChapter::from_value(row, idx + 1))
        .collect();

    let mut picked = if chapter_ids.is_empty() {
        normalized
    } else {
        let by_id: BTreeMap<String, RankedChapter> = normalized
            .into_iter()
            .map(|ch| (ch.chapter_id.clone(), ch))
            .collect();
        chapter_ids
            .iter()
            .map(|cid| {
                by_id.get(cid).cloned().unwrap_or_else(|| RankedChapter {
                    chapter_id: cid.clone(),
                    title: format!("chapter-{cid}"),
                    ..RankedChapter::default()
                })
            })
            .collect()
    };

    if max_chapters > 0 && picked.len() > max_chapters {
        picked.truncate(max_chapters);
    }
    picked
}

fn sanitize_filename(name: &str) -> String {
    let bad = Regex::new(r#"[\\/:*?"<>|]"#).expect("valid regex");
    let spaces = Regex::new(r"\s+").expect("valid regex");
    let cleaned = bad.replace_all(name, "_");
    let cleaned = spaces.replace_all(&cleaned, "_");
    let cleaned = cleaned.trim_matches('_');
    let truncated: String = cleaned.chars().take(80).collect();
    if truncated.is_empty() {
        "chapter".to_string()
    } else {
        truncated
    }
}

fn is_infographic_row(row: &Map<String, Value>) -> bool {
    serde_json::to_string(row)
        .map(|raw| raw.to_lowercase().contains("infographic"))
        .unwrap_or(false)
}

fn studio_infographic_rows(
    client: &NlmClient,
    notebook_id: &str,
) -> Result<Vec<Map<String, Value>>, BinderyError> {
    Ok(client
        .studio_rows(notebook_id)?
        .into_iter()
        .filter(is_infographic_row)
        .collect())
}

fn row_id(row: &Map<String, Value>) -> Option<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pick the new source id after an add, by diffing source listings.
/// Deterministic tie-break: latest by timestamp-like keys, then id.
fn new_source_id_by_diff(
    before: &[Map<String, Value>],
    after: &[Map<String, Value>],
) -> Option<String> {
    let before_ids: BTreeSet<String> = before.iter().filter_map(row_id).collect();
    let mut candidates: Vec<&Map<String, Value>> = after
        .iter()
        .filter(|row| row_id(row).map(|id| !before_ids.contains(&id)).unwrap_or(false))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|row| {
        let stamp = ["updated_at", "created_at", "timestamp"]
            .iter()
            .find_map(|key| row.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        (stamp, row_id(row).unwrap_or_default())
    });
    candidates.last().and_then(|row| row_id(row))
}

fn empty_artifact(chapter: &RankedChapter, source_id: Option<&str>, status: &str, error: &str) -> Value {
    json!({
        "chapter_id": chapter.chapter_id,
        "source_id": source_id,
        "artifact_id": null,
        "status": status,
        "path": null,
        "size": 0,
        "error": tail(error, 500),
    })
}

fn finalize_status(artifacts: &[Value]) -> &'static str {
    if artifacts.is_empty() {
        return "failed";
    }
    let oks = artifacts
        .iter()
        .filter(|a| a.get("status").and_then(Value::as_str) == Some("ok"))
        .count();
    if oks == artifacts.len() {
        "ok"
    } else if oks > 0 {
        "partial"
    } else {
        "failed"
    }
}

/// Run the per-chapter infographic loop. Always returns the stage manifest;
/// per-chapter failures become artifact rows, not errors.
pub fn run_infographic_generation(
    client: &NlmClient,
    request: &InfographicRequest,
    poll: &PollConfig,
) -> Result<Value, BinderyError> {
    let clock = client.clock();
    let ranked_rows = load_ranked_chapters(&request.ranked_json)?;
    let picked = select_chapters(&ranked_rows, &request.chapter_ids, request.max_chapters);
    let started_at = time::now_iso(clock);

    let run_id = if request.run_id.trim().is_empty() {
        format!(
            "run-{}-{}",
            clock.now().format("%Y%m%dT%H%M%S"),
            &time::new_event_id().to_lowercase()[..8]
        )
    } else {
        request.run_id.trim().to_string()
    };
    let run_dir = request.out_dir.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;
    let manifest_path = run_dir.join("run_manifest.json");

    let selected: Vec<Value> = picked
        .iter()
        .map(|ch| {
            json!({
                "chapter_id": ch.chapter_id,
                "title": ch.title,
                "score": ch.score,
                "char_count": ch.char_count,
            })
        })
        .collect();

    let mut source_map: BTreeMap<String, String> = request
        .source_map
        .iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| (k.clone(), v.trim().to_string()))
        .collect();

    let mut manifest = json!({
        "schema_version": STAGE_SCHEMA_VERSION,
        "run_id": run_id,
        "started_at": started_at,
        "finished_at": null,
        "notebook_id": request.notebook_id,
        "selected_chapters": selected,
        "source_map": {},
        "artifacts": [],
        "status": "started",
        "run_dir": run_dir.display().to_string(),
    });

    let auth = client.check_auth()?;
    if !auth.success() {
        manifest["error"] = json!(tail(&auth.error_text(), 500));
        return finish_stage(
            clock,
            manifest,
            &picked,
            &source_map,
            Vec::new(),
            Some("auth_required"),
            &manifest_path,
        );
    }

    let supports_profile = client.download_supports_profile("infographic");
    let mut artifacts: Vec<Value> = Vec::new();

    for chapter in &picked {
        let cid = &chapter.chapter_id;
        let text: String = chapter.text.chars().take(request.chars_per_chapter).collect();

        let mut source_id = source_map.get(cid).cloned();
        if source_id.is_none() {
            if text.is_empty() {
                artifacts.push(empty_artifact(
                    chapter,
                    None,
                    "source_missing",
                    "no source_map entry and no chapter text",
                ));
                continue;
            }

            let before_sources = match client.source_rows(&request.notebook_id) {
                Ok(rows) => rows,
                Err(err) => {
                    artifacts.push(empty_artifact(
                        chapter,
                        None,
                        "source_list_failed",
                        &err.to_string(),
                    ));
                    continue;
                }
            };

            let title = format!("ch{cid} {}", chapter.title);
            let add = match client.source_add(&request.notebook_id, &text, &title) {
                Ok(result) => result,
                Err(err) => {
                    artifacts.push(empty_artifact(
                        chapter,
                        None,
                        "source_add_failed",
                        &err.to_string(),
                    ));
                    continue;
                }
            };
            if !add.success() {
                artifacts.push(empty_artifact(
                    chapter,
                    None,
                    "source_add_failed",
                    &add.error_text(),
                ));
                continue;
            }

            let mut resolved = crate::core::parse::extract_source_id(&add.stdout);
            if resolved.is_none() {
                match client.source_rows(&request.notebook_id) {
                    Ok(after_sources) => {
                        resolved = new_source_id_by_diff(&before_sources, &after_sources);
                    }
                    Err(err) => {
                        artifacts.push(empty_artifact(
                            chapter,
                            None,
                            "source_id_not_found",
                            &err.to_string(),
                        ));
                        continue;
                    }
                }
            }
            let Some(resolved) = resolved else {
                artifacts.push(empty_artifact(
                    chapter,
                    None,
                    "source_id_not_found",
                    "unable to resolve source id",
                ));
                continue;
            };
            source_id = Some(resolved);
        }
        let source_id = source_id.expect("source id resolved above");
        source_map.insert(cid.clone(), source_id.clone());

        let before_inf: BTreeSet<String> = studio_infographic_rows(client, &request.notebook_id)
            .map(|rows| rows.iter().filter_map(row_id).collect())
            .unwrap_or_default();

        let created = match client.create_artifact(
            "infographic",
            &request.notebook_id,
            std::slice::from_ref(&source_id),
        ) {
            Ok(result) => result,
            Err(err) => {
                artifacts.push(empty_artifact(
                    chapter,
                    Some(source_id.as_str()),
                    "create_failed",
                    &err.to_string(),
                ));
                continue;
            }
        };
        if !created.success() {
            artifacts.push(empty_artifact(
                chapter,
                Some(source_id.as_str()),
                "create_failed",
                &created.error_text(),
            ));
            continue;
        }

        let mut artifact_id = crate::core::parse::extract_artifact_id(&created.stdout)
            .filter(|id| id != &request.notebook_id);
        let mut artifact_state = "unknown".to_string();
        let mut poll_error = String::new();
        let tick = Duration::from_secs(poll.poll_seconds);

        for _ in 0..poll.max_polls {
            let rows = match studio_infographic_rows(client, &request.notebook_id) {
                Ok(rows) => rows,
                Err(err) => {
                    poll_error = err.to_string();
                    clock.sleep(tick);
                    continue;
                }
            };

            // Creation output sometimes carries no id; recover it from the
            // first row that appeared since the create.
            if artifact_id.is_none() {
                artifact_id = rows
                    .iter()
                    .filter_map(row_id)
                    .find(|id| !before_inf.contains(id));
            }

            if let Some(id) = artifact_id.as_deref() {
                if let Some(row) = rows.iter().find(|row| row_id(row).as_deref() == Some(id)) {
                    artifact_state = crate::core::lifecycle::row_status(row);
                    if SUCCESS_STATES.contains(&artifact_state.as_str())
                        || FAIL_STATES.contains(&artifact_state.as_str())
                    {
                        break;
                    }
                }
            }
            clock.sleep(tick);
        }

        let Some(artifact_id) = artifact_id else {
            let reason = if poll_error.is_empty() {
                "artifact id unresolved".to_string()
            } else {
                poll_error
            };
            artifacts.push(empty_artifact(
                chapter,
                Some(source_id.as_str()),
                "artifact_not_found",
                &reason,
            ));
            continue;
        };

        let out_path = run_dir.join(format!("ch{cid}_{}.png", sanitize_filename(&chapter.title)));
        let mut download = match client.download(
            "infographic",
            &request.notebook_id,
            &artifact_id,
            &out_path,
            supports_profile,
        ) {
            Ok(result) => result,
            Err(err) => {
                artifacts.push(empty_artifact(
                    chapter,
                    Some(source_id.as_str()),
                    "download_failed",
                    &err.to_string(),
                ));
                continue;
            }
        };
        if !download.success()
            && SUCCESS_STATES.contains(&artifact_state.as_str())
            && supports_profile
        {
            if let Ok(retry) = client.download(
                "infographic",
                &request.notebook_id,
                &artifact_id,
                &out_path,
                false,
            ) {
                download = retry;
            }
        }

        let downloaded = download.success() && out_path.exists();
        let status = if downloaded {
            "ok"
        } else if FAIL_STATES.contains(&artifact_state.as_str()) {
            "artifact_failed"
        } else {
            "download_failed"
        };
        let size = out_path.metadata().map(|m| m.len()).unwrap_or(0);
        artifacts.push(json!({
            "chapter_id": cid,
            "source_id": source_id,
            "artifact_id": artifact_id,
            "status": status,
            "path": if out_path.exists() { json!(out_path.display().to_string()) } else { Value::Null },
            "size": size,
            "error": if downloaded { json!("") } else { json!(tail(&download.error_text(), 500)) },
            "artifact_state": artifact_state,
        }));
    }

    finish_stage(
        clock,
        manifest,
        &picked,
        &source_map,
        artifacts,
        None,
        &manifest_path,
    )
}

/// Stamp the stage manifest with its final source map, artifacts, and
/// status, write it to the run dir, and return it with `manifest_path` set.
fn finish_stage(
    clock: &dyn crate::core::time::Clock,
    mut manifest: Value,
    picked: &[RankedChapter],
    source_map: &BTreeMap<String, String>,
    artifacts: Vec<Value>,
    status: Option<&str>,
    manifest_path: &Path,
) -> Result<Value, BinderyError> {
    let picked_map: Map<String, Value> = picked
        .iter()
        .map(|ch| {
            let id = source_map
                .get(&ch.chapter_id)
                .map(|s| json!(s))
                .unwrap_or(Value::Null);
            (ch.chapter_id.clone(), id)
        })
        .collect();
    manifest["source_map"] = Value::Object(picked_map);
    let status = status
        .map(str::to_string)
        .unwrap_or_else(|| finalize_status(&artifacts).to_string());
    manifest["artifacts"] = Value::Array(artifacts);
    manifest["finished_at"] = json!(time::now_iso(clock));
    manifest["status"] = json!(status);
    let raw = serde_json::to_string_pretty(&manifest)
        .map_err(|e| BinderyError::ValidationError(format!("stage manifest encode: {e}")))?;
    std::fs::write(manifest_path, raw)?;
    manifest["manifest_path"] = json!(manifest_path.display().to_string());
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a b/c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("   "), "chapter");
        let long = "x".repeat(200);
        assert_eq!(sanitize_filename(&long).chars().count(), 80);
    }

    #[test]
    fn test_select_chapters_by_id_with_placeholders() {
        let rows = vec![
            json!({"chapter_id": "1", "title": "One", "text": "t1"}),
            json!({"chapter_id": "2", "title": "Two", "text": "t2"}),
        ];
        let picked = select_chapters(&rows, &["2".to_string(), "9".to_string()], 0);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].chapter_id, "2");
        assert_eq!(picked[1].chapter_id, "9");
        assert_eq!(picked[1].title, "chapter-9");
        assert!(picked[1].text.is_empty());
    }

    #[test]
    fn test_select_chapters_fallback_ids_and_cap() {
        let rows = vec![json!({"title": "A"}), json!({"title": "B"}), json!({"title": "C"})];
        let picked = select_chapters(&rows, &[], 2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].chapter_id, "1");
        assert_eq!(picked[1].chapter_id, "2");
    }

    #[test]
    fn test_new_source_id_by_diff_prefers_latest_stamp() {
        let before = vec![json!({"id": "old"}).as_object().unwrap().clone()];
        let after = vec![
            json!({"id": "old"}).as_object().unwrap().clone(),
            json!({"id": "a", "created_at": "2026-01-01"}).as_object().unwrap().clone(),
            json!({"id": "b", "created_at": "2026-02-01"}).as_object().unwrap().clone(),
        ];
        assert_eq!(new_source_id_by_diff(&before, &after).as_deref(), Some("b"));
        assert_eq!(new_source_id_by_diff(&after, &after), None);
    }

    #[test]
    fn test_finalize_status() {
        assert_eq!(finalize_status(&[]), "failed");
        let ok = json!({"status": "ok"});
        let bad = json!({"status": "create_failed"});
        assert_eq!(finalize_status(&[ok.clone()]), "ok");
        assert_eq!(finalize_status(&[ok.clone(), bad.clone()]), "partial");
        assert_eq!(finalize_status(&[bad]), "failed");
    }
}
