//! Guarded generation orchestrator: preflight, budget/breaker gates, the
//! ordered fallback plan, and the durable event log + JSON summary.

use crate::core::error::BinderyError;
use crate::core::guard::{GateDecision, GuardConfig, GuardState};
use crate::core::lifecycle::{self, AttemptOutcome, PollConfig};
use crate::core::nlm::NlmClient;
use crate::core::time;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub notebook_id: String,
    /// Empty means "all sources in the notebook", resolved during preflight.
    pub source_ids: Vec<String>,
    /// Ordered fallback chain of artifact types.
    pub plan: Vec<String>,
    /// Stop after this many successes; `<= 0` runs the whole plan.
    pub max_success: i64,
    pub dry_run: bool,
    pub state_file: PathBuf,
    pub events_file: PathBuf,
}

/// Append one flattened event row (`{ts, event, ...fields}`) to the guard
/// event log. Rows are never rewritten.
fn append_guard_event(
    path: &Path,
    clock: &dyn crate::core::time::Clock,
    event: &str,
    fields: &Value,
) -> Result<(), BinderyError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut row = serde_json::Map::new();
    row.insert("ts".to_string(), json!(time::now_iso(clock)));
    row.insert("event".to_string(), json!(event));
    if let Some(extra) = fields.as_object() {
        for (key, value) in extra {
            row.insert(key.clone(), value.clone());
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", Value::Object(row))?;
    Ok(())
}

/// Connectivity, auth, and source availability checks that gate the whole
/// run. Consumes no budget.
pub fn preflight(client: &NlmClient, notebook_id: &str, source_ids: &[String]) -> (bool, Value) {
    let clock = client.clock();
    let mut report = serde_json::Map::new();
    report.insert("checked_at".to_string(), json!(time::now_iso(clock)));
    report.insert("ok".to_string(), json!(false));

    match client.version_check() {
        Ok(result) if result.success() => {}
        Ok(result) => {
            report.insert("reason".to_string(), json!("nlm_not_available"));
            report.insert("detail".to_string(), json!(result.error_text()));
            return (false, Value::Object(report));
        }
        Err(err) => {
            report.insert("reason".to_string(), json!("nlm_not_available"));
            report.insert("detail".to_string(), json!(err.to_string()));
            return (false, Value::Object(report));
        }
    }

    match client.check_auth() {
        Ok(result) if result.success() => {}
        Ok(result) => {
            report.insert("reason".to_string(), json!("auth_required"));
            report.insert("detail".to_string(), json!(result.error_text()));
            return (false, Value::Object(report));
        }
        Err(err) => {
            report.insert("reason".to_string(), json!("auth_required"));
            report.insert("detail".to_string(), json!(err.to_string()));
            return (false, Value::Object(report));
        }
    }

    let resolved_count = if source_ids.is_empty() {
        match client.source_ids(notebook_id) {
            Ok(ids) if ids.is_empty() => {
                report.insert("reason".to_string(), json!("no_sources"));
                report.insert("detail".to_string(), json!("Notebook has no sources."));
                return (false, Value::Object(report));
            }
            Ok(ids) => ids.len(),
            Err(err) => {
                report.insert("reason".to_string(), json!("source_list_failed"));
                report.insert("detail".to_string(), json!(err.to_string()));
                return (false, Value::Object(report));
            }
        }
    } else {
        source_ids.len()
    };

    report.insert("ok".to_string(), json!(true));
    report.insert("resolved_source_count".to_string(), json!(resolved_count));
    (true, Value::Object(report))
}

/// Run the guarded generation plan. Always returns a summary document;
/// logical failures live in its `status` field.
pub fn run_guarded_generation(
    client: &NlmClient,
    request: &GenerateRequest,
    guard_config: &GuardConfig,
    poll: &PollConfig,
) -> Result<Value, BinderyError> {
    let clock = client.clock();
    let state_file = request.state_file.as_path();
    let events_file = request.events_file.as_path();

    let mut state = GuardState::load_or_default(state_file, clock);
    state.maybe_reset_daily(clock);

    let (preflight_ok, preflight_report) =
        preflight(client, &request.notebook_id, &request.source_ids);
    append_guard_event(
        events_file,
        clock,
        "preflight",
        &json!({ "report": preflight_report }),
    )?;

    if !preflight_ok {
        state.set_last_run(json!({
            "at": time::now_iso(clock),
            "status": "failed_preflight",
            "preflight": preflight_report,
        }));
        state.save(state_file)?;
        return Ok(json!({
            "status": "failed_preflight",
            "preflight": preflight_report,
            "state_file": state_file.display().to_string(),
            "events_file": events_file.display().to_string(),
        }));
    }

    let mut source_ids = request.source_ids.clone();
    if source_ids.is_empty() {
        source_ids = client.source_ids(&request.notebook_id).unwrap_or_default();
    }

    if request.dry_run {
        state.set_last_run(json!({
            "at": time::now_iso(clock),
            "status": "dry_run_ok",
            "preflight": preflight_report,
        }));
        state.save(state_file)?;
        return Ok(json!({
            "status": "dry_run_ok",
            "preflight": preflight_report,
            "resolved_source_ids": source_ids,
            "state_file": state_file.display().to_string(),
            "events_file": events_file.display().to_string(),
        }));
    }

    let mut attempts: Vec<Value> = Vec::new();
    let mut successes: Vec<Value> = Vec::new();
    let mut skipped: Vec<Value> = Vec::new();

    for artifact_type in &request.plan {
        if request.max_success > 0 && successes.len() as i64 >= request.max_success {
            break;
        }

        if let GateDecision::Skip { reason } = state.budget_decision(artifact_type, guard_config) {
            let row = json!({
                "artifact_type": artifact_type,
                "outcome": "skipped",
                "reason": reason,
            });
            skipped.push(row.clone());
            append_guard_event(events_file, clock, "skip", &row)?;
            continue;
        }

        if let GateDecision::Skip { reason } = state.breaker_decision(artifact_type, clock) {
            let row = json!({
                "artifact_type": artifact_type,
                "outcome": "skipped",
                "reason": reason,
            });
            skipped.push(row.clone());
            append_guard_event(events_file, clock, "skip", &row)?;
            continue;
        }

        // Consumption happens at attempt time; a failed attempt still counts.
        state.consume(artifact_type);
        let created_at = time::now_iso(clock);

        let outcome = lifecycle::run_attempt(
            client,
            &request.notebook_id,
            artifact_type,
            &source_ids,
            poll,
        );

        let row = match &outcome {
            AttemptOutcome::Completed {
                artifact_id,
                status,
            } => {
                state.record_success(artifact_type, clock);
                json!({
                    "artifact_type": artifact_type,
                    "artifact_id": artifact_id,
                    "outcome": "completed",
                    "status": status,
                    "created_at": created_at,
                })
            }
            AttemptOutcome::CreateFailed { reason } => {
                state.record_failure(artifact_type, guard_config, clock);
                json!({
                    "artifact_type": artifact_type,
                    "outcome": "create_failed",
                    "reason": reason,
                    "created_at": created_at,
                })
            }
            AttemptOutcome::CreateFailedNoArtifact { reason } => {
                state.record_failure(artifact_type, guard_config, clock);
                json!({
                    "artifact_type": artifact_type,
                    "outcome": "create_failed_no_artifact",
                    "reason": reason,
                    "created_at": created_at,
                })
            }
            AttemptOutcome::PollFailed {
                artifact_id,
                status,
            } => {
                state.record_failure(artifact_type, guard_config, clock);
                json!({
                    "artifact_type": artifact_type,
                    "artifact_id": artifact_id,
                    "outcome": "failed",
                    "status": status,
                    "created_at": created_at,
                })
            }
            AttemptOutcome::PollTimeout {
                artifact_id,
                last_status,
            } => {
                state.record_failure(artifact_type, guard_config, clock);
                json!({
                    "artifact_type": artifact_type,
                    "artifact_id": artifact_id,
                    "outcome": "timeout",
                    "reason": format!("poll_timeout_last={last_status}"),
                    "created_at": created_at,
                })
            }
        };

        attempts.push(row.clone());
        if outcome.is_success() {
            successes.push(row.clone());
        }
        append_guard_event(events_file, clock, outcome.event_name(), &row)?;
    }

    let quota = request.max_success.max(1);
    let final_status = if successes.len() as i64 >= quota {
        "ok"
    } else if !successes.is_empty() {
        "degraded"
    } else {
        "failed"
    };

    let summary = json!({
        "status": final_status,
        "checked_at": time::now_iso(clock),
        "notebook_id": request.notebook_id,
        "profile": client.config.profile,
        "plan": request.plan,
        "max_success": request.max_success,
        "resolved_source_ids": source_ids,
        "preflight": preflight_report,
        "attempts": attempts,
        "successes": successes,
        "skipped": skipped,
        "daily_budget": serde_json::to_value(&state.daily)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
        "breaker": serde_json::to_value(&state.breaker)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
        "state_file": state_file.display().to_string(),
        "events_file": events_file.display().to_string(),
    });

    state.set_last_run(json!({
        "at": time::now_iso(clock),
        "status": final_status,
        "notebook_id": request.notebook_id,
        "plan": request.plan,
        "success_count": successes.len(),
        "attempt_count": attempts.len(),
    }));
    state.save(state_file)?;

    Ok(summary)
}
