//! Per-attempt artifact lifecycle: create, resolve the artifact id, poll to
//! a terminal state. Every failure variant counts against the breaker; only
//! `Completed` clears it.

use crate::core::exec::tail;
use crate::core::nlm::NlmClient;
use crate::core::parse;
use serde_json::Value;
use std::time::Duration;

pub const SUCCESS_STATES: &[&str] = &["completed", "done", "ready", "succeeded"];
pub const FAIL_STATES: &[&str] = &["failed", "error"];

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub poll_seconds: u64,
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            poll_seconds: 15,
            max_polls: 40,
        }
    }
}

/// Terminal classification of one creation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed {
        artifact_id: String,
        status: String,
    },
    CreateFailed {
        reason: String,
    },
    /// Creation nominally succeeded but no id could be extracted. Fail-fast:
    /// polling never starts without a concrete id.
    CreateFailedNoArtifact {
        reason: String,
    },
    PollFailed {
        artifact_id: String,
        status: String,
    },
    /// `max_polls` exhausted without a terminal state. Distinct from
    /// `PollFailed`: this process gave up waiting, the external system may
    /// still finish.
    PollTimeout {
        artifact_id: String,
        last_status: String,
    },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Completed { .. })
    }

    /// Event-log token for this outcome.
    pub fn event_name(&self) -> &'static str {
        match self {
            AttemptOutcome::Completed { .. } => "completed",
            AttemptOutcome::CreateFailed { .. } => "create_failed",
            AttemptOutcome::CreateFailedNoArtifact { .. } => "create_failed_no_artifact",
            AttemptOutcome::PollFailed { .. } => "failed",
            AttemptOutcome::PollTimeout { .. } => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { status: String },
    Failed { status: String },
    Timeout { last_status: String },
}

/// Poll the studio listing until the artifact reaches a terminal state.
/// Listing errors and missing rows just wait for the next tick.
pub fn poll_artifact(
    client: &NlmClient,
    notebook_id: &str,
    artifact_id: &str,
    poll: &PollConfig,
) -> PollOutcome {
    let mut last_status = "unknown".to_string();
    let tick = Duration::from_secs(poll.poll_seconds);

    for _ in 0..poll.max_polls {
        let rows = match client.studio_rows(notebook_id) {
            Ok(rows) => rows,
            Err(_) => {
                client.clock().sleep(tick);
                continue;
            }
        };

        let Some(row) = parse::find_row_by_id(&rows, artifact_id) else {
            client.clock().sleep(tick);
            continue;
        };

        let status = row_status(row);
        last_status = status.clone();

        if SUCCESS_STATES.contains(&status.as_str()) {
            return PollOutcome::Completed { status };
        }
        if FAIL_STATES.contains(&status.as_str()) {
            return PollOutcome::Failed { status };
        }

        client.clock().sleep(tick);
    }

    PollOutcome::Timeout { last_status }
}

/// Drive one artifact type through create -> id resolution -> poll.
pub fn run_attempt(
    client: &NlmClient,
    notebook_id: &str,
    artifact_type: &str,
    source_ids: &[String],
    poll: &PollConfig,
) -> AttemptOutcome {
    let created = match client.create_artifact(artifact_type, notebook_id, source_ids) {
        Ok(result) => result,
        Err(err) => {
            return AttemptOutcome::CreateFailed {
                reason: err.to_string(),
            };
        }
    };

    if !created.success() {
        return AttemptOutcome::CreateFailed {
            reason: tail(&created.error_text(), 800),
        };
    }

    let Some(artifact_id) = parse::extract_artifact_id(&created.combined()) else {
        return AttemptOutcome::CreateFailedNoArtifact {
            reason: format!("notebook CLI rejected {artifact_type} creation (no artifact returned)"),
        };
    };

    match poll_artifact(client, notebook_id, &artifact_id, poll) {
        PollOutcome::Completed { status } => AttemptOutcome::Completed {
            artifact_id,
            status,
        },
        PollOutcome::Failed { status } => AttemptOutcome::PollFailed {
            artifact_id,
            status,
        },
        PollOutcome::Timeout { last_status } => AttemptOutcome::PollTimeout {
            artifact_id,
            last_status,
        },
    }
}

/// Read a studio row's status/state field through the normalizer.
pub fn row_status(row: &serde_json::Map<String, Value>) -> String {
    let raw = match row.get("status") {
        Some(value) if !value.is_null() => Some(value),
        _ => row.get("state"),
    };
    parse::normalize_status(raw)
}
