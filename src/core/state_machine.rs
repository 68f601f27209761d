//! Run lifecycle states and the allowed-transition table.
//!
//! `completed` and `failed` are absorbing. `awaiting_chapter_selection` is a
//! terminal pause, not an end: resuming is a new invocation with chapter ids
//! supplied.

use crate::core::error::BinderyError;
use crate::core::manifest::RunManifest;
use crate::core::time::Clock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Started,
    Fetched,
    Prepared,
    AwaitingChapterSelection,
    Generating,
    Partial,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Started => "started",
            RunState::Fetched => "fetched",
            RunState::Prepared => "prepared",
            RunState::AwaitingChapterSelection => "awaiting_chapter_selection",
            RunState::Generating => "generating",
            RunState::Partial => "partial",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::Partial
                | RunState::Failed
                | RunState::AwaitingChapterSelection
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn can_transition(current: RunState, target: RunState) -> bool {
    use RunState::*;
    let allowed: &[RunState] = match current {
        Started => &[Fetched, Prepared, Failed],
        Fetched => &[Prepared, Failed],
        Prepared => &[AwaitingChapterSelection, Generating, Completed, Failed],
        AwaitingChapterSelection => &[Generating, Failed],
        Generating => &[Completed, Partial, Failed],
        Partial => &[Generating, Completed, Failed],
        Completed | Failed => &[],
    };
    allowed.contains(&target)
}

/// Move the manifest to `target`. A same-state transition only refreshes
/// `updated_at`; an illegal transition fails and leaves `status` unchanged.
pub fn transition(
    manifest: &mut RunManifest,
    target: RunState,
    clock: &dyn Clock,
) -> Result<(), BinderyError> {
    let current = manifest.status;
    if current == target {
        manifest.touch(clock);
        return Ok(());
    }
    if !can_transition(current, target) {
        return Err(BinderyError::IllegalTransition {
            from: current.as_str().to_string(),
            to: target.as_str().to_string(),
        });
    }
    manifest.status = target;
    manifest.touch(clock);
    Ok(())
}

/// Callers that hit an illegal transition must not leave the manifest
/// inconsistent; this forces `failed` regardless of the table.
pub fn force_failed(manifest: &mut RunManifest, clock: &dyn Clock) {
    if transition(manifest, RunState::Failed, clock).is_err() {
        manifest.status = RunState::Failed;
        manifest.touch(clock);
    }
}

const STAGE_SUCCESS_STATES: &[&str] = &["ok", "completed", "prepared", "dry_run_ok"];
const STAGE_PARTIAL_STATES: &[&str] = &["partial", "degraded"];

/// Derive the run's final state from the recorded generation stage
/// outcomes ("infographic" and "non_infographic").
pub fn final_generation_state(manifest: &RunManifest) -> RunState {
    let mut statuses: Vec<String> = Vec::new();
    for stage in ["infographic", "non_infographic"] {
        if let Some(payload) = manifest.stages.get(stage) {
            if let Some(status) = payload.get("status").and_then(|v| v.as_str()) {
                let status = status.trim().to_lowercase();
                if !status.is_empty() {
                    statuses.push(status);
                }
            }
        }
    }

    if statuses.is_empty() {
        return RunState::Failed;
    }

    let is_success = |s: &String| STAGE_SUCCESS_STATES.contains(&s.as_str());
    let is_partial = |s: &String| STAGE_PARTIAL_STATES.contains(&s.as_str());

    if statuses.iter().all(is_success) {
        return RunState::Completed;
    }
    if statuses.iter().any(is_success)
        && statuses.iter().any(|s| is_partial(s) || s == "failed")
    {
        return RunState::Partial;
    }
    if statuses.iter().any(is_partial) {
        return RunState::Partial;
    }
    RunState::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;
    use serde_json::json;

    fn manifest() -> RunManifest {
        RunManifest::new("bindery-test", "/tmp/ws", vec![], &SystemClock)
    }

    #[test]
    fn test_happy_path_transitions() {
        let clock = SystemClock;
        let mut m = manifest();
        for target in [
            RunState::Fetched,
            RunState::Prepared,
            RunState::Generating,
            RunState::Completed,
        ] {
            transition(&mut m, target, &clock).unwrap();
            assert_eq!(m.status, target);
        }
    }

    #[test]
    fn test_illegal_transition_preserves_state() {
        let clock = SystemClock;
        let mut m = manifest();
        let err = transition(&mut m, RunState::Completed, &clock).unwrap_err();
        assert!(matches!(err, BinderyError::IllegalTransition { .. }));
        assert_eq!(m.status, RunState::Started);
    }

    #[test]
    fn test_same_state_transition_touches_only() {
        let clock = SystemClock;
        let mut m = manifest();
        transition(&mut m, RunState::Started, &clock).unwrap();
        assert_eq!(m.status, RunState::Started);
    }

    #[test]
    fn test_absorbing_states() {
        let clock = SystemClock;
        let mut m = manifest();
        transition(&mut m, RunState::Failed, &clock).unwrap();
        for target in [RunState::Started, RunState::Generating, RunState::Completed] {
            assert!(transition(&mut m, target, &clock).is_err());
        }
        assert_eq!(m.status, RunState::Failed);
    }

    #[test]
    fn test_partial_can_resume_generating() {
        let clock = SystemClock;
        let mut m = manifest();
        transition(&mut m, RunState::Prepared, &clock).unwrap();
        transition(&mut m, RunState::Generating, &clock).unwrap();
        transition(&mut m, RunState::Partial, &clock).unwrap();
        transition(&mut m, RunState::Generating, &clock).unwrap();
        assert_eq!(m.status, RunState::Generating);
    }

    #[test]
    fn test_force_failed_from_absorbing_state() {
        let clock = SystemClock;
        let mut m = manifest();
        transition(&mut m, RunState::Prepared, &clock).unwrap();
        transition(&mut m, RunState::Completed, &clock).unwrap();
        force_failed(&mut m, &clock);
        assert_eq!(m.status, RunState::Failed);
    }

    #[test]
    fn test_final_state_all_success() {
        let mut m = manifest();
        m.stages
            .insert("infographic".to_string(), json!({"status": "ok"}));
        m.stages
            .insert("non_infographic".to_string(), json!({"status": "degraded"}));
        assert_eq!(final_generation_state(&m), RunState::Partial);

        m.stages
            .insert("non_infographic".to_string(), json!({"status": "ok"}));
        assert_eq!(final_generation_state(&m), RunState::Completed);
    }

    #[test]
    fn test_final_state_mixed_and_empty() {
        let mut m = manifest();
        assert_eq!(final_generation_state(&m), RunState::Failed);

        m.stages
            .insert("infographic".to_string(), json!({"status": "failed"}));
        assert_eq!(final_generation_state(&m), RunState::Failed);

        m.stages
            .insert("non_infographic".to_string(), json!({"status": "completed"}));
        assert_eq!(final_generation_state(&m), RunState::Partial);
    }

    #[test]
    fn test_final_state_partial_only() {
        let mut m = manifest();
        m.stages
            .insert("non_infographic".to_string(), json!({"status": "partial"}));
        assert_eq!(final_generation_state(&m), RunState::Partial);
    }

    #[test]
    fn test_state_serde_round_trip() {
        let encoded = serde_json::to_string(&RunState::AwaitingChapterSelection).unwrap();
        assert_eq!(encoded, "\"awaiting_chapter_selection\"");
        let decoded: RunState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, RunState::AwaitingChapterSelection);
    }
}
