//! Daily budget counters and per-artifact-type circuit breakers.
//!
//! Guard state is one JSON document per installation, persisted across runs
//! with a plain read-modify-write (single writer assumed; no file lock).
//! Budget is consumed at attempt time: a failed attempt still counts.

use crate::core::error::BinderyError;
use crate::core::time::{self, Clock};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const GUARD_SCHEMA_VERSION: u32 = 1;

/// Gate verdict for one artifact type. Skips are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Skip { reason: String },
}

impl GateDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DailyUsage {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub total_used: u32,
    #[serde(default)]
    pub per_type: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakerEntry {
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub open_until: Option<String>,
    #[serde(default)]
    pub last_failure_at: Option<String>,
    #[serde(default)]
    pub last_success_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub daily: DailyUsage,
    #[serde(default)]
    pub breaker: BTreeMap<String, BreakerEntry>,
    #[serde(default)]
    pub last_run: Value,
}

fn default_schema_version() -> u32 {
    GUARD_SCHEMA_VERSION
}

/// Budget limits and breaker thresholds, passed in rather than read from
/// globals.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Total creation attempts per local calendar day; `<= 0` is unlimited.
    pub daily_budget_total: i64,
    /// Per-artifact-type attempt limits; absent type is unlimited.
    pub daily_budget_per_type: BTreeMap<String, u32>,
    /// Consecutive failures that open a breaker; `0` disables opening.
    pub breaker_consecutive_failures: u32,
    pub breaker_open_minutes: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let mut per_type = BTreeMap::new();
        per_type.insert("infographic".to_string(), 10);
        per_type.insert("slides".to_string(), 10);
        per_type.insert("report".to_string(), 12);
        per_type.insert("audio".to_string(), 12);
        GuardConfig {
            daily_budget_total: 40,
            daily_budget_per_type: per_type,
            breaker_consecutive_failures: 3,
            breaker_open_minutes: 90,
        }
    }
}

impl GuardState {
    pub fn new(clock: &dyn Clock) -> Self {
        GuardState {
            schema_version: GUARD_SCHEMA_VERSION,
            daily: DailyUsage {
                date: time::today_local(clock),
                total_used: 0,
                per_type: BTreeMap::new(),
            },
            breaker: BTreeMap::new(),
            last_run: Value::Object(serde_json::Map::new()),
        }
    }

    /// Load persisted state; a missing or unreadable file yields a fresh
    /// document rather than aborting the run.
    pub fn load_or_default(path: &Path, clock: &dyn Clock) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return GuardState::new(clock);
        };
        match serde_json::from_str::<GuardState>(&raw) {
            Ok(mut state) => {
                if state.daily.date.is_empty() {
                    state.daily.date = time::today_local(clock);
                }
                state
            }
            Err(_) => GuardState::new(clock),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BinderyError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| BinderyError::ValidationError(format!("guard state encode: {e}")))?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Zero all daily counters exactly once when the stored date no longer
    /// matches the current local date.
    pub fn maybe_reset_daily(&mut self, clock: &dyn Clock) {
        let today = time::today_local(clock);
        if self.daily.date != today {
            self.daily = DailyUsage {
                date: today,
                total_used: 0,
                per_type: BTreeMap::new(),
            };
        }
    }

    pub fn budget_decision(&self, artifact_type: &str, config: &GuardConfig) -> GateDecision {
        if config.daily_budget_total > 0
            && i64::from(self.daily.total_used) >= config.daily_budget_total
        {
            return GateDecision::Skip {
                reason: "daily_total_budget_exhausted".to_string(),
            };
        }

        if let Some(limit) = config.daily_budget_per_type.get(artifact_type) {
            let used = self.daily.per_type.get(artifact_type).copied().unwrap_or(0);
            if used >= *limit {
                return GateDecision::Skip {
                    reason: format!("daily_{artifact_type}_budget_exhausted"),
                };
            }
        }

        GateDecision::Allow
    }

    /// Consume one attempt's worth of budget, at attempt time.
    pub fn consume(&mut self, artifact_type: &str) {
        self.daily.total_used += 1;
        *self
            .daily
            .per_type
            .entry(artifact_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn breaker_decision(&self, artifact_type: &str, clock: &dyn Clock) -> GateDecision {
        let Some(entry) = self.breaker.get(artifact_type) else {
            return GateDecision::Allow;
        };
        let Some(open_until) = entry.open_until.as_deref() else {
            return GateDecision::Allow;
        };
        // Unparseable timestamps count as closed rather than wedging the type.
        let Ok(until) = DateTime::parse_from_rfc3339(open_until) else {
            return GateDecision::Allow;
        };
        let until = until.with_timezone(&chrono::Local);
        let now = clock.now();
        if until > now {
            let remaining = (until - now).num_seconds();
            return GateDecision::Skip {
                reason: format!("breaker_open_{remaining}s"),
            };
        }
        GateDecision::Allow
    }

    pub fn record_success(&mut self, artifact_type: &str, clock: &dyn Clock) {
        let entry = self.breaker.entry(artifact_type.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.open_until = None;
        entry.last_success_at = Some(time::now_iso(clock));
    }

    pub fn record_failure(
        &mut self,
        artifact_type: &str,
        config: &GuardConfig,
        clock: &dyn Clock,
    ) {
        let entry = self.breaker.entry(artifact_type.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(time::now_iso(clock));
        if config.breaker_consecutive_failures > 0
            && entry.consecutive_failures >= config.breaker_consecutive_failures
        {
            let until = clock.now() + chrono::Duration::minutes(config.breaker_open_minutes);
            entry.open_until = Some(until.to_rfc3339());
        }
    }

    pub fn set_last_run(&mut self, snapshot: Value) {
        self.last_run = snapshot;
    }
}
