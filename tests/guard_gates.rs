//! Budget and breaker gate behavior across persisted guard state.

mod common;

use bindery::core::guard::{GateDecision, GuardConfig, GuardState};
use common::ManualClock;
use std::collections::BTreeMap;

fn clock() -> ManualClock {
    ManualClock::at("2026-08-07T09:00:00+00:00")
}

#[test]
fn budget_counters_survive_restart() {
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.json");
    let config = GuardConfig::default();

    let mut state = GuardState::load_or_default(&path, &clock);
    assert!(state.budget_decision("slides", &config).is_allow());
    state.consume("slides");
    state.consume("report");
    state.save(&path).unwrap();

    // A later process invocation picks up the same counters.
    let mut state = GuardState::load_or_default(&path, &clock);
    assert_eq!(state.daily.total_used, 2);
    assert_eq!(state.daily.per_type["slides"], 1);

    state.consume("slides");
    state.save(&path).unwrap();
    let state = GuardState::load_or_default(&path, &clock);
    assert_eq!(state.daily.per_type["slides"], 2);
}

#[test]
fn per_type_usage_counts_only_gated_through_attempts() {
    let clock = clock();
    let config = GuardConfig {
        daily_budget_total: 100,
        daily_budget_per_type: BTreeMap::from([("report".to_string(), 3)]),
        ..GuardConfig::default()
    };
    let mut state = GuardState::new(&clock);

    let mut gated_through = 0;
    for _ in 0..10 {
        match state.budget_decision("report", &config) {
            GateDecision::Allow => {
                state.consume("report");
                gated_through += 1;
            }
            GateDecision::Skip { .. } => {}
        }
    }
    assert_eq!(gated_through, 3);
    assert_eq!(state.daily.per_type["report"], gated_through);
}

#[test]
fn daily_reset_happens_exactly_once_per_rollover() {
    let clock = clock();
    let mut state = GuardState::new(&clock);
    for _ in 0..5 {
        state.consume("audio");
    }

    // Same day: reset is a no-op, twice.
    state.maybe_reset_daily(&clock);
    state.maybe_reset_daily(&clock);
    assert_eq!(state.daily.total_used, 5);

    clock.advance(chrono::Duration::days(1));
    state.maybe_reset_daily(&clock);
    assert_eq!(state.daily.total_used, 0);
    assert!(state.daily.per_type.is_empty());

    // Second check the same day stays zeroed but does not re-reset.
    state.consume("audio");
    state.maybe_reset_daily(&clock);
    assert_eq!(state.daily.total_used, 1);
}

#[test]
fn breaker_opens_at_threshold_and_only_time_or_success_closes_it() {
    let clock = clock();
    let config = GuardConfig::default();
    let mut state = GuardState::new(&clock);

    for i in 0..3 {
        assert!(
            state.breaker_decision("slides", &clock).is_allow(),
            "breaker must stay closed before failure {i}"
        );
        state.record_failure("slides", &config, &clock);
    }

    match state.breaker_decision("slides", &clock) {
        GateDecision::Skip { reason } => {
            assert!(reason.starts_with("breaker_open_"));
            assert!(reason.ends_with('s'));
        }
        GateDecision::Allow => panic!("breaker should be open after 3 failures"),
    }

    // Time alone closes it after the cooldown.
    clock.advance(chrono::Duration::minutes(89));
    assert!(!state.breaker_decision("slides", &clock).is_allow());
    clock.advance(chrono::Duration::minutes(2));
    assert!(state.breaker_decision("slides", &clock).is_allow());
}

#[test]
fn success_closes_breaker_immediately() {
    let clock = clock();
    let config = GuardConfig::default();
    let mut state = GuardState::new(&clock);
    for _ in 0..3 {
        state.record_failure("audio", &config, &clock);
    }
    assert!(!state.breaker_decision("audio", &clock).is_allow());

    state.record_success("audio", &clock);
    assert!(state.breaker_decision("audio", &clock).is_allow());
    assert_eq!(state.breaker["audio"].consecutive_failures, 0);
}

#[test]
fn breaker_state_round_trips_through_disk() {
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.json");
    let config = GuardConfig::default();

    let mut state = GuardState::new(&clock);
    for _ in 0..3 {
        state.record_failure("report", &config, &clock);
    }
    state.save(&path).unwrap();

    let state = GuardState::load_or_default(&path, &clock);
    assert!(!state.breaker_decision("report", &clock).is_allow());
    assert_eq!(state.breaker["report"].consecutive_failures, 3);
    assert!(state.breaker["report"].open_until.is_some());
}

#[test]
fn disabled_threshold_never_opens() {
    let clock = clock();
    let config = GuardConfig {
        breaker_consecutive_failures: 0,
        ..GuardConfig::default()
    };
    let mut state = GuardState::new(&clock);
    for _ in 0..10 {
        state.record_failure("slides", &config, &clock);
    }
    assert!(state.breaker_decision("slides", &clock).is_allow());
}
