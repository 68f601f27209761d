//! Shared test doubles: a scripted CLI runner and a manual clock.
#![allow(dead_code)]

use bindery::core::error::BinderyError;
use bindery::core::exec::{CliRunner, ExecResult};
use bindery::core::time::Clock;
use chrono::{DateTime, Local};
use std::cell::RefCell;
use std::time::Duration;

pub fn ok(stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn fail(stderr: &str) -> ExecResult {
    ExecResult {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

type Rule = (String, Box<dyn Fn(&[String]) -> ExecResult>);

/// Responds to subprocess invocations by substring-matching the joined
/// argv against registered rules, first match wins. Records every call.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: RefCell<Vec<Rule>>,
    pub calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        ScriptedRunner::default()
    }

    pub fn on(&self, pattern: &str, result: ExecResult) {
        self.rules
            .borrow_mut()
            .push((pattern.to_string(), Box::new(move |_| result.clone())));
    }

    pub fn on_fn(&self, pattern: &str, handler: impl Fn(&[String]) -> ExecResult + 'static) {
        self.rules
            .borrow_mut()
            .push((pattern.to_string(), Box::new(handler)));
    }

    pub fn call_count(&self, pattern: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }
}

impl CliRunner for ScriptedRunner {
    fn run(&self, argv: &[String], _timeout: Duration) -> Result<ExecResult, BinderyError> {
        let joined = argv.join(" ");
        self.calls.borrow_mut().push(joined.clone());
        for (pattern, handler) in self.rules.borrow().iter() {
            if joined.contains(pattern.as_str()) {
                return Ok(handler(argv));
            }
        }
        Ok(fail(&format!("no scripted rule for: {joined}")))
    }
}

/// Deterministic clock; `sleep` advances it instead of blocking.
pub struct ManualClock {
    now: RefCell<DateTime<Local>>,
}

impl ManualClock {
    pub fn at(ts: &str) -> Self {
        let parsed = DateTime::parse_from_rfc3339(ts).expect("valid rfc3339 in test");
        ManualClock {
            now: RefCell::new(parsed.with_timezone(&Local)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.borrow_mut();
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.borrow()
    }

    fn sleep(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.advance(delta);
    }
}
