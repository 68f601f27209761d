//! Subprocess execution with wall-clock timeouts and failure classification.
//!
//! Every external CLI call routes through [`CliRunner`]. The trait seam keeps
//! the poll/retry machinery testable without spawning real processes.

use crate::core::error::BinderyError;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code, `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr-first error text, matching the wrapped CLI's habit of putting
    /// the useful message on whichever stream it feels like.
    pub fn error_text(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }

    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Truncate to the last `limit` bytes on a char boundary, for error payloads.
pub fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Heuristic failure classification derived from command output text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    TransientNetwork,
}

/// Case-insensitive substring sets that tag a failed execution as
/// auth-related or transient-network. Configurable so new CLI error strings
/// can be added without touching the retry logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSignatures {
    pub auth: Vec<String>,
    pub transient_network: Vec<String>,
}

impl Default for FailureSignatures {
    fn default() -> Self {
        FailureSignatures {
            auth: [
                "no authentication found",
                "please run: nlm login",
                "authentication expired",
                "profile not found",
                "login required",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            transient_network: [
                "unexpected_eof_while_reading",
                "connecterror",
                "connection reset",
                "timed out",
                "temporary failure",
                "network is unreachable",
                "502",
                "503",
                "504",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl FailureSignatures {
    /// Classify a failed execution. Auth wins over transient when both match.
    pub fn classify(&self, result: &ExecResult) -> Option<FailureKind> {
        let text = result.combined().to_lowercase();
        if self.auth.iter().any(|k| text.contains(k.as_str())) {
            return Some(FailureKind::Auth);
        }
        if self
            .transient_network
            .iter()
            .any(|k| text.contains(k.as_str()))
        {
            return Some(FailureKind::TransientNetwork);
        }
        None
    }
}

/// Runs one argv with a deadline. The seam for scripted test doubles.
pub trait CliRunner {
    fn run(&self, argv: &[String], timeout: Duration) -> Result<ExecResult, BinderyError>;
}

/// Real subprocess runner. Spawns with piped stdio, drains both pipes on
/// helper threads, and kills the child once the deadline passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

const WAIT_TICK: Duration = Duration::from_millis(50);

impl CliRunner for SystemRunner {
    fn run(&self, argv: &[String], timeout: Duration) -> Result<ExecResult, BinderyError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BinderyError::ValidationError("empty argv".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(BinderyError::IoError)?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_handle = std::thread::spawn(move || drain(stdout_pipe));
        let stderr_handle = std::thread::spawn(move || drain(stderr_pipe));

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait().map_err(BinderyError::IoError)? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(BinderyError::Timeout {
                            cmd: argv.join(" "),
                            seconds: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(WAIT_TICK);
                }
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        Ok(ExecResult {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn drain<R: Read>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(stderr: &str) -> ExecResult {
        ExecResult {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classify_auth() {
        let sig = FailureSignatures::default();
        let result = result_with("Error: no authentication found for profile");
        assert_eq!(sig.classify(&result), Some(FailureKind::Auth));
    }

    #[test]
    fn test_classify_transient() {
        let sig = FailureSignatures::default();
        let result = result_with("upstream returned 503 service unavailable");
        assert_eq!(sig.classify(&result), Some(FailureKind::TransientNetwork));
    }

    #[test]
    fn test_classify_auth_wins_over_transient() {
        let sig = FailureSignatures::default();
        let result = result_with("login required after connection reset");
        assert_eq!(sig.classify(&result), Some(FailureKind::Auth));
    }

    #[test]
    fn test_classify_other_failure() {
        let sig = FailureSignatures::default();
        let result = result_with("unknown subcommand");
        assert_eq!(sig.classify(&result), None);
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        let sig = FailureSignatures::default();
        let result = result_with("CONNECTION RESET by peer");
        assert_eq!(sig.classify(&result), Some(FailureKind::TransientNetwork));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "αβγδε";
        let cut = tail(text, 3);
        assert!(text.ends_with(&cut));
        assert!(cut.len() <= 3);
    }

    #[test]
    fn test_error_text_prefers_stderr() {
        let result = ExecResult {
            exit_code: Some(1),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(result.error_text(), "err");

        let result = ExecResult {
            exit_code: Some(1),
            stdout: "out".to_string(),
            stderr: "  ".to_string(),
        };
        assert_eq!(result.error_text(), "out");
    }

    #[test]
    fn test_system_runner_captures_output() {
        let runner = SystemRunner;
        let argv: Vec<String> = ["sh", "-c", "echo hello; echo oops >&2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = runner.run(&argv, Duration::from_secs(10)).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[test]
    fn test_system_runner_times_out() {
        let runner = SystemRunner;
        let argv: Vec<String> = ["sleep", "5"].iter().map(|s| s.to_string()).collect();
        let err = runner.run(&argv, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, BinderyError::Timeout { .. }));
    }
}
