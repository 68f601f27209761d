//! Client for the external `nlm` notebook CLI.
//!
//! Wraps every invocation with the retry policy the artifact lifecycle
//! depends on: up to three attempts, one automatic re-authentication
//! side-flow on auth-classified failures, linear backoff on
//! transient-network failures, immediate abort on anything else.

use crate::core::error::BinderyError;
use crate::core::exec::{tail, CliRunner, ExecResult, FailureKind, FailureSignatures};
use crate::core::parse;
use crate::core::time::Clock;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 3;
const LOGIN_TIMEOUT: Duration = Duration::from_secs(180);
const CHECK_TIMEOUT: Duration = Duration::from_secs(120);
const VERSION_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(180);
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);
const SOURCE_ADD_TIMEOUT: Duration = Duration::from_secs(900);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const HELP_TIMEOUT: Duration = Duration::from_secs(40);

const SOURCE_KEYS: &[&str] = &["sources", "items", "results", "data"];
const STUDIO_KEYS: &[&str] = &["artifacts", "items", "results", "data"];

/// Re-authentication side-flow target: a local browser-control endpoint.
#[derive(Debug, Clone)]
pub struct AuthRefreshConfig {
    pub provider: String,
    pub cdp_url: String,
}

impl Default for AuthRefreshConfig {
    fn default() -> Self {
        AuthRefreshConfig {
            provider: "cdp".to_string(),
            cdp_url: "http://127.0.0.1:18800".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NlmConfig {
    pub profile: String,
    pub auto_refresh_auth: bool,
    pub refresh: AuthRefreshConfig,
    pub signatures: FailureSignatures,
}

impl Default for NlmConfig {
    fn default() -> Self {
        NlmConfig {
            profile: "default".to_string(),
            auto_refresh_auth: true,
            refresh: AuthRefreshConfig::default(),
            signatures: FailureSignatures::default(),
        }
    }
}

pub struct NlmClient<'a> {
    pub config: NlmConfig,
    runner: &'a dyn CliRunner,
    clock: &'a dyn Clock,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl<'a> NlmClient<'a> {
    pub fn new(config: NlmConfig, runner: &'a dyn CliRunner, clock: &'a dyn Clock) -> Self {
        NlmClient {
            config,
            runner,
            clock,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock
    }

    /// One raw invocation, no retries.
    pub fn run_raw(&self, cmd: &[String], timeout: Duration) -> Result<ExecResult, BinderyError> {
        self.runner.run(cmd, timeout)
    }

    /// Guarded invocation: retry with auth refresh and transient backoff.
    /// Returns the last `ExecResult` even when it failed; timeouts propagate
    /// as errors.
    pub fn run_guarded(&self, cmd: &[String], timeout: Duration) -> Result<ExecResult, BinderyError> {
        let mut last = ExecResult::default();
        for attempt in 0..RETRY_ATTEMPTS {
            let result = self.runner.run(cmd, timeout)?;
            if result.success() {
                return Ok(result);
            }
            last = result;

            let kind = self.config.signatures.classify(&last);

            if self.config.auto_refresh_auth
                && kind == Some(FailureKind::Auth)
                && self.refresh_auth()?
            {
                let retry = self.runner.run(cmd, timeout)?;
                if retry.success() {
                    return Ok(retry);
                }
                last = retry;
            }

            if kind == Some(FailureKind::TransientNetwork) && attempt < RETRY_ATTEMPTS - 1 {
                self.clock
                    .sleep(Duration::from_secs(u64::from(2 * (attempt + 1))));
                continue;
            }

            return Ok(last);
        }
        Ok(last)
    }

    /// One-shot re-authentication through the configured CDP endpoint,
    /// verified with a follow-up `login --check`.
    pub fn refresh_auth(&self) -> Result<bool, BinderyError> {
        let login = self.run_raw(
            &argv(&[
                "nlm",
                "login",
                "--profile",
                &self.config.profile,
                "--provider",
                &self.config.refresh.provider,
                "--cdp-url",
                &self.config.refresh.cdp_url,
            ]),
            LOGIN_TIMEOUT,
        )?;
        if !login.success() {
            return Ok(false);
        }
        let check = self.run_raw(
            &argv(&["nlm", "login", "--check", "--profile", &self.config.profile]),
            CHECK_TIMEOUT,
        )?;
        Ok(check.success())
    }

    pub fn version_check(&self) -> Result<ExecResult, BinderyError> {
        self.run_raw(&argv(&["nlm", "--version"]), VERSION_TIMEOUT)
    }

    pub fn check_auth(&self) -> Result<ExecResult, BinderyError> {
        self.run_guarded(
            &argv(&["nlm", "login", "--check", "--profile", &self.config.profile]),
            Duration::from_secs(90),
        )
    }

    pub fn source_rows(
        &self,
        notebook_id: &str,
    ) -> Result<Vec<serde_json::Map<String, Value>>, BinderyError> {
        let result = self.run_guarded(
            &argv(&[
                "nlm",
                "source",
                "list",
                notebook_id,
                "--json",
                "--profile",
                &self.config.profile,
            ]),
            LIST_TIMEOUT,
        )?;
        if !result.success() {
            return Err(BinderyError::AdapterError(tail(&result.error_text(), 600)));
        }
        let payload = parse::parse_json_payload(&result.stdout)?;
        Ok(parse::rows_from_any(&payload, SOURCE_KEYS))
    }

    pub fn source_ids(&self, notebook_id: &str) -> Result<Vec<String>, BinderyError> {
        Ok(self
            .source_rows(notebook_id)?
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn studio_rows(
        &self,
        notebook_id: &str,
    ) -> Result<Vec<serde_json::Map<String, Value>>, BinderyError> {
        let result = self.run_guarded(
            &argv(&[
                "nlm",
                "studio",
                "status",
                notebook_id,
                "--full",
                "--json",
                "--profile",
                &self.config.profile,
            ]),
            LIST_TIMEOUT,
        )?;
        if !result.success() {
            return Err(BinderyError::AdapterError(tail(&result.error_text(), 600)));
        }
        let payload = parse::parse_json_payload(&result.stdout)?;
        Ok(parse::rows_from_any(&payload, STUDIO_KEYS))
    }

    pub fn create_artifact(
        &self,
        artifact_type: &str,
        notebook_id: &str,
        source_ids: &[String],
    ) -> Result<ExecResult, BinderyError> {
        let mut cmd = argv(&[
            "nlm",
            artifact_type,
            "create",
            notebook_id,
            "--confirm",
            "--profile",
            &self.config.profile,
        ]);
        if !source_ids.is_empty() {
            cmd.push("--source-ids".to_string());
            cmd.push(source_ids.join(","));
        }
        self.run_guarded(&cmd, CREATE_TIMEOUT)
    }

    pub fn source_add(
        &self,
        notebook_id: &str,
        text: &str,
        title: &str,
    ) -> Result<ExecResult, BinderyError> {
        self.run_guarded(
            &argv(&[
                "nlm",
                "source",
                "add",
                notebook_id,
                "--text",
                text,
                "--title",
                title,
                "--wait",
                "--profile",
                &self.config.profile,
            ]),
            SOURCE_ADD_TIMEOUT,
        )
    }

    /// Create a notebook, tolerating both response shapes: structured JSON
    /// with an id field, or free text carrying `ID: <uuid>` / a bare UUID.
    pub fn create_notebook(&self, title: &str) -> Result<String, BinderyError> {
        let json_cmd = argv(&[
            "nlm",
            "notebook",
            "create",
            title,
            "--json",
            "--profile",
            &self.config.profile,
        ]);
        if let Ok(result) = self.run_guarded(&json_cmd, CREATE_TIMEOUT) {
            if result.success() {
                if let Ok(payload) = parse::parse_json_payload(&result.stdout) {
                    if let Some(id) = parse::notebook_id_from_payload(&payload) {
                        return Ok(id);
                    }
                }
            }
        }

        let cmd = argv(&[
            "nlm",
            "notebook",
            "create",
            title,
            "--profile",
            &self.config.profile,
        ]);
        let result = self.run_guarded(&cmd, CREATE_TIMEOUT)?;
        if !result.success() {
            return Err(BinderyError::AdapterError(
                serde_json::json!({
                    "cmd": cmd,
                    "exit_code": result.exit_code,
                    "stdout": tail(&result.stdout, 1200),
                    "stderr": tail(&result.stderr, 1200),
                })
                .to_string(),
            ));
        }

        parse::parse_notebook_id_from_text(&result.combined()).ok_or_else(|| {
            BinderyError::AdapterError(format!(
                "unable to parse notebook id from create output: {}",
                tail(&result.combined(), 1200)
            ))
        })
    }

    /// Probe whether `nlm download` accepts `--profile` on this install.
    pub fn download_supports_profile(&self, kind: &str) -> bool {
        let probe = self.run_raw(&argv(&["nlm", "download", kind, "--help"]), HELP_TIMEOUT);
        match probe {
            Ok(result) => result.combined().contains("--profile"),
            Err(_) => false,
        }
    }

    pub fn download(
        &self,
        kind: &str,
        notebook_id: &str,
        artifact_id: &str,
        out_path: &Path,
        with_profile: bool,
    ) -> Result<ExecResult, BinderyError> {
        let mut cmd = argv(&[
            "nlm",
            "download",
            kind,
            notebook_id,
            "--id",
            artifact_id,
            "--output",
        ]);
        cmd.push(out_path.to_string_lossy().to_string());
        cmd.push("--no-progress".to_string());
        if with_profile {
            cmd.push("--profile".to_string());
            cmd.push(self.config.profile.clone());
        }
        self.run_raw(&cmd, DOWNLOAD_TIMEOUT)
    }
}
