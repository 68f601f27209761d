//! Adapter for the telegram book-fetch script.

use crate::adapters::runner::run_json_dict;
use crate::core::error::BinderyError;
use crate::core::exec::CliRunner;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_FETCH_SCRIPT: &str = "scripts/telegram_fetch.py";
const FETCH_TIMEOUT: Duration = Duration::from_secs(2400);

pub struct TelegramFetchAdapter {
    script_path: PathBuf,
}

impl TelegramFetchAdapter {
    pub fn new(workspace_root: &Path, script: &str) -> Result<Self, BinderyError> {
        let script = if script.trim().is_empty() {
            DEFAULT_FETCH_SCRIPT
        } else {
            script
        };
        let script_path = workspace_root.join(script);
        if !script_path.exists() {
            return Err(BinderyError::AdapterError(format!(
                "telegram fetch script missing: {}",
                script_path.display()
            )));
        }
        Ok(TelegramFetchAdapter { script_path })
    }

    /// Fetch a book by title through the bot. Tries a `uv run` environment
    /// with telethon first, then plain `python3`. The payload must carry a
    /// `status` field.
    pub fn fetch(
        &self,
        runner: &dyn CliRunner,
        book_title: &str,
        tg_bot: &str,
        tg_session_file: &str,
        tg_output_root: &str,
    ) -> Result<serde_json::Map<String, Value>, BinderyError> {
        if book_title.trim().is_empty() {
            return Err(BinderyError::AdapterError(
                "book_title is required for telegram fetch".to_string(),
            ));
        }

        let script = self.script_path.to_string_lossy().to_string();
        let tail_args = |cmd: &mut Vec<String>| {
            cmd.extend([
                "--query".to_string(),
                book_title.to_string(),
                "--bot".to_string(),
                tg_bot.to_string(),
                "--session-file".to_string(),
                tg_session_file.to_string(),
            ]);
            if !tg_output_root.trim().is_empty() {
                cmd.push("--output-root".to_string());
                cmd.push(tg_output_root.to_string());
            }
        };

        let mut uv_cmd = vec![
            "uv".to_string(),
            "run".to_string(),
            "--with".to_string(),
            "telethon".to_string(),
            "python3".to_string(),
            script.clone(),
        ];
        tail_args(&mut uv_cmd);

        let payload = match run_json_dict(runner, &uv_cmd, FETCH_TIMEOUT) {
            Ok(payload) => payload,
            Err(_) => {
                let mut py_cmd = vec!["python3".to_string(), script];
                tail_args(&mut py_cmd);
                run_json_dict(runner, &py_cmd, FETCH_TIMEOUT)?
            }
        };

        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if status.is_empty() {
            return Err(BinderyError::AdapterError(
                "telegram fetch response missing status".to_string(),
            ));
        }
        Ok(payload)
    }
}
