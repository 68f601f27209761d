//! Subprocess helpers for adapter scripts: run, insist on exit 0, parse one
//! JSON payload out of the output.

use crate::core::error::BinderyError;
use crate::core::exec::{tail, CliRunner};
use crate::core::parse;
use serde_json::{json, Value};
use std::time::Duration;

/// Run and parse any JSON payload; a non-zero exit becomes an adapter error
/// carrying the command and output tails.
pub fn run_json_any(
    runner: &dyn CliRunner,
    cmd: &[String],
    timeout: Duration,
) -> Result<Value, BinderyError> {
    let result = runner.run(cmd, timeout)?;
    if !result.success() {
        return Err(BinderyError::AdapterError(
            json!({
                "cmd": cmd,
                "exit_code": result.exit_code,
                "stdout": tail(&result.stdout, 1200),
                "stderr": tail(&result.stderr, 1200),
            })
            .to_string(),
        ));
    }
    parse::parse_json_payload(&result.stdout)
}

/// Like [`run_json_any`] but requires a JSON object.
pub fn run_json_dict(
    runner: &dyn CliRunner,
    cmd: &[String],
    timeout: Duration,
) -> Result<serde_json::Map<String, Value>, BinderyError> {
    match run_json_any(runner, cmd, timeout)? {
        Value::Object(map) => Ok(map),
        _ => Err(BinderyError::AdapterError(format!(
            "expected JSON object from command output: {}",
            cmd.join(" ")
        ))),
    }
}
