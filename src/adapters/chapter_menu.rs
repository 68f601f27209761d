//! Adapter for the chapter-menu script: EPUB extraction plus chapter
//! scoring/ranking, out of core scope. Bindery only validates the payload
//! shape it consumes.

use crate::adapters::runner::run_json_dict;
use crate::core::error::BinderyError;
use crate::core::exec::CliRunner;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MENU_SCRIPT: &str = "scripts/chapter_menu.py";
const PREPARE_TIMEOUT: Duration = Duration::from_secs(2400);

/// Ranking knobs passed through to the script untouched.
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub top_n: u32,
    pub batch_size: u32,
    pub select_mode: String,
    pub allow_random: bool,
    pub seed: u64,
    pub max_per_bucket: u32,
    pub random_pool_size: u32,
    pub w_len: f64,
    pub w_topic: f64,
    pub w_visual: f64,
    pub issue_label: String,
    pub out_dir: String,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        PrepareOptions {
            top_n: 6,
            batch_size: 3,
            select_mode: "score".to_string(),
            allow_random: false,
            seed: 42,
            max_per_bucket: 0,
            random_pool_size: 12,
            w_len: 0.2,
            w_topic: 0.45,
            w_visual: 0.35,
            issue_label: String::new(),
            out_dir: String::new(),
        }
    }
}

pub struct ChapterMenuAdapter {
    workspace_root: PathBuf,
    script_path: PathBuf,
}

impl ChapterMenuAdapter {
    pub fn new(workspace_root: &Path, script: &str) -> Result<Self, BinderyError> {
        let script = if script.trim().is_empty() {
            DEFAULT_MENU_SCRIPT
        } else {
            script
        };
        let script_path = workspace_root.join(script);
        if !script_path.exists() {
            return Err(BinderyError::AdapterError(format!(
                "chapter-menu script missing: {}",
                script_path.display()
            )));
        }
        Ok(ChapterMenuAdapter {
            workspace_root: workspace_root.to_path_buf(),
            script_path,
        })
    }

    /// Run extraction + ranking over an EPUB or a pre-ranked JSON file.
    pub fn prepare(
        &self,
        runner: &dyn CliRunner,
        epub: &str,
        ranked_json: &str,
        options: &PrepareOptions,
    ) -> Result<serde_json::Map<String, Value>, BinderyError> {
        let mut cmd = vec![
            "python3".to_string(),
            self.script_path.to_string_lossy().to_string(),
            "--workspace-root".to_string(),
            self.workspace_root.to_string_lossy().to_string(),
            "--top-n".to_string(),
            options.top_n.to_string(),
            "--batch-size".to_string(),
            options.batch_size.to_string(),
            "--select-mode".to_string(),
            options.select_mode.clone(),
            "--seed".to_string(),
            options.seed.to_string(),
            "--max-per-bucket".to_string(),
            options.max_per_bucket.to_string(),
            "--random-pool-size".to_string(),
            options.random_pool_size.to_string(),
            "--w-len".to_string(),
            options.w_len.to_string(),
            "--w-topic".to_string(),
            options.w_topic.to_string(),
            "--w-visual".to_string(),
            options.w_visual.to_string(),
        ];
        if options.select_mode == "random" && options.allow_random {
            cmd.push("--allow-random".to_string());
        }

        if !ranked_json.trim().is_empty() {
            cmd.push("--ranked-json".to_string());
            cmd.push(ranked_json.to_string());
        } else if !epub.trim().is_empty() {
            cmd.push("--epub".to_string());
            cmd.push(epub.to_string());
        } else {
            return Err(BinderyError::AdapterError(
                "either epub or ranked_json is required".to_string(),
            ));
        }

        if !options.issue_label.trim().is_empty() {
            cmd.push("--issue-label".to_string());
            cmd.push(options.issue_label.clone());
        }
        if !options.out_dir.trim().is_empty() {
            cmd.push("--out-dir".to_string());
            cmd.push(options.out_dir.clone());
        }

        let payload = run_json_dict(runner, &cmd, PREPARE_TIMEOUT)?;
        validate_prepare_payload(&payload)?;
        Ok(payload)
    }
}

fn validate_prepare_payload(payload: &serde_json::Map<String, Value>) -> Result<(), BinderyError> {
    if !payload.get("status").map(Value::is_string).unwrap_or(false) {
        return Err(BinderyError::AdapterError(
            "chapter-menu payload missing status".to_string(),
        ));
    }

    let ranked_ok = payload
        .get("ranked_json")
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if !ranked_ok {
        return Err(BinderyError::AdapterError(
            "chapter-menu payload missing ranked_json".to_string(),
        ));
    }

    if let Some(menu) = payload.get("menu") {
        if !menu.is_null() && !menu.is_array() {
            return Err(BinderyError::AdapterError(
                "chapter-menu payload.menu must be a list".to_string(),
            ));
        }
    }
    Ok(())
}
