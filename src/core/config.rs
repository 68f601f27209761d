//! Shared constants, path resolution, and the JSON defaults file.

use crate::core::error::BinderyError;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const ENV_WORKSPACE_ROOT: &str = "BINDERY_WORKSPACE";
pub const ENV_DB_PATH: &str = "BINDERY_DB_PATH";
pub const ENV_CONFIG: &str = "BINDERY_CONFIG";
pub const ENV_TELEGRAM_SESSION: &str = "TG_SESSION_FILE";

pub const RUN_TMP_DIRNAME: &str = "book-to-artifact";
pub const DEFAULT_CONFIG_FILENAME: &str = "bindery.defaults.json";
pub const DEFAULT_TELEGRAM_SESSION_PATH: &str = "~/.bindery/credentials/telegram/main";

/// Expand a leading `~/` against `$HOME`.
pub fn expand_user(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// `~/.bindery/state` — guard state and the metadata database live here.
pub fn state_root() -> PathBuf {
    expand_user("~/.bindery/state")
}

/// Default guard state/events locations for the standalone `generate`
/// surface (one per installation, not per run).
pub fn default_guard_state_file() -> PathBuf {
    state_root().join("guarded-generator").join("state.json")
}

pub fn default_guard_events_file() -> PathBuf {
    state_root().join("guarded-generator").join("events.jsonl")
}

/// Resolve the workspace root: explicit flag, then `BINDERY_WORKSPACE`,
/// then the config default, then the current directory.
pub fn resolve_workspace_root(explicit: &str, defaults: &serde_json::Map<String, Value>) -> PathBuf {
    let candidates = [
        explicit.trim().to_string(),
        std::env::var(ENV_WORKSPACE_ROOT).unwrap_or_default(),
        defaults
            .get("workspace_root")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    ];
    for candidate in candidates {
        let candidate = candidate.trim();
        if !candidate.is_empty() {
            return expand_user(candidate);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Resolve the defaults-file path: explicit flag, then `BINDERY_CONFIG`,
/// then `<workspace>/bindery.defaults.json`.
pub fn resolve_config_path(explicit: &str, workspace_root: &Path) -> PathBuf {
    let explicit = explicit.trim();
    if !explicit.is_empty() {
        return expand_user(explicit);
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG) {
        let env_path = env_path.trim().to_string();
        if !env_path.is_empty() {
            return expand_user(&env_path);
        }
    }
    workspace_root.join(DEFAULT_CONFIG_FILENAME)
}

/// Load the JSON defaults file. A missing file is an empty object; a
/// present-but-invalid file is an error.
pub fn load_defaults(path: &Path) -> Result<serde_json::Map<String, Value>, BinderyError> {
    if !path.exists() {
        return Ok(serde_json::Map::new());
    }
    let raw = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(BinderyError::ValidationError(format!(
            "config must be a JSON object: {}",
            path.display()
        ))),
        Err(e) => Err(BinderyError::ValidationError(format!(
            "config parse error in {}: {e}",
            path.display()
        ))),
    }
}

/// First non-empty string among flag value, env var, and config key.
pub fn str_choice(
    flag: &str,
    env: &str,
    defaults: &serde_json::Map<String, Value>,
    key: &str,
) -> String {
    let flag = flag.trim();
    if !flag.is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env) {
        let value = value.trim().to_string();
        if !value.is_empty() {
            return value;
        }
    }
    defaults
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_user() {
        if std::env::var_os("HOME").is_some() {
            let expanded = expand_user("~/x/y");
            assert!(!expanded.to_string_lossy().starts_with('~'));
            assert!(expanded.ends_with("x/y"));
        }
        assert_eq!(expand_user("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_load_defaults_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = load_defaults(&dir.path().join("nope.json")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_load_defaults_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[1,2]").unwrap();
        assert!(load_defaults(&path).is_err());
    }

    #[test]
    fn test_str_choice_prefers_flag() {
        let mut defaults = serde_json::Map::new();
        defaults.insert("k".to_string(), json!("from-config"));
        assert_eq!(
            str_choice("flag", "BINDERY_TEST_UNSET_ENV", &defaults, "k"),
            "flag"
        );
        assert_eq!(
            str_choice("", "BINDERY_TEST_UNSET_ENV", &defaults, "k"),
            "from-config"
        );
    }

}
