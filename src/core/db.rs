use crate::core::config;
use crate::core::error::BinderyError;
use crate::core::schemas;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

const BUSY_TIMEOUT_MS: u64 = 8_000;

/// Open a connection with the store's standing pragmas: busy timeout,
/// WAL journaling, foreign keys, relaxed synchronous.
pub fn db_connect(db_path: &Path) -> Result<Connection, BinderyError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
        .map_err(BinderyError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(BinderyError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(BinderyError::RusqliteError)?;
    conn.execute("PRAGMA synchronous=NORMAL;", [])
        .map_err(BinderyError::RusqliteError)?;
    Ok(conn)
}

/// Resolve the metadata database path: explicit flag, then
/// `BINDERY_DB_PATH`, then `~/.bindery/state/bindery.db`.
pub fn resolve_db_path(explicit: &str) -> PathBuf {
    let explicit = explicit.trim();
    if !explicit.is_empty() {
        return config::expand_user(explicit);
    }
    if let Ok(env_path) = std::env::var(config::ENV_DB_PATH) {
        let env_path = env_path.trim().to_string();
        if !env_path.is_empty() {
            return config::expand_user(&env_path);
        }
    }
    config::state_root().join(schemas::BINDERY_DB_NAME)
}
