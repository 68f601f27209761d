use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BinderyError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Command timed out after {seconds}s: {cmd}")]
    Timeout { cmd: String, seconds: u64 },
    #[error("Authentication error: {0}")]
    AuthError(String),
    #[error("Transient network error: {0}")]
    TransientNetworkError(String),
    #[error("Malformed command output: {0}")]
    MalformedOutput(String),
    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("No artifact id resolved: {0}")]
    NoArtifactId(String),
    #[error("Adapter error: {0}")]
    AdapterError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}
