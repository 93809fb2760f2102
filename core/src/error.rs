//! Buildsmith error taxonomy

use std::io;

use crate::models::TargetLanguage;

pub type Result<T> = std::result::Result<T, BuildsmithError>;

/// Errors surfaced by the compile orchestration core
#[derive(Debug, thiserror::Error)]
pub enum BuildsmithError {
    /// Rejected at submission; the task never enters the queue
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Toolchain for '{0}' is not installed")]
    ToolchainMissing(TargetLanguage),

    #[error("Failed to spawn process '{command}': {reason}")]
    ProcessSpawn { command: String, reason: String },

    /// Non-fatal: output was truncated from the front
    #[error("Output buffer exceeded {limit} bytes, discarded {discarded} bytes")]
    OutputOverflow { limit: usize, discarded: usize },

    #[error("Cache lookup failed: {0}")]
    CacheLookup(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    #[error("Installation of '{language}' failed at {progress}%: {reason}")]
    InstallFailed {
        language: TargetLanguage,
        progress: u8,
        reason: String,
    },

    #[error("Uninstall of '{language}' failed: {reason}")]
    UninstallFailed {
        language: TargetLanguage,
        reason: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BuildsmithError {
    /// Whether the error should change a task's verdict
    pub fn affects_task_status(&self) -> bool {
        matches!(
            self,
            BuildsmithError::ToolchainMissing(_) | BuildsmithError::ProcessSpawn { .. }
        )
    }
}
