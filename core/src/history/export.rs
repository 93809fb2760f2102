//! History snapshots for backup and sharing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use super::analytics::HistoryStatistics;
use crate::error::{BuildsmithError, Result};
use crate::models::{CompileHistoryEntry, TaskStatus};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    Json,
    Yaml,
}

impl FromStr for ExportFormat {
    type Err = BuildsmithError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "yaml" | "yml" => Ok(ExportFormat::Yaml),
            other => Err(BuildsmithError::Validation(format!(
                "Unsupported export format: {}",
                other
            ))),
        }
    }
}

/// Serialized history plus the aggregates computed at export time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub entries: Vec<CompileHistoryEntry>,
    pub statistics: HistoryStatistics,
}

/// Outcome of merging a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    /// Entries whose id already existed locally
    pub skipped: usize,
}

impl HistorySnapshot {
    pub fn new(entries: Vec<CompileHistoryEntry>, statistics: HistoryStatistics) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            exported_at: Utc::now(),
            entries,
            statistics,
        }
    }

    pub fn serialize(&self, format: ExportFormat) -> Result<String> {
        Ok(match format {
            ExportFormat::Json => serde_json::to_string_pretty(self)?,
            ExportFormat::Yaml => serde_yaml::to_string(self)?,
        })
    }

    /// Parse and validate a snapshot
    pub fn parse(data: &str, format: ExportFormat) -> Result<Self> {
        let snapshot: HistorySnapshot = match format {
            ExportFormat::Json => serde_json::from_str(data)?,
            ExportFormat::Yaml => serde_yaml::from_str(data)?,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Reject snapshots whose entries could not have been produced locally
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(BuildsmithError::Validation(format!(
                "Unsupported snapshot schema version {} (expected {})",
                self.schema_version, SNAPSHOT_SCHEMA_VERSION
            )));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.id.is_nil() {
                return Err(BuildsmithError::Validation("History entry with nil id".to_string()));
            }
            if !seen.insert(entry.id) {
                return Err(BuildsmithError::Validation(format!(
                    "Duplicate history entry id {}",
                    entry.id
                )));
            }
            if !entry.status().is_terminal() {
                return Err(BuildsmithError::Validation(format!(
                    "History entry {} has non-terminal status {}",
                    entry.id,
                    entry.status()
                )));
            }
            if entry.result.success != (entry.status() == TaskStatus::Success) {
                return Err(BuildsmithError::Validation(format!(
                    "History entry {} result does not match status {}",
                    entry.id,
                    entry.status()
                )));
            }
            if entry.task.source_files.is_empty() {
                return Err(BuildsmithError::Validation(format!(
                    "History entry {} has no source files",
                    entry.id
                )));
            }
        }
        Ok(())
    }
}
