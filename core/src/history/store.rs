//! History persistence collaborator

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{CompileHistoryEntry, TargetLanguage, TaskStatus};

/// Query filters for history lookups
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub project_path: Option<PathBuf>,
    pub language: Option<TargetLanguage>,
    pub status: Option<TaskStatus>,
    /// Only entries recorded at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only entries recorded at or before this instant
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn for_project(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: Some(project_path.into()),
            ..Default::default()
        }
    }

    pub fn for_language(language: TargetLanguage) -> Self {
        Self {
            language: Some(language),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &CompileHistoryEntry) -> bool {
        if let Some(ref project) = self.project_path {
            if entry.project_path() != project.as_path() {
                return false;
            }
        }
        if let Some(language) = self.language {
            if entry.language() != language {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status() != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.recorded_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.recorded_at > until {
                return false;
            }
        }
        true
    }
}

/// Append-only row storage for history entries
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: CompileHistoryEntry) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<CompileHistoryEntry>>;

    /// Matching entries, most recent first
    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<CompileHistoryEntry>>;

    /// Every entry ordered by `recorded_at`, oldest first
    async fn all(&self) -> Result<Vec<CompileHistoryEntry>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Remove the `count` entries with the earliest `recorded_at`
    async fn delete_oldest(&self, count: usize) -> Result<u64>;

    async fn clear(&self) -> Result<u64>;

    async fn count(&self) -> Result<usize>;
}

/// In-process history store, kept sorted by `recorded_at`
#[derive(Default)]
pub struct MemoryHistoryStore {
    entries: RwLock<Vec<CompileHistoryEntry>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: CompileHistoryEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        // Equal timestamps keep arrival order
        let pos = entries.partition_point(|e| e.recorded_at <= entry.recorded_at);
        entries.insert(pos, entry);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CompileHistoryEntry>> {
        Ok(self.entries.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<CompileHistoryEntry>> {
        let entries = self.entries.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<CompileHistoryEntry>> {
        Ok(self.entries.read().await.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() != before)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.recorded_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn delete_oldest(&self, count: usize) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let n = count.min(entries.len());
        entries.drain(..n);
        Ok(n as u64)
    }

    async fn clear(&self) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let n = entries.len() as u64;
        entries.clear();
        Ok(n)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}
