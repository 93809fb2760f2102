//! Compile history and statistics
//!
//! Append-only audit log of finished tasks. Aggregates are computed on demand
//! from the stored entries rather than maintained incrementally.

mod analytics;
mod export;
mod sqlite;
mod store;

pub use analytics::{
    error_signature, ErrorPattern, HistoryStatistics, ProjectUsage, TrendPoint,
};
pub use export::{ExportFormat, HistorySnapshot, ImportReport, SNAPSHOT_SCHEMA_VERSION};
pub use sqlite::SqliteHistoryStore;
pub use store::{HistoryFilter, HistoryStore, MemoryHistoryStore};

use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::HistorySettings;
use crate::error::Result;
use crate::models::CompileHistoryEntry;

pub struct HistoryManager {
    store: Arc<dyn HistoryStore>,
    settings: HistorySettings,
}

impl HistoryManager {
    pub fn new(store: Arc<dyn HistoryStore>, settings: HistorySettings) -> Self {
        Self { store, settings }
    }

    pub fn in_memory(settings: HistorySettings) -> Self {
        Self::new(Arc::new(MemoryHistoryStore::new()), settings)
    }

    /// Append a finished task's record
    pub async fn record_history(&self, entry: CompileHistoryEntry) -> Result<()> {
        debug!(
            task_id = %entry.task.id,
            status = %entry.status(),
            "Recording history entry {}",
            entry.id
        );
        self.store.append(entry).await
    }

    pub async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<CompileHistoryEntry>> {
        self.store.query(filter).await
    }

    pub async fn get_history_entry(&self, id: Uuid) -> Result<Option<CompileHistoryEntry>> {
        self.store.get(id).await
    }

    pub async fn delete_history(&self, id: Uuid) -> Result<bool> {
        self.store.delete(id).await
    }

    pub async fn clear_all(&self) -> Result<u64> {
        let removed = self.store.clear().await?;
        info!("Cleared {} history entries", removed);
        Ok(removed)
    }

    /// Apply the retention policy: age limit first, then entry count
    pub async fn prune(&self) -> Result<u64> {
        let mut removed = 0;
        if self.settings.retention_days > 0 {
            let cutoff = Utc::now() - Duration::days(self.settings.retention_days as i64);
            removed += self.store.delete_before(cutoff).await?;
        }
        let count = self.store.count().await?;
        if count > self.settings.max_entries {
            removed += self
                .store
                .delete_oldest(count - self.settings.max_entries)
                .await?;
        }
        if removed > 0 {
            info!("Pruned {} history entries", removed);
        }
        Ok(removed)
    }

    pub async fn get_statistics(&self) -> Result<HistoryStatistics> {
        let entries = self.store.all().await?;
        Ok(analytics::compute_statistics(&entries))
    }

    /// Per-day trend over the last `days` days, oldest first
    pub async fn get_performance_trend(&self, days: u32) -> Result<Vec<TrendPoint>> {
        let entries = self.store.all().await?;
        Ok(analytics::performance_trend(
            &entries,
            days,
            Utc::now().date_naive(),
        ))
    }

    pub async fn get_top_projects(&self, limit: usize) -> Result<Vec<ProjectUsage>> {
        let entries = self.store.all().await?;
        Ok(analytics::top_projects(&entries, limit))
    }

    pub async fn get_error_analysis(&self) -> Result<Vec<ErrorPattern>> {
        let entries = self.store.all().await?;
        Ok(analytics::error_analysis(&entries))
    }

    /// Serialize every entry plus current aggregates
    pub async fn export(&self, format: ExportFormat) -> Result<String> {
        let entries = self.store.all().await?;
        let statistics = analytics::compute_statistics(&entries);
        let count = entries.len();
        let data = HistorySnapshot::new(entries, statistics).serialize(format)?;
        info!("Exported {} history entries as {:?}", count, format);
        Ok(data)
    }

    /// Validate a snapshot, then merge entries not already present
    ///
    /// Nothing is merged when validation fails.
    pub async fn import(&self, data: &str, format: ExportFormat) -> Result<ImportReport> {
        let snapshot = HistorySnapshot::parse(data, format)?;

        let existing: HashSet<Uuid> = self.store.all().await?.iter().map(|e| e.id).collect();
        let mut entries = snapshot.entries;
        entries.sort_by_key(|e| e.recorded_at);

        let mut report = ImportReport::default();
        for entry in entries {
            if existing.contains(&entry.id) {
                report.skipped += 1;
                continue;
            }
            self.store.append(entry).await?;
            report.imported += 1;
        }
        info!(
            "Imported {} history entries ({} already present)",
            report.imported, report.skipped
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildsmithError;
    use crate::models::{
        CompileMessage, CompileResult, CompileTask, CompilerConfiguration, Severity,
        TargetLanguage, TaskStatus,
    };
    use std::collections::BTreeMap;

    fn entry(project: &str, status: TaskStatus) -> CompileHistoryEntry {
        let mut task = CompileTask::new(
            project,
            vec!["main.c".into()],
            TargetLanguage::C,
            CompilerConfiguration::new("cc"),
        );
        task.status = status;
        let mut result = CompileResult {
            success: status == TaskStatus::Success,
            execution_time_ms: 40,
            ..Default::default()
        };
        if status == TaskStatus::Failed {
            result
                .errors
                .push(CompileMessage::new(Severity::Error, "expected ';'").at("main.c", 3, 9));
        }
        CompileHistoryEntry::new(task, result, "env".to_string(), BTreeMap::new())
    }

    fn manager() -> HistoryManager {
        HistoryManager::in_memory(HistorySettings::default())
    }

    #[tokio::test]
    async fn test_record_and_query() {
        let history = manager();
        let first = entry("/p/one", TaskStatus::Success);
        let first_id = first.id;
        history.record_history(first).await.unwrap();
        history.record_history(entry("/p/two", TaskStatus::Failed)).await.unwrap();

        let all = history.get_history(&HistoryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].project_path(), std::path::Path::new("/p/two"));

        let one = history
            .get_history(&HistoryFilter::for_project("/p/one"))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert!(history.get_history_entry(first_id).await.unwrap().is_some());

        assert!(history.delete_history(first_id).await.unwrap());
        assert!(history.get_history_entry(first_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_enforces_max_entries() {
        let history = HistoryManager::in_memory(HistorySettings {
            max_entries: 2,
            retention_days: 0,
        });
        for _ in 0..5 {
            history.record_history(entry("/p", TaskStatus::Success)).await.unwrap();
        }
        assert_eq!(history.prune().await.unwrap(), 3);
        assert_eq!(history.get_statistics().await.unwrap().total_tasks, 2);
    }

    #[tokio::test]
    async fn test_prune_drops_imported_older_entries_first() {
        let history = HistoryManager::in_memory(HistorySettings {
            max_entries: 2,
            retention_days: 0,
        });
        let recent = entry("/p/recent", TaskStatus::Success);
        let recent_id = recent.id;
        history.record_history(recent).await.unwrap();
        history.record_history(entry("/p/recent", TaskStatus::Failed)).await.unwrap();

        let old: Vec<_> = (1..=2)
            .map(|days| {
                let mut e = entry("/p/old", TaskStatus::Success);
                e.recorded_at = Utc::now() - Duration::days(days);
                e
            })
            .collect();
        let data = HistorySnapshot::new(old, HistoryStatistics::default())
            .serialize(ExportFormat::Json)
            .unwrap();
        assert_eq!(history.import(&data, ExportFormat::Json).await.unwrap().imported, 2);

        let newest = history.get_history(&HistoryFilter::default().with_limit(1)).await.unwrap();
        assert_eq!(newest[0].project_path(), std::path::Path::new("/p/recent"));

        assert_eq!(history.prune().await.unwrap(), 2);
        let kept = history.get_history(&HistoryFilter::default()).await.unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|e| e.project_path() == std::path::Path::new("/p/recent")));
        assert!(history.get_history_entry(recent_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_export_import_merges_new_entries() {
        let source = manager();
        source.record_history(entry("/p", TaskStatus::Success)).await.unwrap();
        source.record_history(entry("/p", TaskStatus::Failed)).await.unwrap();

        for format in [ExportFormat::Json, ExportFormat::Yaml] {
            let data = source.export(format).await.unwrap();

            let target = manager();
            let report = target.import(&data, format).await.unwrap();
            assert_eq!(report, ImportReport { imported: 2, skipped: 0 });

            let again = target.import(&data, format).await.unwrap();
            assert_eq!(again, ImportReport { imported: 0, skipped: 2 });

            let stats = target.get_statistics().await.unwrap();
            assert_eq!(stats.failed_tasks, 1);
            assert_eq!(
                target.get_error_analysis().await.unwrap()[0].signature,
                "expected '_'"
            );
        }
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_snapshot() {
        let mut bad = entry("/p", TaskStatus::Success);
        bad.result.success = false;
        let snapshot = HistorySnapshot::new(vec![bad], HistoryStatistics::default());
        let data = snapshot.serialize(ExportFormat::Json).unwrap();

        let target = manager();
        let err = target.import(&data, ExportFormat::Json).await.unwrap_err();
        assert!(matches!(err, BuildsmithError::Validation(_)));
        assert_eq!(target.get_statistics().await.unwrap().total_tasks, 0);

        let mut wrong_version = HistorySnapshot::new(vec![], HistoryStatistics::default());
        wrong_version.schema_version = 99;
        let data = wrong_version.serialize(ExportFormat::Yaml).unwrap();
        assert!(target.import(&data, ExportFormat::Yaml).await.is_err());
    }

    #[tokio::test]
    async fn test_top_projects_and_trend() {
        let history = manager();
        history.record_history(entry("/a", TaskStatus::Success)).await.unwrap();
        history.record_history(entry("/b", TaskStatus::Success)).await.unwrap();
        history.record_history(entry("/b", TaskStatus::Failed)).await.unwrap();

        let top = history.get_top_projects(5).await.unwrap();
        assert_eq!(top[0].project_path, "/b");
        assert_eq!(top.len(), 2);

        let trend = history.get_performance_trend(7).await.unwrap();
        assert_eq!(trend.len(), 7);
        assert_eq!(trend.last().unwrap().task_count, 3);
    }
}
