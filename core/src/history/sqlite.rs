//! SQLite-backed history store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::store::{HistoryFilter, HistoryStore};
use crate::error::Result;
use crate::models::CompileHistoryEntry;

/// Bind parameter for dynamically built WHERE clauses
enum BindValue {
    Text(String),
    Int(i64),
}

/// History store keeping one row per entry, with the entry body as JSON
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the history table with required indexes
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS compile_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                recorded_at INTEGER NOT NULL,
                project_path TEXT NOT NULL,
                language TEXT NOT NULL,
                status TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                entry TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_recorded_at ON compile_history(recorded_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_project ON compile_history(project_path)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_language ON compile_history(language)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn decode(row: &SqliteRow) -> Result<CompileHistoryEntry> {
        Ok(serde_json::from_str(row.get::<&str, _>("entry"))?)
    }

    fn build_where(filter: &HistoryFilter) -> (String, Vec<BindValue>) {
        let mut where_clauses = vec!["1=1"];
        let mut bind_params = Vec::new();

        if let Some(ref project) = filter.project_path {
            where_clauses.push("project_path = ?");
            bind_params.push(BindValue::Text(project.display().to_string()));
        }
        if let Some(language) = filter.language {
            where_clauses.push("language = ?");
            bind_params.push(BindValue::Text(language.as_str().to_string()));
        }
        if let Some(status) = filter.status {
            where_clauses.push("status = ?");
            bind_params.push(BindValue::Text(status.as_str().to_string()));
        }
        if let Some(since) = filter.since {
            where_clauses.push("recorded_at >= ?");
            bind_params.push(BindValue::Int(since.timestamp_millis()));
        }
        if let Some(until) = filter.until {
            where_clauses.push("recorded_at <= ?");
            bind_params.push(BindValue::Int(until.timestamp_millis()));
        }

        (where_clauses.join(" AND "), bind_params)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, entry: CompileHistoryEntry) -> Result<()> {
        let entry_json = serde_json::to_string(&entry)?;
        sqlx::query(
            r#"
            INSERT INTO compile_history
            (id, recorded_at, project_path, language, status, success, execution_time_ms, entry)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.recorded_at.timestamp_millis())
        .bind(entry.project_path().display().to_string())
        .bind(entry.language().as_str())
        .bind(entry.status().as_str())
        .bind(entry.result.success)
        .bind(entry.result.execution_time_ms as i64)
        .bind(&entry_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CompileHistoryEntry>> {
        let row = sqlx::query("SELECT entry FROM compile_history WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<CompileHistoryEntry>> {
        let (where_clause, bind_params) = Self::build_where(filter);
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT entry FROM compile_history WHERE {} ORDER BY recorded_at DESC, seq DESC LIMIT ?",
            where_clause
        );

        let mut query = sqlx::query(&sql);
        for param in bind_params {
            query = match param {
                BindValue::Text(s) => query.bind(s),
                BindValue::Int(i) => query.bind(i),
            };
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn all(&self) -> Result<Vec<CompileHistoryEntry>> {
        let rows = sqlx::query("SELECT entry FROM compile_history ORDER BY recorded_at ASC, seq ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM compile_history WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM compile_history WHERE recorded_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_oldest(&self, count: usize) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM compile_history WHERE seq IN (SELECT seq FROM compile_history ORDER BY recorded_at ASC, seq ASC LIMIT ?)",
        )
        .bind(count as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM compile_history")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM compile_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CompileResult, CompileTask, CompilerConfiguration, TargetLanguage, TaskStatus,
    };
    use crate::storage::open_pool;
    use std::collections::BTreeMap;

    fn entry(project: &str, language: TargetLanguage, status: TaskStatus) -> CompileHistoryEntry {
        let mut task = CompileTask::new(
            project,
            vec!["main.src".into()],
            language,
            CompilerConfiguration::new("cc"),
        );
        task.status = status;
        let result = CompileResult {
            success: status == TaskStatus::Success,
            execution_time_ms: 10,
            ..Default::default()
        };
        CompileHistoryEntry::new(task, result, "env".to_string(), BTreeMap::new())
    }

    async fn open_store(dir: &tempfile::TempDir) -> SqliteHistoryStore {
        let pool = open_pool(&dir.path().join("history.db")).await.unwrap();
        let store = SqliteHistoryStore::new(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_append_query_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.append(entry("/p/a", TargetLanguage::C, TaskStatus::Success)).await.unwrap();
        store.append(entry("/p/a", TargetLanguage::Rust, TaskStatus::Failed)).await.unwrap();
        store.append(entry("/p/b", TargetLanguage::C, TaskStatus::Success)).await.unwrap();

        let project_a = store.query(&HistoryFilter::for_project("/p/a")).await.unwrap();
        assert_eq!(project_a.len(), 2);
        // Most recent first
        assert_eq!(project_a[0].language(), TargetLanguage::Rust);

        let c_only = store
            .query(&HistoryFilter::for_language(TargetLanguage::C).with_limit(1))
            .await
            .unwrap();
        assert_eq!(c_only.len(), 1);
        assert_eq!(c_only[0].project_path(), std::path::Path::new("/p/b"));

        assert_eq!(store.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_get_delete_and_bulk_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let first = entry("/p", TargetLanguage::Go, TaskStatus::Success);
        let first_id = first.id;
        store.append(first).await.unwrap();
        store.append(entry("/p", TargetLanguage::Go, TaskStatus::Failed)).await.unwrap();
        store.append(entry("/p", TargetLanguage::Go, TaskStatus::Cancelled)).await.unwrap();

        assert!(store.get(first_id).await.unwrap().is_some());
        assert!(store.delete(first_id).await.unwrap());
        assert!(!store.delete(first_id).await.unwrap());

        assert_eq!(store.delete_oldest(1).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.clear().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ordering_follows_recorded_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.append(entry("/p/new", TargetLanguage::C, TaskStatus::Success)).await.unwrap();
        let mut old = entry("/p/old", TargetLanguage::C, TaskStatus::Success);
        old.recorded_at = Utc::now() - chrono::Duration::days(3);
        store.append(old).await.unwrap();

        let newest_first = store.query(&HistoryFilter::default()).await.unwrap();
        assert_eq!(newest_first[0].project_path(), std::path::Path::new("/p/new"));
        let all = store.all().await.unwrap();
        assert_eq!(all[0].project_path(), std::path::Path::new("/p/old"));

        assert_eq!(store.delete_oldest(1).await.unwrap(), 1);
        let remaining = store.all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].project_path(), std::path::Path::new("/p/new"));
    }
}
