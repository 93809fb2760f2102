//! SQLite-backed cache store

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use super::store::CacheStore;
use crate::error::{BuildsmithError, Result};
use crate::models::CacheEntry;

/// Cache store persisting entries as JSON rows
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the cache table and its indexes
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                entry TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                hit_count INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON cache_entries(last_accessed)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_hit_count ON cache_entries(hit_count)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn decode(entry_json: &str, hit_count: i64, last_accessed_ms: i64) -> Result<CacheEntry> {
        let mut entry: CacheEntry = serde_json::from_str(entry_json)?;
        // Access bookkeeping columns are authoritative over the JSON snapshot
        entry.hit_count = hit_count.max(0) as u64;
        if let Some(ts) = Utc.timestamp_millis_opt(last_accessed_ms).single() {
            entry.last_accessed = ts;
        }
        Ok(entry)
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT entry, hit_count, last_accessed FROM cache_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::decode(
                row.get::<&str, _>("entry"),
                row.get("hit_count"),
                row.get("last_accessed"),
            )?)),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let entry_json = serde_json::to_string(&entry)?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, entry, created_at, last_accessed, hit_count, size_bytes)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                entry = excluded.entry,
                created_at = excluded.created_at,
                last_accessed = excluded.last_accessed,
                hit_count = excluded.hit_count,
                size_bytes = excluded.size_bytes
            "#,
        )
        .bind(&entry.key)
        .bind(&entry_json)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.last_accessed.timestamp_millis())
        .bind(entry.hit_count as i64)
        .bind(entry.size_bytes as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn total_bytes(&self) -> Result<u64> {
        let total: Option<i64> = sqlx::query_scalar("SELECT SUM(size_bytes) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    async fn most_used(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT entry, hit_count, last_accessed FROM cache_entries
            ORDER BY hit_count DESC, key ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Self::decode(
                    row.get::<&str, _>("entry"),
                    row.get("hit_count"),
                    row.get("last_accessed"),
                )
            })
            .collect()
    }

    async fn least_recently_used(&self, limit: usize) -> Result<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM cache_entries ORDER BY last_accessed ASC, key ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BuildsmithError::Persistence(format!("LRU scan failed: {}", e)))?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompileResult;
    use crate::storage::open_pool;
    use std::collections::BTreeMap;

    fn entry(key: &str, hits: u64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            result: CompileResult {
                success: true,
                summary: format!("result for {}", key),
                ..Default::default()
            },
            artifacts: vec!["out/a.o".into()],
            extra: BTreeMap::new(),
            created_at: now,
            last_accessed: now,
            hit_count: hits,
            size_bytes: 100,
        }
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCacheStore::new(open_pool(&dir.path().join("cache.db")).await.unwrap());
        store.init().await.unwrap();

        store.put(entry("k1", 0)).await.unwrap();
        let mut updated = entry("k1", 5);
        updated.result.summary = "second".to_string();
        store.put(updated).await.unwrap();

        let loaded = store.get("k1").await.unwrap().unwrap();
        assert_eq!(loaded.result.summary, "second");
        assert_eq!(loaded.hit_count, 5);
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.total_bytes().await.unwrap(), 100);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_most_used_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCacheStore::new(open_pool(&dir.path().join("cache.db")).await.unwrap());
        store.init().await.unwrap();

        store.put(entry("cold", 1)).await.unwrap();
        store.put(entry("hot", 9)).await.unwrap();
        let top = store.most_used(1).await.unwrap();
        assert_eq!(top[0].key, "hot");

        assert!(store.remove("cold").await.unwrap());
        store.clear().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }
}
