//! Cache persistence collaborator

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::models::CacheEntry;

/// Key-value storage behind the cache manager
///
/// Implementations must be safe for concurrent use from several workers;
/// reads and writes only need to be atomic per key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite the entry stored under `entry.key`
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    async fn total_bytes(&self) -> Result<u64>;

    /// Entries with the highest hit counts first
    async fn most_used(&self, limit: usize) -> Result<Vec<CacheEntry>>;

    /// Keys of the least recently accessed entries, oldest first
    async fn least_recently_used(&self, limit: usize) -> Result<Vec<String>>;
}

/// In-process cache store
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.len())
    }

    async fn total_bytes(&self) -> Result<u64> {
        Ok(self.entries.iter().map(|e| e.size_bytes).sum())
    }

    async fn most_used(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        let mut entries: Vec<CacheEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| b.hit_count.cmp(&a.hit_count).then(a.key.cmp(&b.key)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn least_recently_used(&self, limit: usize) -> Result<Vec<String>> {
        let mut keys: Vec<(chrono::DateTime<chrono::Utc>, String)> = self
            .entries
            .iter()
            .map(|e| (e.last_accessed, e.key.clone()))
            .collect();
        keys.sort();
        Ok(keys.into_iter().take(limit).map(|(_, key)| key).collect())
    }
}
