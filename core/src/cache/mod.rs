//! Content-addressed compile result cache
//!
//! Maps a task fingerprint (source content hashes + canonical compiler
//! configuration + toolchain version) to a prior [`CompileResult`] and the
//! artifacts it produced. A small in-memory tier sits in front of the
//! persistent [`CacheStore`].
//!
//! Cache failures never decide a task's outcome: lookups that fail degrade to
//! a miss and writes are best-effort.

mod sqlite;
mod store;

pub use sqlite::SqliteCacheStore;
pub use store::{CacheStore, MemoryCacheStore};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;
use crate::error::{BuildsmithError, Result};
use crate::hashing::hash_sources;
use crate::models::{CacheEntry, CompileResult, CompileTask};

/// Hit/miss counters and storage totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub total_bytes: u64,
    pub entry_count: usize,
}

impl CacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    /// Hot entries, keyed by fingerprint
    front: DashMap<String, CacheEntry>,
    settings: CacheSettings,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings) -> Self {
        Self {
            store,
            front: DashMap::new(),
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache backed only by process memory
    pub fn in_memory(settings: CacheSettings) -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()), settings)
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Deterministic fingerprint of a task's cacheable identity
    ///
    /// Fails when a source file cannot be read; callers treat that as a miss.
    pub async fn fingerprint(&self, task: &CompileTask, toolchain_version: &str) -> Result<String> {
        let source_hashes = hash_sources(task)
            .await
            .map_err(|e| BuildsmithError::CacheLookup(format!("hashing sources: {}", e)))?;
        Ok(fingerprint_from_parts(
            source_hashes.iter().map(|(_, hash)| hash.as_str()),
            &task.config.canonical_string(),
            toolchain_version,
        ))
    }

    /// Side-effect free lookup
    pub async fn get_cached_result(&self, key: &str) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.front.get(key) {
            if !self.is_expired(entry.value()) {
                return Ok(Some(entry.value().clone()));
            }
        }
        match self.store.get(key).await? {
            Some(entry) if !self.is_expired(&entry) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Counted lookup on the task execution path
    ///
    /// Increments exactly one of the hit/miss counters. Store failures are
    /// logged and reported as a miss.
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let found = match self.get_cached_result(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(fingerprint = %key, "Cache lookup failed, treating as miss: {}", e);
                None
            }
        };

        let entry = match found {
            Some(entry) if self.settings.verify_artifacts && !artifacts_present(&entry).await => {
                info!(fingerprint = %key, "Cached artifacts missing, invalidating entry");
                if let Err(e) = self.invalidate(key).await {
                    warn!(fingerprint = %key, "Failed to invalidate stale entry: {}", e);
                }
                None
            }
            other => other,
        };

        match entry {
            Some(mut entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                entry.hit_count += 1;
                entry.last_accessed = Utc::now();
                self.front.insert(key.to_string(), entry.clone());
                if let Err(e) = self.store.put(entry.clone()).await {
                    debug!(fingerprint = %key, "Failed to persist access bookkeeping: {}", e);
                }
                debug!(fingerprint = %key, "Cache hit");
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "Cache miss");
                None
            }
        }
    }

    /// Store a result under `key`, replacing any previous entry
    pub async fn save_cache(
        &self,
        key: &str,
        result: &CompileResult,
        artifacts: Vec<PathBuf>,
        extra: BTreeMap<String, String>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut entry = CacheEntry {
            key: key.to_string(),
            result: result.clone(),
            artifacts,
            extra,
            created_at: now,
            last_accessed: now,
            hit_count: 0,
            size_bytes: 0,
        };
        entry.size_bytes = entry_size(&entry).await;

        self.store
            .put(entry.clone())
            .await
            .map_err(|e| BuildsmithError::CacheWrite(e.to_string()))?;
        self.front.insert(key.to_string(), entry);
        debug!(fingerprint = %key, "Saved cache entry");

        self.enforce_capacity().await
    }

    /// Remove a single entry
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let in_front = self.front.remove(key).is_some();
        let in_store = self.store.remove(key).await?;
        Ok(in_front || in_store)
    }

    /// Discard every entry and reset hit/miss counters
    pub async fn clear_all_cache(&self) -> Result<()> {
        self.store.clear().await?;
        self.front.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        info!("Cleared compile cache");
        Ok(())
    }

    pub async fn get_cache_statistics(&self) -> Result<CacheStatistics> {
        Ok(CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            total_bytes: self.store.total_bytes().await?,
            entry_count: self.store.len().await?,
        })
    }

    /// Pull the most used persisted entries into the memory tier
    ///
    /// Returns how many entries were loaded.
    pub async fn warmup_cache(&self) -> Result<usize> {
        let entries = self.store.most_used(self.settings.warmup_entries).await?;
        let mut loaded = 0;
        for entry in entries {
            if self.is_expired(&entry) {
                continue;
            }
            self.front.insert(entry.key.clone(), entry);
            loaded += 1;
        }
        info!("Cache warmup loaded {} entries", loaded);
        Ok(loaded)
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        if self.settings.ttl_seconds == 0 {
            return false;
        }
        let age = Utc::now() - entry.created_at;
        age.num_seconds() > self.settings.ttl_seconds as i64
    }

    async fn enforce_capacity(&self) -> Result<()> {
        let len = self.store.len().await?;
        if len <= self.settings.max_entries {
            return Ok(());
        }
        let excess = len - self.settings.max_entries;
        let victims = self.store.least_recently_used(excess).await?;
        for key in victims {
            self.front.remove(&key);
            self.store.remove(&key).await?;
            debug!(fingerprint = %key, "Evicted least recently used cache entry");
        }
        Ok(())
    }
}

/// Combine per-file hashes, configuration and toolchain version
pub fn fingerprint_from_parts<'a, I>(
    source_hashes: I,
    canonical_config: &str,
    toolchain_version: &str,
) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for hash in source_hashes {
        hasher.update(b"src:");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"cfg:");
    hasher.update(canonical_config.as_bytes());
    hasher.update(b"toolchain:");
    hasher.update(toolchain_version.as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn artifacts_present(entry: &CacheEntry) -> bool {
    for artifact in &entry.artifacts {
        if tokio::fs::metadata(artifact).await.is_err() {
            return false;
        }
    }
    true
}

async fn entry_size(entry: &CacheEntry) -> u64 {
    let mut size = serde_json::to_vec(entry).map(|v| v.len() as u64).unwrap_or(0);
    for artifact in &entry.artifacts {
        if let Ok(meta) = tokio::fs::metadata(artifact).await {
            size += meta.len();
        }
    }
    size
}
