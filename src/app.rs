//! Composition root
//!
//! Builds every manager from one [`BuildsmithConfig`] and wires them into the
//! task manager. Nothing here is global; callers own the returned value.

use anyhow::{Context, Result};
use buildsmith_core::cache::{CacheManager, SqliteCacheStore};
use buildsmith_core::config::{BuildsmithConfig, StorageBackend};
use buildsmith_core::history::{HistoryManager, SqliteHistoryStore};
use buildsmith_core::storage::open_pool;
use buildsmith_tools::{ProcessSpawner, TokioProcessSpawner, ToolchainManager};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::execution_engine::TaskManager;

pub struct Buildsmith {
    config: BuildsmithConfig,
    cache: Arc<CacheManager>,
    history: Arc<HistoryManager>,
    toolchains: Arc<ToolchainManager>,
    tasks: TaskManager,
}

impl Buildsmith {
    /// Wire everything up with real OS processes
    pub async fn open(config: BuildsmithConfig) -> Result<Self> {
        Self::with_spawner(config, Arc::new(TokioProcessSpawner::new())).await
    }

    pub async fn with_spawner(
        config: BuildsmithConfig,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

        let (cache, history) = match config.storage.backend {
            StorageBackend::Memory => {
                debug!("Using in-memory storage");
                (
                    CacheManager::in_memory(config.cache.clone()),
                    HistoryManager::in_memory(config.history.clone()),
                )
            }
            StorageBackend::Sqlite => {
                let path = config
                    .storage
                    .database_path
                    .clone()
                    .context("storage.database_path is not set")?;
                let pool = open_pool(&path)
                    .await
                    .with_context(|| format!("Failed to open database {:?}", path))?;

                let cache_store = SqliteCacheStore::new(pool.clone());
                cache_store.init().await.context("Failed to initialize cache table")?;
                let history_store = SqliteHistoryStore::new(pool);
                history_store
                    .init()
                    .await
                    .context("Failed to initialize history table")?;

                (
                    CacheManager::new(Arc::new(cache_store), config.cache.clone()),
                    HistoryManager::new(Arc::new(history_store), config.history.clone()),
                )
            }
        };
        let cache = Arc::new(cache);
        let history = Arc::new(history);

        if config.cache.enabled {
            // Best-effort, a cold cache only costs misses
            if let Err(e) = cache.warmup_cache().await {
                warn!("Cache warmup failed: {}", e);
            }
        }
        match history.prune().await {
            Ok(0) => {}
            Ok(removed) => info!("Pruned {} history entries", removed),
            Err(e) => warn!("History pruning failed: {}", e),
        }

        let toolchains = Arc::new(
            ToolchainManager::from_settings(
                Arc::clone(&spawner),
                config.toolchains.clone(),
                config.output.clone(),
            )
            .context("Invalid toolchain configuration")?,
        );

        let tasks = TaskManager::new(
            spawner,
            Arc::clone(&toolchains),
            Arc::clone(&cache),
            Arc::clone(&history),
            config.engine.clone(),
            config.output.clone(),
        );

        Ok(Self {
            config,
            cache,
            history,
            toolchains,
            tasks,
        })
    }

    pub fn config(&self) -> &BuildsmithConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    pub fn toolchains(&self) -> &Arc<ToolchainManager> {
        &self.toolchains
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildsmith_tools::{ProcessScript, ScriptedSpawner};

    #[tokio::test]
    async fn test_sqlite_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BuildsmithConfig::default();
        config.engine.max_concurrent_tasks = Some(1);
        config.storage.backend = StorageBackend::Sqlite;
        config.storage.database_path = Some(dir.path().join("state").join("buildsmith.db"));

        let spawner = Arc::new(ScriptedSpawner::new(ProcessScript::succeed()));
        let app = Buildsmith::with_spawner(config, spawner).await.unwrap();
        let stats = app.cache().get_cache_statistics().await.unwrap();
        assert_eq!(stats.entry_count, 0);
        assert!(dir.path().join("state").join("buildsmith.db").exists());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = BuildsmithConfig::default();
        config.engine.max_concurrent_tasks = Some(0);
        let spawner = Arc::new(ScriptedSpawner::new(ProcessScript::succeed()));
        assert!(Buildsmith::with_spawner(config, spawner).await.is_err());
    }
}
