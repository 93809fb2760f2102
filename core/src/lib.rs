//! Buildsmith Core Module
//!
//! Data model, error taxonomy, configuration and the two persistence-backed
//! managers of the compile orchestrator: the content-addressed result cache
//! and the compile history with its derived statistics.

pub mod cache;
pub mod config;
pub mod error;
pub mod hashing;
pub mod history;
pub mod models;
pub mod storage;

pub use cache::{CacheManager, CacheStatistics, CacheStore, MemoryCacheStore, SqliteCacheStore};
pub use config::{BuildsmithConfig, ConfigFormat, ConfigManager};
pub use error::{BuildsmithError, Result};
pub use history::{HistoryFilter, HistoryManager, HistoryStore, MemoryHistoryStore, SqliteHistoryStore};
pub use models::{
    CacheEntry, CompileHistoryEntry, CompileMessage, CompileResult, CompileTask,
    CompilerConfiguration, DependencyGraph, DeviceContext, FailureKind, OptimizationLevel,
    PerformanceMetrics, Severity, TargetLanguage, TaskId, TaskPriority, TaskStatus, ToolchainInfo,
};
