//! Configuration Management Module
//!
//! File-based configuration for the compile orchestrator with environment
//! variable overrides and validation. The file format (TOML, JSON or YAML) is
//! picked from the file extension.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration file format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    Json,
    #[default]
    Toml,
    Yaml,
}

impl std::str::FromStr for ConfigFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            _ => Err(anyhow!("Unsupported config format: {}", s)),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildsmithConfig {
    pub engine: EngineSettings,
    pub output: OutputSettings,
    pub cache: CacheSettings,
    pub history: HistorySettings,
    pub toolchains: ToolchainSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Worker count; `None` means one worker per available processing unit
    pub max_concurrent_tasks: Option<usize>,
    /// Grace period between terminate and forced kill on cancellation
    pub teardown_grace_ms: u64,
    /// How often a running process's resident memory is sampled
    pub memory_sample_interval_ms: u64,
    /// Capacity of the task snapshot broadcast channel
    pub event_channel_capacity: usize,
    /// Finished tasks kept queryable in memory; older ones are evicted
    pub retain_finished_tasks: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            teardown_grace_ms: 3_000,
            memory_sample_interval_ms: 250,
            event_channel_capacity: 256,
            retain_finished_tasks: 1_000,
        }
    }
}

impl EngineSettings {
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_tasks.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

/// Output stream handler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    /// Hard ceiling on combined buffered stdout + stderr bytes
    pub max_buffer_bytes: usize,
    pub read_chunk_size: usize,
    /// Minimum spacing between heuristic progress events
    pub progress_interval_ms: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 10 * 1024 * 1024,
            read_chunk_size: 8 * 1024,
            progress_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Entries older than this are treated as absent; 0 disables expiry
    pub ttl_seconds: u64,
    pub max_entries: usize,
    /// Check that cached artifacts still exist before reporting a hit
    pub verify_artifacts: bool,
    /// Number of entries `warmup_cache` pulls into memory
    pub warmup_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 7 * 24 * 3600,
            max_entries: 1_000,
            verify_artifacts: false,
            warmup_entries: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistorySettings {
    pub max_entries: usize,
    pub retention_days: u32,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            retention_days: 90,
        }
    }
}

/// Exponential backoff for toolchain install retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.min_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Replacement installer for one language
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallerOverride {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolchainSettings {
    pub install_root: Option<PathBuf>,
    pub retry: RetrySettings,
    /// Keyed by language name (`c`, `rust`, ...)
    pub installers: BTreeMap<String, InstallerOverride>,
    /// Upper bound on one installer, uninstaller or probe run
    pub helper_timeout_ms: u64,
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        Self {
            install_root: None,
            retry: RetrySettings::default(),
            installers: BTreeMap::new(),
            helper_timeout_ms: 30 * 60 * 1_000,
        }
    }
}

impl ToolchainSettings {
    pub fn helper_timeout(&self) -> Duration {
        Duration::from_millis(self.helper_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Where cache entries and history live
///
/// The library default is in-memory; [`ConfigManager`] writes new
/// configuration files with SQLite under the user data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    /// `<data dir>/buildsmith/buildsmith.db`
    pub fn default_database_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("buildsmith").join("buildsmith.db"))
    }

    /// SQLite at the default database path, if the platform has a data directory
    pub fn persistent() -> Option<Self> {
        Self::default_database_path().map(|path| Self {
            backend: StorageBackend::Sqlite,
            database_path: Some(path),
        })
    }

    /// Fill in the default database path for a sqlite backend without one
    pub fn resolve_database_path(&mut self) {
        if self.backend == StorageBackend::Sqlite && self.database_path.is_none() {
            self.database_path = Self::default_database_path();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Directory for daily rolling log files; stderr only when unset
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl BuildsmithConfig {
    /// Validate that configuration values are sensible
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(0) = self.engine.max_concurrent_tasks {
            return Err("engine.max_concurrent_tasks must be > 0".to_string());
        }
        if self.engine.teardown_grace_ms > 60_000 {
            return Err(format!(
                "engine.teardown_grace_ms ({}) exceeds maximum (60000)",
                self.engine.teardown_grace_ms
            ));
        }
        if self.engine.event_channel_capacity == 0 {
            return Err("engine.event_channel_capacity must be > 0".to_string());
        }
        if self.engine.retain_finished_tasks == 0 {
            return Err("engine.retain_finished_tasks must be > 0".to_string());
        }
        if self.output.max_buffer_bytes < 1024 {
            return Err(format!(
                "output.max_buffer_bytes ({}) is too small (minimum 1024)",
                self.output.max_buffer_bytes
            ));
        }
        if self.output.read_chunk_size == 0 {
            return Err("output.read_chunk_size must be > 0".to_string());
        }
        if self.cache.max_entries == 0 {
            return Err("cache.max_entries must be > 0".to_string());
        }
        if self.toolchains.retry.multiplier < 1.0 {
            return Err(format!(
                "toolchains.retry.multiplier ({}) must be >= 1.0",
                self.toolchains.retry.multiplier
            ));
        }
        if self.toolchains.retry.min_delay_ms > self.toolchains.retry.max_delay_ms {
            return Err("toolchains.retry.min_delay_ms exceeds max_delay_ms".to_string());
        }
        if self.toolchains.helper_timeout_ms == 0 {
            return Err("toolchains.helper_timeout_ms must be > 0".to_string());
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.database_path.is_none()
        {
            return Err("storage.database_path is required for the sqlite backend".to_string());
        }
        Ok(())
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config_format: ConfigFormat,
    config: BuildsmithConfig,
}

impl ConfigManager {
    /// Create a configuration manager rooted at the user config directory
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        let config_path = config_dir.join("buildsmith").join("config");
        let config_format = Self::detect_config_format(&config_path);
        Self::open(config_path, config_format)
    }

    /// Create configuration manager with custom path
    ///
    /// The extension of `path` is replaced by the one matching `format`.
    pub fn with_path<P: AsRef<Path>>(path: P, format: ConfigFormat) -> Result<Self> {
        Self::open(path.as_ref().to_path_buf(), format)
    }

    fn open(config_path: PathBuf, config_format: ConfigFormat) -> Result<Self> {
        let mut manager = Self {
            config_path,
            config_format,
            config: BuildsmithConfig::default(),
        };

        if manager.config_exists() {
            manager.load_config()?;
        } else {
            match StorageSettings::persistent() {
                Some(storage) => manager.config.storage = storage,
                None => warn!("No user data directory, cache and history stay in memory"),
            }
            manager.save_config()?;
        }

        manager.apply_env_overrides();
        manager.config.storage.resolve_database_path();
        manager
            .config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

        Ok(manager)
    }

    fn get_config_dir() -> Result<PathBuf> {
        dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))
    }

    /// Detect configuration format based on which file exists
    fn detect_config_format(base_path: &Path) -> ConfigFormat {
        for (ext, format) in [
            ("toml", ConfigFormat::Toml),
            ("json", ConfigFormat::Json),
            ("yaml", ConfigFormat::Yaml),
            ("yml", ConfigFormat::Yaml),
        ] {
            if base_path.with_extension(ext).exists() {
                return format;
            }
        }
        ConfigFormat::Toml
    }

    pub fn config_exists(&self) -> bool {
        self.get_config_file_path().exists()
    }

    pub fn get_config_file_path(&self) -> PathBuf {
        match self.config_format {
            ConfigFormat::Toml => self.config_path.with_extension("toml"),
            ConfigFormat::Json => self.config_path.with_extension("json"),
            ConfigFormat::Yaml => self.config_path.with_extension("yaml"),
        }
    }

    pub fn config(&self) -> &BuildsmithConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BuildsmithConfig {
        &mut self.config
    }

    /// Load configuration from file
    pub fn load_config(&mut self) -> Result<()> {
        let config_file = self.get_config_file_path();

        let content = fs::read_to_string(&config_file)
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", config_file, e))?;

        self.config = match self.config_format {
            ConfigFormat::Toml => toml::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse TOML config: {}", e))?,
            ConfigFormat::Json => serde_json::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse JSON config: {}", e))?,
            ConfigFormat::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse YAML config: {}", e))?,
        };

        info!("Loaded configuration from {:?}", config_file);
        Ok(())
    }

    /// Save configuration to file
    pub fn save_config(&self) -> Result<()> {
        let config_file = self.get_config_file_path();

        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create config directory {:?}: {}", parent, e))?;
        }

        let content = match self.config_format {
            ConfigFormat::Toml => toml::to_string_pretty(&self.config)
                .map_err(|e| anyhow!("Failed to serialize TOML config: {}", e))?,
            ConfigFormat::Json => serde_json::to_string_pretty(&self.config)
                .map_err(|e| anyhow!("Failed to serialize JSON config: {}", e))?,
            ConfigFormat::Yaml => serde_yaml::to_string(&self.config)
                .map_err(|e| anyhow!("Failed to serialize YAML config: {}", e))?,
        };

        fs::write(&config_file, content)
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", config_file, e))?;

        info!("Saved configuration to {:?}", config_file);
        Ok(())
    }

    /// Apply `BUILDSMITH_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = lookup("BUILDSMITH_MAX_CONCURRENT_TASKS").and_then(|v| v.parse().ok()) {
            self.config.engine.max_concurrent_tasks = Some(n);
            debug!("Applied env override for max concurrent tasks");
        }
        if let Some(ms) = lookup("BUILDSMITH_TEARDOWN_GRACE_MS").and_then(|v| v.parse().ok()) {
            self.config.engine.teardown_grace_ms = ms;
            debug!("Applied env override for teardown grace");
        }
        if let Some(bytes) = lookup("BUILDSMITH_OUTPUT_MAX_BYTES").and_then(|v| v.parse().ok()) {
            self.config.output.max_buffer_bytes = bytes;
            debug!("Applied env override for output ceiling");
        }
        if let Some(enabled) = lookup("BUILDSMITH_CACHE_ENABLED").and_then(|v| parse_bool(&v)) {
            self.config.cache.enabled = enabled;
            debug!("Applied env override for cache enabled");
        }
        if let Some(ttl) = lookup("BUILDSMITH_CACHE_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.config.cache.ttl_seconds = ttl;
            debug!("Applied env override for cache ttl");
        }
        if let Some(backend) = lookup("BUILDSMITH_STORAGE_BACKEND") {
            match backend.to_lowercase().as_str() {
                "memory" => self.config.storage.backend = StorageBackend::Memory,
                "sqlite" => self.config.storage.backend = StorageBackend::Sqlite,
                other => debug!("Ignoring unknown storage backend override: {}", other),
            }
        }
        if let Some(path) = lookup("BUILDSMITH_DATABASE_PATH") {
            self.config.storage.database_path = Some(PathBuf::from(path));
            debug!("Applied env override for database path");
        }
        if let Some(level) = lookup("BUILDSMITH_LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = lookup("BUILDSMITH_LOG_JSON").and_then(|v| parse_bool(&v)) {
            self.config.logging.json = json;
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
