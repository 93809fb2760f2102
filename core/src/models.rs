//! Compile task data model
//!
//! Value types shared by every component: tasks and their compiler
//! configuration, results with parsed diagnostics, toolchain descriptions,
//! cache entries and history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BuildsmithError;

/// Opaque task identifier
pub type TaskId = Uuid;

/// Target language of a compile task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLanguage {
    C,
    Cpp,
    Rust,
    Go,
    Java,
    Kotlin,
    Python,
    JavaScript,
    TypeScript,
}

impl TargetLanguage {
    pub const ALL: [TargetLanguage; 9] = [
        TargetLanguage::C,
        TargetLanguage::Cpp,
        TargetLanguage::Rust,
        TargetLanguage::Go,
        TargetLanguage::Java,
        TargetLanguage::Kotlin,
        TargetLanguage::Python,
        TargetLanguage::JavaScript,
        TargetLanguage::TypeScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetLanguage::C => "c",
            TargetLanguage::Cpp => "cpp",
            TargetLanguage::Rust => "rust",
            TargetLanguage::Go => "go",
            TargetLanguage::Java => "java",
            TargetLanguage::Kotlin => "kotlin",
            TargetLanguage::Python => "python",
            TargetLanguage::JavaScript => "javascript",
            TargetLanguage::TypeScript => "typescript",
        }
    }
}

impl fmt::Display for TargetLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetLanguage {
    type Err = BuildsmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "c" => Ok(TargetLanguage::C),
            "cpp" | "c++" | "cxx" => Ok(TargetLanguage::Cpp),
            "rust" | "rs" => Ok(TargetLanguage::Rust),
            "go" | "golang" => Ok(TargetLanguage::Go),
            "java" => Ok(TargetLanguage::Java),
            "kotlin" | "kt" => Ok(TargetLanguage::Kotlin),
            "python" | "py" => Ok(TargetLanguage::Python),
            "javascript" | "js" => Ok(TargetLanguage::JavaScript),
            "typescript" | "ts" => Ok(TargetLanguage::TypeScript),
            other => Err(BuildsmithError::InvalidTask(format!(
                "Unsupported target language: {}",
                other
            ))),
        }
    }
}

/// Optimization level passed to the compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    #[default]
    None,
    Basic,
    Aggressive,
}

impl OptimizationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationLevel::None => "none",
            OptimizationLevel::Basic => "basic",
            OptimizationLevel::Aggressive => "aggressive",
        }
    }
}

/// Compiler invocation settings
///
/// Immutable once attached to a task. Part of the task's cache identity, so
/// [`CompilerConfiguration::canonical_string`] must stay deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompilerConfiguration {
    /// Compiler command name (resolved through the sandbox PATH)
    pub command: String,
    /// Extra arguments, in order
    pub arguments: Vec<String>,
    /// Primary output artifact
    pub output_path: Option<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    pub library_paths: Vec<PathBuf>,
    /// Preprocessor defines; ordering is irrelevant so a sorted map is used
    pub defines: BTreeMap<String, String>,
    pub optimization: OptimizationLevel,
    pub debug_symbols: bool,
    pub warnings_as_errors: bool,
}

impl CompilerConfiguration {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_include_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_paths.push(path.into());
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn with_define(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(key.into(), value.into());
        self
    }

    pub fn with_optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization = level;
        self
    }

    pub fn with_debug_symbols(mut self, enabled: bool) -> Self {
        self.debug_symbols = enabled;
        self
    }

    pub fn with_warnings_as_errors(mut self, enabled: bool) -> Self {
        self.warnings_as_errors = enabled;
        self
    }

    /// Canonical serialization used for fingerprinting.
    ///
    /// Every value is written as `tag:len:value` so arguments containing
    /// separators cannot alias a different argument list.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        push_field(&mut out, "command", &self.command);
        for arg in &self.arguments {
            push_field(&mut out, "arg", arg);
        }
        if let Some(ref output) = self.output_path {
            push_field(&mut out, "output", &output.display().to_string());
        }
        for path in &self.include_paths {
            push_field(&mut out, "include", &path.display().to_string());
        }
        for path in &self.library_paths {
            push_field(&mut out, "lib", &path.display().to_string());
        }
        for (key, value) in &self.defines {
            push_field(&mut out, "define", key);
            push_field(&mut out, "value", value);
        }
        push_field(&mut out, "opt", self.optimization.as_str());
        push_field(&mut out, "debug", if self.debug_symbols { "true" } else { "false" });
        push_field(&mut out, "werror", if self.warnings_as_errors { "true" } else { "false" });
        out
    }
}

fn push_field(out: &mut String, tag: &str, value: &str) {
    out.push_str(&format!("{}:{}:{}\n", tag, value.len(), value));
}

/// Scheduling priority; higher runs first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal lifecycle transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Success)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolchainMissing,
    ProcessSpawn,
    NonZeroExit,
    Cancelled,
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A warning or error parsed from compiler output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileMessage {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl CompileMessage {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: 0,
            column: 0,
            message: message.into(),
            severity,
            suggestions: Vec::new(),
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self.column = column;
        self
    }
}

impl fmt::Display for CompileMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.file {
            Some(ref file) => write!(f, "{}:{}:{}: {}", file, self.line, self.column, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Throughput figures for one compilation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub compile_time_ms: u64,
    pub file_count: usize,
    pub line_count: usize,
    /// Source lines compiled per second
    pub lines_per_second: f64,
}

impl PerformanceMetrics {
    pub fn new(compile_time_ms: u64, file_count: usize, line_count: usize) -> Self {
        let lines_per_second = if compile_time_ms == 0 {
            0.0
        } else {
            line_count as f64 * 1000.0 / compile_time_ms as f64
        };
        Self {
            compile_time_ms,
            file_count,
            line_count,
            lines_per_second,
        }
    }
}

/// Inter-file dependencies discovered while compiling
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: BTreeSet<String>,
    pub edges: BTreeSet<(String, String)>,
}

impl DependencyGraph {
    pub fn add_node(&mut self, node: impl Into<String>) {
        self.nodes.insert(node.into());
    }

    /// Add a directed edge `from -> to`, registering both endpoints
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.edges.insert((from, to));
    }

    pub fn dependencies_of(&self, node: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, _)| from == node)
            .map(|(_, to)| to.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Outcome of one task execution
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    pub output_files: Vec<PathBuf>,
    pub warnings: Vec<CompileMessage>,
    pub errors: Vec<CompileMessage>,
    pub execution_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub metrics: PerformanceMetrics,
    pub dependency_graph: DependencyGraph,
    /// Served from the cache without invoking the toolchain
    pub from_cache: bool,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    /// Human readable summary of the terminal state
    pub summary: String,
}

impl CompileResult {
    /// Result for a task that never produced compiler output
    pub fn failed(kind: FailureKind, summary: impl Into<String>) -> Self {
        Self {
            success: false,
            failure: Some(kind),
            summary: summary.into(),
            ..Default::default()
        }
    }

    /// Build the summary line from the result's own fields
    pub fn describe(&self) -> String {
        if self.success {
            let outputs = if self.output_files.is_empty() {
                "no output files".to_string()
            } else {
                self.output_files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!(
                "Compiled in {}ms{} ({} warning(s)): {}",
                self.execution_time_ms,
                if self.from_cache { " from cache" } else { "" },
                self.warnings.len(),
                outputs
            )
        } else {
            let first_error = self
                .errors
                .first()
                .map(|e| format!(": {}", e))
                .unwrap_or_default();
            format!(
                "Failed with {} error(s) and {} warning(s){}",
                self.errors.len(),
                self.warnings.len(),
                first_error
            )
        }
    }
}

/// A unit of compilation work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileTask {
    pub id: TaskId,
    pub project_path: PathBuf,
    /// Source files, order is significant for fingerprinting
    pub source_files: Vec<PathBuf>,
    pub language: TargetLanguage,
    pub config: CompilerConfiguration,
    pub dependencies: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub priority: TaskPriority,

    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub result: Option<CompileResult>,
}

impl CompileTask {
    pub fn new(
        project_path: impl Into<PathBuf>,
        source_files: Vec<PathBuf>,
        language: TargetLanguage,
        config: CompilerConfiguration,
    ) -> Self {
        let project_path = project_path.into();
        Self {
            id: Uuid::new_v4(),
            working_dir: project_path.clone(),
            project_path,
            source_files,
            language,
            config,
            dependencies: Vec::new(),
            environment: BTreeMap::new(),
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock run time, once the task has started and finished
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Installed toolchain description for one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainInfo {
    pub language: TargetLanguage,
    pub name: String,
    pub version: Option<String>,
    pub install_path: Option<PathBuf>,
    pub installed: bool,
    pub capabilities: BTreeSet<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl ToolchainInfo {
    pub fn not_installed(language: TargetLanguage, name: impl Into<String>) -> Self {
        Self {
            language,
            name: name.into(),
            version: None,
            install_path: None,
            installed: false,
            capabilities: BTreeSet::new(),
            installed_at: None,
            last_used: None,
        }
    }
}

/// Stored cache value for one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub result: CompileResult,
    pub artifacts: Vec<PathBuf>,
    pub extra: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: u64,
    /// Serialized entry size plus artifact sizes at save time
    pub size_bytes: u64,
}

/// Snapshot of the machine a task ran on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceContext {
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub hostname: Option<String>,
}

impl DeviceContext {
    pub fn capture() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            hostname: std::env::var("HOSTNAME").ok(),
        }
    }
}

/// Immutable audit record of one finished task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileHistoryEntry {
    pub id: Uuid,
    pub task: CompileTask,
    pub result: CompileResult,
    pub device: DeviceContext,
    pub environment_hash: String,
    /// Source path -> content hash at completion time
    pub file_hashes: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl CompileHistoryEntry {
    pub fn new(
        task: CompileTask,
        result: CompileResult,
        environment_hash: String,
        file_hashes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            result,
            device: DeviceContext::capture(),
            environment_hash,
            file_hashes,
            recorded_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn language(&self) -> TargetLanguage {
        self.task.language
    }

    pub fn project_path(&self) -> &std::path::Path {
        &self.task.project_path
    }
}
