//! Compile result construction

use buildsmith_core::error::BuildsmithError;
use buildsmith_core::models::{
    CacheEntry, CompileMessage, CompileResult, CompileTask, FailureKind, PerformanceMetrics,
    Severity,
};
use buildsmith_tools::OutputSummary;
use std::path::PathBuf;
use std::time::Duration;

/// What the worker observed about one finished process
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub execution_time: Duration,
    pub peak_memory_bytes: u64,
    pub output: OutputSummary,
    pub stderr: String,
}

/// Result for a process that ran to exit
///
/// `output_files` are the task's outputs that exist after the run;
/// `source_lines` feeds the throughput metric.
pub fn from_process(
    task: &CompileTask,
    outcome: ProcessOutcome,
    output_files: Vec<PathBuf>,
    source_lines: usize,
) -> CompileResult {
    let success = outcome.exit_code == 0;
    let execution_time_ms = outcome.execution_time.as_millis() as u64;
    let mut errors = outcome.output.errors;
    if !success && errors.is_empty() {
        errors.push(fallback_error(outcome.exit_code, &outcome.stderr));
    }

    let mut dependency_graph = outcome.output.dependency_graph;
    for file in &outcome.output.files {
        dependency_graph.add_node(file.clone());
    }

    let mut result = CompileResult {
        success,
        output_files: if success { output_files } else { Vec::new() },
        warnings: outcome.output.warnings,
        errors,
        execution_time_ms,
        peak_memory_bytes: outcome.peak_memory_bytes,
        metrics: PerformanceMetrics::new(execution_time_ms, task.source_files.len(), source_lines),
        dependency_graph,
        from_cache: false,
        exit_code: Some(outcome.exit_code),
        failure: (!success).then_some(FailureKind::NonZeroExit),
        summary: String::new(),
    };
    result.summary = result.describe();
    result
}

/// Result served from a cache entry without running anything
pub fn from_cache(entry: &CacheEntry) -> CompileResult {
    let mut result = entry.result.clone();
    result.from_cache = true;
    result.execution_time_ms = 0;
    result.peak_memory_bytes = 0;
    if result.output_files.is_empty() {
        result.output_files = entry.artifacts.clone();
    }
    result.summary = result.describe();
    result
}

/// Result for a task that failed before or instead of running
pub fn from_error(kind: FailureKind, error: &BuildsmithError) -> CompileResult {
    let mut result = CompileResult::failed(kind, error.to_string());
    result
        .errors
        .push(CompileMessage::new(Severity::Error, error.to_string()));
    result
}

pub fn cancelled(execution_time: Option<Duration>) -> CompileResult {
    let mut result = CompileResult::failed(FailureKind::Cancelled, "Cancelled");
    if let Some(elapsed) = execution_time {
        result.execution_time_ms = elapsed.as_millis() as u64;
        result.summary = format!("Cancelled after {}ms", result.execution_time_ms);
    }
    result
}

fn fallback_error(exit_code: i32, stderr: &str) -> CompileMessage {
    let detail = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| format!("exited with code {}: {}", exit_code, l))
        .unwrap_or_else(|| format!("exited with code {}", exit_code));
    CompileMessage::new(Severity::Error, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildsmith_core::models::{CompilerConfiguration, TargetLanguage};
    use buildsmith_tools::summarize;

    fn task() -> CompileTask {
        CompileTask::new(
            "/proj",
            vec![PathBuf::from("main.c")],
            TargetLanguage::C,
            CompilerConfiguration::new("clang"),
        )
    }

    fn outcome(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
        ProcessOutcome {
            exit_code,
            execution_time: Duration::from_millis(200),
            peak_memory_bytes: 4096,
            output: summarize([stdout, stderr]),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_success_result() {
        let result = from_process(
            &task(),
            outcome(0, "compiling main.c\n", "main.c:3:1: warning: unused variable 'x'\n"),
            vec![PathBuf::from("/proj/app")],
            100,
        );
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.output_files, vec![PathBuf::from("/proj/app")]);
        assert_eq!(result.metrics.lines_per_second, 500.0);
        assert!(result.dependency_graph.nodes.contains("main.c"));
        assert!(result.summary.starts_with("Compiled in 200ms"));
    }

    #[test]
    fn test_failure_without_diagnostics_uses_stderr_tail() {
        let result = from_process(&task(), outcome(2, "", "ld returned 1 exit status\n\n"), vec![], 0);
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::NonZeroExit));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("ld returned 1 exit status"));
        assert!(result.output_files.is_empty());
    }

    #[test]
    fn test_cache_result_reports_zero_time() {
        let mut original = from_process(&task(), outcome(0, "", ""), vec![], 10);
        original.execution_time_ms = 1200;
        let entry = CacheEntry {
            key: "k".to_string(),
            result: original,
            artifacts: vec![PathBuf::from("/proj/app")],
            extra: Default::default(),
            created_at: chrono::Utc::now(),
            last_accessed: chrono::Utc::now(),
            hit_count: 1,
            size_bytes: 0,
        };
        let cached = from_cache(&entry);
        assert!(cached.from_cache);
        assert_eq!(cached.execution_time_ms, 0);
        assert_eq!(cached.output_files, vec![PathBuf::from("/proj/app")]);
    }
}
