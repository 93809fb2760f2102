//! Aggregates derived from compile history
//!
//! Everything here is recomputed from the full entry list on each call so
//! aggregates can never drift from the underlying log.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{CompileHistoryEntry, TaskStatus};

/// Overall counts and timings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoryStatistics {
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub cache_hits: usize,
    pub total_execution_ms: u64,
    pub average_execution_ms: f64,
    pub success_rate: f64,
    /// Language name -> task count
    pub tasks_by_language: BTreeMap<String, usize>,
    /// Language name -> (error signature -> occurrences)
    pub errors_by_language: BTreeMap<String, BTreeMap<String, usize>>,
}

/// One day of the performance trend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub task_count: usize,
    pub success_count: usize,
    pub average_execution_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUsage {
    pub project_path: String,
    pub task_count: usize,
    pub success_count: usize,
    pub total_execution_ms: u64,
    pub last_used: DateTime<Utc>,
}

/// A recurring failure, grouped by normalized message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub signature: String,
    pub occurrences: usize,
    pub languages: BTreeSet<String>,
    pub projects: BTreeSet<String>,
    /// One raw message carrying this signature
    pub example: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub fn compute_statistics(entries: &[CompileHistoryEntry]) -> HistoryStatistics {
    let mut stats = HistoryStatistics {
        total_tasks: entries.len(),
        ..Default::default()
    };

    for entry in entries {
        match entry.status() {
            TaskStatus::Success => stats.successful_tasks += 1,
            TaskStatus::Failed => stats.failed_tasks += 1,
            TaskStatus::Cancelled => stats.cancelled_tasks += 1,
            _ => {}
        }
        if entry.result.from_cache {
            stats.cache_hits += 1;
        }
        stats.total_execution_ms += entry.result.execution_time_ms;

        let language = entry.language().as_str().to_string();
        *stats.tasks_by_language.entry(language.clone()).or_insert(0) += 1;
        if !entry.result.errors.is_empty() {
            let errors = stats.errors_by_language.entry(language).or_default();
            for error in &entry.result.errors {
                *errors.entry(error_signature(&error.message)).or_insert(0) += 1;
            }
        }
    }

    if stats.total_tasks > 0 {
        stats.average_execution_ms = stats.total_execution_ms as f64 / stats.total_tasks as f64;
        stats.success_rate = stats.successful_tasks as f64 / stats.total_tasks as f64;
    }
    stats
}

/// Daily buckets for the `days` days ending at `today`, oldest first
pub fn performance_trend(
    entries: &[CompileHistoryEntry],
    days: u32,
    today: NaiveDate,
) -> Vec<TrendPoint> {
    if days == 0 {
        return Vec::new();
    }
    let start = today - Duration::days(days as i64 - 1);

    // date -> (count, successes, total ms)
    let mut buckets: BTreeMap<NaiveDate, (usize, usize, u64)> = BTreeMap::new();
    for entry in entries {
        let date = entry.recorded_at.date_naive();
        if date < start || date > today {
            continue;
        }
        let bucket = buckets.entry(date).or_insert((0, 0, 0));
        bucket.0 += 1;
        if entry.status() == TaskStatus::Success {
            bucket.1 += 1;
        }
        bucket.2 += entry.result.execution_time_ms;
    }

    (0..days as i64)
        .map(|offset| {
            let date = start + Duration::days(offset);
            let (task_count, success_count, total_ms) =
                buckets.get(&date).copied().unwrap_or((0, 0, 0));
            TrendPoint {
                date,
                task_count,
                success_count,
                average_execution_ms: if task_count == 0 {
                    0.0
                } else {
                    total_ms as f64 / task_count as f64
                },
            }
        })
        .collect()
}

/// Projects ordered by task count, then most recent use
pub fn top_projects(entries: &[CompileHistoryEntry], limit: usize) -> Vec<ProjectUsage> {
    let mut usage: HashMap<String, ProjectUsage> = HashMap::new();
    for entry in entries {
        let path = entry.project_path().display().to_string();
        let project = usage.entry(path.clone()).or_insert_with(|| ProjectUsage {
            project_path: path,
            task_count: 0,
            success_count: 0,
            total_execution_ms: 0,
            last_used: entry.recorded_at,
        });
        project.task_count += 1;
        if entry.status() == TaskStatus::Success {
            project.success_count += 1;
        }
        project.total_execution_ms += entry.result.execution_time_ms;
        if entry.recorded_at > project.last_used {
            project.last_used = entry.recorded_at;
        }
    }

    let mut projects: Vec<ProjectUsage> = usage.into_values().collect();
    projects.sort_by(|a, b| {
        b.task_count
            .cmp(&a.task_count)
            .then(b.last_used.cmp(&a.last_used))
            .then(a.project_path.cmp(&b.project_path))
    });
    projects.truncate(limit);
    projects
}

/// Group every recorded error by signature, most frequent first
pub fn error_analysis(entries: &[CompileHistoryEntry]) -> Vec<ErrorPattern> {
    let mut patterns: HashMap<String, ErrorPattern> = HashMap::new();
    for entry in entries {
        for error in &entry.result.errors {
            let signature = error_signature(&error.message);
            let pattern = patterns
                .entry(signature.clone())
                .or_insert_with(|| ErrorPattern {
                    signature,
                    occurrences: 0,
                    languages: BTreeSet::new(),
                    projects: BTreeSet::new(),
                    example: error.message.clone(),
                    first_seen: entry.recorded_at,
                    last_seen: entry.recorded_at,
                });
            pattern.occurrences += 1;
            pattern.languages.insert(entry.language().as_str().to_string());
            pattern
                .projects
                .insert(entry.project_path().display().to_string());
            pattern.first_seen = pattern.first_seen.min(entry.recorded_at);
            pattern.last_seen = pattern.last_seen.max(entry.recorded_at);
        }
    }

    let mut patterns: Vec<ErrorPattern> = patterns.into_values().collect();
    patterns.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then(a.signature.cmp(&b.signature))
    });
    patterns
}

/// Normalize an error message so recurring failures group together
///
/// Lowercases, replaces balanced quoted fragments with `'_'` and digit runs
/// with `#`, and collapses whitespace. Unmatched quotes are kept as text.
pub fn error_signature(message: &str) -> String {
    let chars: Vec<char> = message.trim().chars().collect();
    let mut out = String::with_capacity(message.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' if opens_quote(&chars, i) => {
                let close = if c == '`' { '\'' } else { c };
                match chars[i + 1..].iter().position(|&n| n == close || n == c) {
                    Some(offset) => {
                        out.push_str("'_'");
                        i += offset + 2;
                    }
                    None => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            d if d.is_ascii_digit() => {
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                out.push('#');
            }
            w if w.is_whitespace() => {
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                out.push(' ');
            }
            other => {
                out.extend(other.to_lowercase());
                i += 1;
            }
        }
    }
    out
}

/// An apostrophe inside a word is a contraction, not an opening quote
fn opens_quote(chars: &[char], i: usize) -> bool {
    chars[i] != '\'' || i == 0 || !chars[i - 1].is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CompileMessage, CompileResult, CompileTask, CompilerConfiguration, Severity,
        TargetLanguage,
    };

    fn entry_at(
        project: &str,
        language: TargetLanguage,
        status: TaskStatus,
        ms: u64,
        errors: &[&str],
        recorded_at: DateTime<Utc>,
    ) -> CompileHistoryEntry {
        let mut task = CompileTask::new(project, vec!["a".into()], language, CompilerConfiguration::new("cc"));
        task.status = status;
        let result = CompileResult {
            success: status == TaskStatus::Success,
            execution_time_ms: ms,
            errors: errors
                .iter()
                .map(|m| CompileMessage::new(Severity::Error, *m))
                .collect(),
            ..Default::default()
        };
        let mut entry = CompileHistoryEntry::new(task, result, String::new(), BTreeMap::new());
        entry.recorded_at = recorded_at;
        entry
    }

    #[test]
    fn test_error_signature_normalizes_identifiers_and_numbers() {
        assert_eq!(
            error_signature("use of undeclared identifier 'foo' at line 12"),
            error_signature("use of undeclared identifier 'bar' at line 7")
        );
        assert_eq!(error_signature("expected `;`,  found `}`"), "expected '_', found '_'");
    }

    #[test]
    fn test_error_signature_keeps_text_after_apostrophes() {
        assert_eq!(
            error_signature("don't know how to build target 'all'"),
            "don't know how to build target '_'"
        );
        assert_ne!(
            error_signature("can't open file"),
            error_signature("can't link object")
        );
        assert_eq!(error_signature("missing \" before 42"), "missing \" before #");
    }

    #[test]
    fn test_statistics_counts_and_averages() {
        let now = Utc::now();
        let entries = vec![
            entry_at("/a", TargetLanguage::C, TaskStatus::Success, 100, &[], now),
            entry_at("/a", TargetLanguage::C, TaskStatus::Failed, 300, &["missing ';'", "missing ')'"], now),
            entry_at("/b", TargetLanguage::Rust, TaskStatus::Cancelled, 200, &[], now),
        ];
        let stats = compute_statistics(&entries);
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.successful_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.cancelled_tasks, 1);
        assert_eq!(stats.total_execution_ms, 600);
        assert_eq!(stats.average_execution_ms, 200.0);
        assert_eq!(stats.tasks_by_language["c"], 2);
        assert_eq!(stats.errors_by_language["c"]["missing '_'"], 2);
    }

    #[test]
    fn test_trend_buckets_by_day_with_empty_days() {
        let today = Utc::now();
        let entries = vec![
            entry_at("/a", TargetLanguage::C, TaskStatus::Success, 100, &[], today),
            entry_at("/a", TargetLanguage::C, TaskStatus::Failed, 300, &[], today),
            entry_at("/a", TargetLanguage::C, TaskStatus::Success, 50, &[], today - Duration::days(2)),
            entry_at("/a", TargetLanguage::C, TaskStatus::Success, 50, &[], today - Duration::days(30)),
        ];
        let trend = performance_trend(&entries, 3, today.date_naive());
        assert_eq!(trend.len(), 3);
        assert_eq!(trend[0].task_count, 1);
        assert_eq!(trend[1].task_count, 0);
        assert_eq!(trend[2].task_count, 2);
        assert_eq!(trend[2].success_count, 1);
        assert_eq!(trend[2].average_execution_ms, 200.0);
    }

    #[test]
    fn test_top_projects_and_error_analysis() {
        let now = Utc::now();
        let entries = vec![
            entry_at("/a", TargetLanguage::C, TaskStatus::Failed, 1, &["undefined reference to 'x'"], now),
            entry_at("/b", TargetLanguage::Cpp, TaskStatus::Failed, 1, &["undefined reference to 'y'"], now),
            entry_at("/b", TargetLanguage::Cpp, TaskStatus::Failed, 1, &["no such file"], now),
        ];
        let top = top_projects(&entries, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].project_path, "/b");
        assert_eq!(top[0].task_count, 2);

        let patterns = error_analysis(&entries);
        assert_eq!(patterns[0].signature, "undefined reference to '_'");
        assert_eq!(patterns[0].occurrences, 2);
        assert_eq!(patterns[0].projects.len(), 2);
        assert_eq!(patterns[1].occurrences, 1);
    }
}
