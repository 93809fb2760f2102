//! Line classification and progress estimation for compiler output

use buildsmith_core::models::{CompileMessage, DependencyGraph, Severity};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(_compile_err) => match Regex::new(r"$^") {
            Ok(fallback) => fallback,
            Err(fallback_err) => panic!("hardcoded fallback regex must compile: {fallback_err}"),
        },
    }
}

/// `[ 42%]` as printed by make/cmake/ninja style tools
static PROGRESS_BRACKET: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^\s*\[\s*(\d{1,3})\s*%\s*\]"));
static PROGRESS_BARE: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^\s*(\d{1,3})\s*%(?:\s|$)"));
/// `file:line[:col]: (fatal error|error|warning)[code]: message`, location optional
static DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(
        r"(?i)^\s*(?:(?P<file>[^\s:][^:]*?):(?P<line>\d+):(?:(?P<col>\d+):)?\s*)?(?P<sev>fatal error|error|warning)(?:\[[^\]]*\])?\s*:\s*(?P<msg>.*)$",
    )
});
static SUGGESTION: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"(?i)^\s*(?:[^\s:][^:]*:\d+:(?:\d+:)?\s*)?(?:=\s*)?(?:help|note):\s*(?P<text>.+)$")
});
/// rustc style ` --> src/main.rs:2:5`
static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^\s*-->\s*(?P<file>[^:\s]+):(?P<line>\d+):(?P<col>\d+)"));
static DEPENDENCY: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"(?i)^\s*dependency:\s*(?P<from>\S+)\s*->\s*(?P<to>\S+)"));
static FILE_PROCESSED: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"(?i)^\s*(?:compiling|processing|building)\s+(?:\S+\s+object\s+)?(?P<file>\S+)")
});
static ERROR_KEYWORD: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"(?i)\berror\b"));
static WARNING_KEYWORD: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"(?i)\bwarning\b"));

/// What one line of output means
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Progress(u8),
    Error(CompileMessage),
    Warning(CompileMessage),
    FileProcessed(String),
    /// `help:` / `note:` text for the preceding diagnostic
    Suggestion(String),
    /// Location line for the preceding diagnostic
    Location { file: String, line: u32, column: u32 },
    Dependency { from: String, to: String },
    Plain,
}

fn number(caps: &Captures<'_>, name: &str) -> u32 {
    caps.name(name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn percent(caps: Option<Captures<'_>>) -> Option<u8> {
    caps.and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(|p| *p <= 100)
}

/// Classify a single line, first matching pattern wins
pub fn classify_line(line: &str) -> LineKind {
    if let Some(p) = percent(PROGRESS_BRACKET.captures(line)).or_else(|| percent(PROGRESS_BARE.captures(line))) {
        return LineKind::Progress(p);
    }

    if let Some(caps) = DIAGNOSTIC.captures(line) {
        let severity = if caps
            .name("sev")
            .is_some_and(|m| m.as_str().eq_ignore_ascii_case("warning"))
        {
            Severity::Warning
        } else {
            Severity::Error
        };
        let text = caps.name("msg").map_or("", |m| m.as_str()).trim();
        let mut message = CompileMessage::new(severity, text);
        if let Some(file) = caps.name("file") {
            message = message.at(file.as_str(), number(&caps, "line"), number(&caps, "col"));
        }
        return match severity {
            Severity::Warning => LineKind::Warning(message),
            _ => LineKind::Error(message),
        };
    }

    if let Some(caps) = SUGGESTION.captures(line) {
        return LineKind::Suggestion(caps["text"].trim().to_string());
    }
    if let Some(caps) = LOCATION.captures(line) {
        return LineKind::Location {
            file: caps["file"].to_string(),
            line: number(&caps, "line"),
            column: number(&caps, "col"),
        };
    }
    if let Some(caps) = DEPENDENCY.captures(line) {
        return LineKind::Dependency {
            from: caps["from"].to_string(),
            to: caps["to"].to_string(),
        };
    }
    if let Some(caps) = FILE_PROCESSED.captures(line) {
        return LineKind::FileProcessed(caps["file"].to_string());
    }

    if ERROR_KEYWORD.is_match(line) {
        return LineKind::Error(CompileMessage::new(Severity::Error, line.trim()));
    }
    if WARNING_KEYWORD.is_match(line) {
        return LineKind::Warning(CompileMessage::new(Severity::Warning, line.trim()));
    }
    LineKind::Plain
}

/// Structured extraction over complete output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSummary {
    /// Explicit progress markers in arrival order
    pub progress: Vec<u8>,
    /// Processed files, first occurrence order
    pub files: Vec<String>,
    pub warnings: Vec<CompileMessage>,
    pub errors: Vec<CompileMessage>,
    pub dependency_graph: DependencyGraph,
    pub line_count: usize,
}

impl OutputSummary {
    pub fn final_progress(&self) -> Option<u8> {
        self.progress.iter().copied().max()
    }
}

/// Summarize one or more independent output texts
///
/// Suggestions and location lines attach to the most recent diagnostic of the
/// same text only.
pub fn summarize<'a, I>(texts: I) -> OutputSummary
where
    I: IntoIterator<Item = &'a str>,
{
    let mut summary = OutputSummary::default();

    for text in texts {
        // (is_error, index) of the last diagnostic in this text
        let mut last: Option<(bool, usize)> = None;

        for line in text.lines() {
            summary.line_count += 1;
            match classify_line(line) {
                LineKind::Progress(p) => summary.progress.push(p),
                LineKind::Error(message) => {
                    summary.errors.push(message);
                    last = Some((true, summary.errors.len() - 1));
                }
                LineKind::Warning(message) => {
                    summary.warnings.push(message);
                    last = Some((false, summary.warnings.len() - 1));
                }
                LineKind::FileProcessed(file) => {
                    if !summary.files.contains(&file) {
                        summary.files.push(file);
                    }
                }
                LineKind::Suggestion(text) => {
                    if let Some(message) = last_message(&mut summary, last) {
                        message.suggestions.push(text);
                    }
                }
                LineKind::Location { file, line, column } => {
                    if let Some(message) = last_message(&mut summary, last) {
                        if message.file.is_none() {
                            message.file = Some(file);
                            message.line = line;
                            message.column = column;
                        }
                    }
                }
                LineKind::Dependency { from, to } => summary.dependency_graph.add_edge(from, to),
                LineKind::Plain => {}
            }
        }
    }
    summary
}

fn last_message(summary: &mut OutputSummary, last: Option<(bool, usize)>) -> Option<&mut CompileMessage> {
    match last {
        Some((true, idx)) => summary.errors.get_mut(idx),
        Some((false, idx)) => summary.warnings.get_mut(idx),
        None => None,
    }
}

/// Turns classified lines into monotonic progress percentages
///
/// Explicit markers are reported as they arrive. Without any explicit marker,
/// progress is estimated as `markers * 100 / lines` (capped at 99) at most
/// once per interval. Nothing is reported unless it exceeds the last value.
#[derive(Debug)]
pub struct ProgressTracker {
    interval: Duration,
    last_emitted: Option<u8>,
    explicit_seen: bool,
    markers: usize,
    total_lines: usize,
    last_estimate: Instant,
}

impl ProgressTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: None,
            explicit_seen: false,
            markers: 0,
            total_lines: 0,
            last_estimate: Instant::now(),
        }
    }

    /// Record one line, returning a percentage when one should be emitted
    pub fn observe(&mut self, kind: &LineKind, now: Instant) -> Option<u8> {
        self.total_lines += 1;
        match kind {
            LineKind::Progress(p) => {
                self.explicit_seen = true;
                self.markers += 1;
                return self.advance(*p);
            }
            LineKind::FileProcessed(_) => self.markers += 1,
            _ => {}
        }

        if self.explicit_seen || now.duration_since(self.last_estimate) < self.interval {
            return None;
        }
        self.last_estimate = now;
        let estimate = (self.markers * 100 / self.total_lines.max(1)).min(99) as u8;
        self.advance(estimate)
    }

    pub fn last(&self) -> Option<u8> {
        self.last_emitted
    }

    fn advance(&mut self, percent: u8) -> Option<u8> {
        if self.last_emitted.map_or(true, |last| percent > last) {
            self.last_emitted = Some(percent);
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_progress_forms() {
        assert_eq!(classify_line("[10%] a"), LineKind::Progress(10));
        assert_eq!(classify_line("[ 75%] Building C object foo.o"), LineKind::Progress(75));
        assert_eq!(classify_line("42% done"), LineKind::Progress(42));
        assert_eq!(classify_line("[250%] bogus"), LineKind::Plain);
    }

    #[test]
    fn test_classify_gcc_diagnostics() {
        match classify_line("src/main.c:3:9: error: expected ';' before '}' token") {
            LineKind::Error(m) => {
                assert_eq!(m.file.as_deref(), Some("src/main.c"));
                assert_eq!((m.line, m.column), (3, 9));
                assert_eq!(m.message, "expected ';' before '}' token");
            }
            other => panic!("unexpected {:?}", other),
        }
        match classify_line("Foo.java:12: warning: [unchecked] unchecked call") {
            LineKind::Warning(m) => {
                assert_eq!(m.file.as_deref(), Some("Foo.java"));
                assert_eq!((m.line, m.column), (12, 0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(classify_line("error[E0308]: mismatched types"), LineKind::Error(_)));
        assert!(matches!(classify_line("Linker ERROR in module"), LineKind::Error(_)));
    }

    #[test]
    fn test_classify_other_lines() {
        assert_eq!(
            classify_line("Compiling serde v1.0.200"),
            LineKind::FileProcessed("serde".to_string())
        );
        assert_eq!(
            classify_line("dependency: main.c -> util.h"),
            LineKind::Dependency {
                from: "main.c".to_string(),
                to: "util.h".to_string()
            }
        );
        assert_eq!(
            classify_line("  = help: add `;` here"),
            LineKind::Suggestion("add `;` here".to_string())
        );
        assert_eq!(classify_line("linking done"), LineKind::Plain);
    }

    #[test]
    fn test_summary_attaches_suggestions_and_locations() {
        let stderr = "error[E0425]: cannot find value `x`\n --> src/lib.rs:4:13\n  |\n  = help: a local variable with a similar name exists: `y`\nwarning: unused import\n";
        let stdout = "[50%] Compiling lib.rs\nprocessing util.rs\ndependency: lib.rs -> util.rs\n[100%] done\n";
        let summary = summarize([stdout, stderr]);

        assert_eq!(summary.progress, vec![50, 100]);
        assert_eq!(summary.final_progress(), Some(100));
        assert_eq!(summary.files, vec!["util.rs".to_string()]);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].file.as_deref(), Some("src/lib.rs"));
        assert_eq!(summary.errors[0].line, 4);
        assert_eq!(summary.errors[0].suggestions.len(), 1);
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.dependency_graph.dependencies_of("lib.rs"), vec!["util.rs"]);
        assert_eq!(summary.line_count, 9);
    }

    #[test]
    fn test_explicit_progress_is_monotonic_and_immediate() {
        let mut tracker = ProgressTracker::new(Duration::from_secs(1));
        let now = Instant::now();
        let emitted: Vec<u8> = ["[10%] a", "[20%] b", "[30%] c", "[20%] d"]
            .iter()
            .filter_map(|line| tracker.observe(&classify_line(line), now))
            .collect();
        assert_eq!(emitted, vec![10, 20, 30]);
    }

    #[test]
    fn test_heuristic_progress_is_rate_limited() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Duration::from_secs(1));
        let file = classify_line("compiling a.c");
        let plain = LineKind::Plain;

        // Within the first interval nothing is estimated
        assert_eq!(tracker.observe(&file, start), None);
        assert_eq!(tracker.observe(&plain, start), None);

        // 1 marker of 3 lines
        let later = start + Duration::from_millis(1100);
        assert_eq!(tracker.observe(&plain, later), Some(33));
        // Rate limited even though the estimate changed
        assert_eq!(tracker.observe(&file, later + Duration::from_millis(10)), None);

        let much_later = later + Duration::from_millis(1100);
        assert_eq!(tracker.observe(&file, much_later), Some(60));
        assert_eq!(tracker.last(), Some(60));
    }
}
