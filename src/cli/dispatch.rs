//! Command dispatch

use anyhow::{anyhow, bail, Context, Result};
use buildsmith_core::config::{BuildsmithConfig, ConfigFormat, ConfigManager};
use buildsmith_core::history::{ExportFormat, HistoryFilter};
use buildsmith_core::models::{
    CompileTask, CompilerConfiguration, OptimizationLevel, TargetLanguage, TaskPriority,
    TaskStatus,
};
use buildsmith_tools::{InstallPhase, OutputEvent};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::args::{
    CacheCommand, Cli, Command, CompileArgs, ConfigCommand, HistoryCommand, ToolchainCommand,
};
use crate::app::Buildsmith;
use crate::logging::init_logging;

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let mut manager = load_config_manager(cli.config.as_deref())?;
    let _guard = init_logging(&manager.config().logging)?;

    let json = cli.json;
    let command = match cli.command {
        Command::Config { action } => return run_config(&mut manager, action, json),
        command => command,
    };

    let app = Buildsmith::open(manager.config().clone()).await?;
    let code = match command {
        Command::Compile(args) => run_compile(&app, args, json).await,
        Command::Toolchain { action } => run_toolchain(&app, action, json).await,
        Command::Cache { action } => run_cache(&app, action, json).await,
        Command::History { action } => run_history(&app, action, json).await,
        Command::Config { .. } => Ok(ExitCode::SUCCESS),
    };
    app.shutdown().await;
    code
}

fn load_config_manager(path: Option<&Path>) -> Result<ConfigManager> {
    match path {
        Some(path) => {
            let format = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::parse::<ConfigFormat>)
                .transpose()
                .map_err(|e| anyhow!("{}", e))?
                .unwrap_or(ConfigFormat::Toml);
            ConfigManager::with_path(path, format)
        }
        None => ConfigManager::new(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_language(value: &str) -> Result<TargetLanguage> {
    value.parse().map_err(|e| anyhow!("{}", e))
}

fn parse_key_value(value: &str) -> (String, String) {
    match value.split_once('=') {
        Some((key, val)) => (key.to_string(), val.to_string()),
        None => (value.to_string(), String::new()),
    }
}

fn build_task(args: CompileArgs) -> Result<CompileTask> {
    let language = parse_language(&args.language)?;
    let optimization = match args.opt.to_lowercase().as_str() {
        "none" | "0" => OptimizationLevel::None,
        "basic" | "1" => OptimizationLevel::Basic,
        "aggressive" | "3" => OptimizationLevel::Aggressive,
        other => bail!("Unknown optimization level: {}", other),
    };
    let priority = match args.priority.to_lowercase().as_str() {
        "low" => TaskPriority::Low,
        "normal" => TaskPriority::Normal,
        "high" => TaskPriority::High,
        "critical" => TaskPriority::Critical,
        other => bail!("Unknown priority: {}", other),
    };

    let mut config = CompilerConfiguration::new(args.compiler)
        .with_args(args.extra_args)
        .with_optimization(optimization)
        .with_debug_symbols(args.debug)
        .with_warnings_as_errors(args.werror);
    if let Some(output) = args.output {
        config = config.with_output_path(output);
    }
    for path in args.include_paths {
        config = config.with_include_path(path);
    }
    for path in args.library_paths {
        config = config.with_library_path(path);
    }
    for define in &args.defines {
        let (key, value) = parse_key_value(define);
        config = config.with_define(key, value);
    }

    let project = std::path::absolute(&args.project)
        .with_context(|| format!("Invalid project path {:?}", args.project))?;
    let mut task = CompileTask::new(project, args.sources, language, config).with_priority(priority);
    for pair in &args.env {
        let (key, value) = parse_key_value(pair);
        task = task.with_env(key, value);
    }
    Ok(task)
}

async fn run_compile(app: &Buildsmith, args: CompileArgs, json: bool) -> Result<ExitCode> {
    let quiet = args.quiet || json;
    let task = build_task(args)?;
    let language = task.language;

    if !app.toolchains().is_installed(language).await {
        let found = app.toolchains().detect(language).await?;
        debug!(%language, found, "Toolchain detection");
    }

    let id = app.tasks().submit(task).await?;
    let done = CancellationToken::new();
    let printer = match app.tasks().subscribe_output(id).await {
        Some(events) if !quiet => Some(tokio::spawn(relay_output(
            events,
            done.clone(),
            print_event,
        ))),
        _ => None,
    };

    let finished = app
        .tasks()
        .wait_for(id)
        .await
        .ok_or_else(|| anyhow!("Task {} disappeared", id));
    done.cancel();
    if let Some(printer) = printer {
        if let Err(e) = printer.await {
            debug!("Output printer stopped: {}", e);
        }
    }
    let finished = finished?;

    if json {
        print_json(&finished)?;
    } else if let Some(ref result) = finished.result {
        println!("{} {}", finished.status, result.summary);
        for error in &result.errors {
            println!("  error: {}", error);
            for suggestion in &error.suggestions {
                println!("    help: {}", suggestion);
            }
        }
    }

    Ok(if finished.status == TaskStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Hand events to `sink` until `done`, then flush whatever is still queued
///
/// Every event is sent before the task turns terminal, so cancelling `done`
/// after `wait_for` returns loses nothing.
async fn relay_output<F>(
    mut events: broadcast::Receiver<OutputEvent>,
    done: CancellationToken,
    mut sink: F,
) where
    F: FnMut(&OutputEvent),
{
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => sink(&event),
                Err(RecvError::Lagged(skipped)) => eprintln!("... {} output events skipped", skipped),
                Err(RecvError::Closed) => return,
            },
            _ = done.cancelled() => break,
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => sink(&event),
            Err(TryRecvError::Lagged(skipped)) => eprintln!("... {} output events skipped", skipped),
            Err(_) => return,
        }
    }
}

fn print_event(event: &OutputEvent) {
    match event {
        OutputEvent::Progress { percent } => eprintln!("[{:>3}%]", percent),
        OutputEvent::FileProcessed { file, .. } => eprintln!("  processing {}", file),
        OutputEvent::Warning { message, .. } => eprintln!("warning: {}", message),
        OutputEvent::Error { message, .. } => eprintln!("error: {}", message),
        OutputEvent::Output { line, .. } => eprintln!("{}", line),
    }
}

async fn detect_all(app: &Buildsmith) {
    for language in TargetLanguage::ALL {
        if let Err(e) = app.toolchains().detect(language).await {
            debug!(%language, "Detection failed: {}", e);
        }
    }
}

async fn run_toolchain(app: &Buildsmith, action: ToolchainCommand, json: bool) -> Result<ExitCode> {
    let toolchains = app.toolchains();
    match action {
        ToolchainCommand::List => {
            detect_all(app).await;
            let list = toolchains.list_toolchains().await;
            if json {
                print_json(&list)?;
            } else {
                for info in list {
                    println!(
                        "{:<11} {:<8} {:<10} {}",
                        info.language.as_str(),
                        info.name,
                        info.version.as_deref().unwrap_or("-"),
                        if info.installed { "installed" } else { "not installed" }
                    );
                }
            }
        }
        ToolchainCommand::Install { language } => {
            let language = parse_language(&language)?;
            let mut progress = toolchains.subscribe_progress();
            let reporter = (!json).then(|| {
                tokio::spawn(async move {
                    let mut last = None;
                    while let Ok(status) = progress.recv().await {
                        if status.language == language
                            && status.phase == InstallPhase::Installing
                            && last != Some(status.progress)
                        {
                            eprintln!("[{:>3}%] installing {}", status.progress, language);
                            last = Some(status.progress);
                        }
                    }
                })
            });
            let outcome = toolchains.install_toolchain(language).await;
            if let Some(reporter) = reporter {
                reporter.abort();
            }
            let status = outcome?;
            if json {
                print_json(&status)?;
            } else {
                println!("{}: {:?}", language, status.phase);
            }
        }
        ToolchainCommand::Uninstall { language } => {
            let language = parse_language(&language)?;
            toolchains.detect(language).await?;
            let removed = toolchains.uninstall_toolchain(language).await?;
            if json {
                print_json(&serde_json::json!({ "language": language, "removed": removed }))?;
            } else if removed {
                println!("Uninstalled {}", language);
            } else {
                println!("{} is not installed", language);
            }
        }
        ToolchainCommand::Status { language } => {
            let language = parse_language(&language)?;
            toolchains.detect(language).await?;
            let status = toolchains.get_installation_status(language);
            if json {
                print_json(&status)?;
            } else {
                match status {
                    Some(status) => println!(
                        "{}: {:?} ({}%){}",
                        language,
                        status.phase,
                        status.progress,
                        status.message.map(|m| format!(" {}", m)).unwrap_or_default()
                    ),
                    None => println!("{}: never installed", language),
                }
            }
        }
        ToolchainCommand::Updates => {
            detect_all(app).await;
            let updates = toolchains.check_for_updates().await;
            if json {
                print_json(&updates)?;
            } else if updates.is_empty() {
                println!("All installed toolchains are up to date");
            } else {
                for update in updates {
                    println!(
                        "{}: {} -> {}",
                        update.language, update.installed_version, update.latest_version
                    );
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_cache(app: &Buildsmith, action: CacheCommand, json: bool) -> Result<ExitCode> {
    match action {
        CacheCommand::Stats => {
            let stats = app.cache().get_cache_statistics().await?;
            if json {
                print_json(&stats)?;
            } else {
                println!("entries:    {}", stats.entry_count);
                println!("bytes:      {}", stats.total_bytes);
                println!("hits:       {}", stats.hits);
                println!("misses:     {}", stats.misses);
                println!("hit rate:   {:.1}%", stats.hit_rate() * 100.0);
            }
        }
        CacheCommand::Clear => {
            app.cache().clear_all_cache().await?;
            if !json {
                println!("Cache cleared");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_history(app: &Buildsmith, action: HistoryCommand, json: bool) -> Result<ExitCode> {
    let history = app.history();
    match action {
        HistoryCommand::List {
            project,
            language,
            limit,
        } => {
            let filter = HistoryFilter {
                project_path: project.map(|p| std::path::absolute(&p).unwrap_or(p)),
                language: language.as_deref().map(parse_language).transpose()?,
                limit: Some(limit),
                ..Default::default()
            };
            let entries = history.get_history(&filter).await?;
            if json {
                print_json(&entries)?;
            } else {
                for entry in entries {
                    println!(
                        "{}  {:<9} {:<10} {:>7}ms  {}",
                        entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.status(),
                        entry.language().as_str(),
                        entry.result.execution_time_ms,
                        entry.project_path().display()
                    );
                }
            }
        }
        HistoryCommand::Stats { days, top } => {
            let statistics = history.get_statistics().await?;
            let trend = history.get_performance_trend(days).await?;
            let projects = history.get_top_projects(top).await?;
            if json {
                print_json(&serde_json::json!({
                    "statistics": statistics,
                    "trend": trend,
                    "top_projects": projects,
                }))?;
            } else {
                println!(
                    "tasks: {} total, {} ok, {} failed, {} cancelled ({:.1}% success)",
                    statistics.total_tasks,
                    statistics.successful_tasks,
                    statistics.failed_tasks,
                    statistics.cancelled_tasks,
                    statistics.success_rate * 100.0
                );
                println!(
                    "time:  {}ms total, {:.0}ms average",
                    statistics.total_execution_ms, statistics.average_execution_ms
                );
                for (language, count) in &statistics.tasks_by_language {
                    println!("  {:<11} {}", language, count);
                }
                println!("trend:");
                for point in trend {
                    println!(
                        "  {}  {} tasks, {} ok, {:.0}ms avg",
                        point.date, point.task_count, point.success_count, point.average_execution_ms
                    );
                }
                println!("top projects:");
                for project in projects {
                    println!("  {:>4}  {}", project.task_count, project.project_path);
                }
            }
        }
        HistoryCommand::Errors => {
            let patterns = history.get_error_analysis().await?;
            if json {
                print_json(&patterns)?;
            } else {
                for pattern in patterns {
                    println!("{:>4}x  {}", pattern.occurrences, pattern.example);
                }
            }
        }
        HistoryCommand::Export { format, output } => {
            let format: ExportFormat = format.parse().map_err(|e| anyhow!("{}", e))?;
            let data = history.export(format).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, data)
                        .await
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    if !json {
                        println!("Exported history to {}", path.display());
                    }
                }
                None => println!("{}", data),
            }
        }
        HistoryCommand::Import { file, format } => {
            let format = format_for_import(&file, format.as_deref())?;
            let data = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            let report = history.import(&data, format).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Imported {} entries, skipped {}", report.imported, report.skipped);
            }
        }
        HistoryCommand::Clear => {
            let removed = history.clear_all().await?;
            if !json {
                println!("Removed {} history entries", removed);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn format_for_import(file: &Path, explicit: Option<&str>) -> Result<ExportFormat> {
    let name = match explicit {
        Some(name) => name.to_string(),
        None => file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("json")
            .to_string(),
    };
    name.parse().map_err(|e| anyhow!("{}", e))
}

fn run_config(manager: &mut ConfigManager, action: ConfigCommand, json: bool) -> Result<ExitCode> {
    match action {
        ConfigCommand::Init => {
            if !manager.config_exists() {
                manager.save_config()?;
            }
            let path: PathBuf = manager.get_config_file_path();
            if json {
                print_json(&serde_json::json!({ "path": path }))?;
            } else {
                println!("{}", path.display());
            }
        }
        ConfigCommand::Show => {
            let config: &BuildsmithConfig = manager.config();
            if json {
                print_json(config)?;
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(config).context("Failed to render configuration")?
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_parsing() {
        assert_eq!(parse_key_value("A=1"), ("A".to_string(), "1".to_string()));
        assert_eq!(parse_key_value("FLAG"), ("FLAG".to_string(), String::new()));
        assert_eq!(parse_key_value("X=a=b"), ("X".to_string(), "a=b".to_string()));
    }

    #[tokio::test]
    async fn test_relay_output_flushes_queued_events() {
        let (tx, rx) = broadcast::channel(16);
        for percent in [10, 50, 100] {
            tx.send(OutputEvent::Progress { percent }).unwrap();
        }
        let done = CancellationToken::new();
        done.cancel();

        let mut seen = Vec::new();
        relay_output(rx, done, |event| {
            if let OutputEvent::Progress { percent } = event {
                seen.push(*percent);
            }
        })
        .await;
        // The sender is still alive, so only the flush can end the relay
        assert_eq!(seen, vec![10, 50, 100]);
        drop(tx);
    }

    #[test]
    fn test_import_format_from_extension() {
        assert_eq!(
            format_for_import(Path::new("backup.yml"), None).unwrap(),
            ExportFormat::Yaml
        );
        assert_eq!(
            format_for_import(Path::new("backup.yml"), Some("json")).unwrap(),
            ExportFormat::Json
        );
        assert!(format_for_import(Path::new("backup.csv"), None).is_err());
    }
}
