//! End to end through the composition root with the SQLite backend

use buildsmith::Buildsmith;
use buildsmith_core::config::{BuildsmithConfig, StorageBackend};
use buildsmith_core::history::{ExportFormat, HistoryFilter};
use buildsmith_core::models::{
    CompileTask, CompilerConfiguration, TargetLanguage, TaskStatus, ToolchainInfo,
};
use buildsmith_tools::{ProcessScript, ScriptedSpawner};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn sqlite_config(dir: &Path) -> BuildsmithConfig {
    let mut config = BuildsmithConfig::default();
    config.engine.max_concurrent_tasks = Some(1);
    config.engine.teardown_grace_ms = 200;
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.database_path = Some(dir.join("buildsmith.db"));
    config
}

async fn open(dir: &Path) -> (Buildsmith, Arc<ScriptedSpawner>) {
    let spawner = Arc::new(ScriptedSpawner::new(
        ProcessScript::succeed().with_stdout("[100%] built\n"),
    ));
    let app = Buildsmith::with_spawner(sqlite_config(dir), spawner.clone())
        .await
        .unwrap();
    app.toolchains()
        .register_installed(ToolchainInfo {
            version: Some("1.22.0".to_string()),
            ..ToolchainInfo::not_installed(TargetLanguage::Go, "go")
        })
        .await;
    (app, spawner)
}

fn go_task(project: &Path) -> CompileTask {
    std::fs::write(project.join("main.go"), "package main\n\nfunc main() {}\n").unwrap();
    CompileTask::new(
        project,
        vec![PathBuf::from("main.go")],
        TargetLanguage::Go,
        CompilerConfiguration::new("go").with_output_path("bin/app"),
    )
}

#[tokio::test]
async fn test_cache_and_history_survive_reopen() {
    let state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();

    let (app, spawner) = open(state.path()).await;
    let finished = app.tasks().run_to_completion(go_task(project.path())).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Success);
    assert_eq!(spawner.call_count(), 1);
    app.shutdown().await;
    drop(app);

    let (app, spawner) = open(state.path()).await;
    let again = app.tasks().run_to_completion(go_task(project.path())).await.unwrap();
    assert_eq!(again.status, TaskStatus::Success);
    assert!(again.result.unwrap().from_cache);
    assert_eq!(spawner.call_count(), 0);

    let entries = app
        .history()
        .get_history(&HistoryFilter::for_project(project.path()))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    let stats = app.history().get_statistics().await.unwrap();
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.cache_hits, 1);
    app.shutdown().await;
}

#[tokio::test]
async fn test_history_export_import_between_databases() {
    let first_state = tempfile::tempdir().unwrap();
    let second_state = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();

    let (source, _) = open(first_state.path()).await;
    source.tasks().run_to_completion(go_task(project.path())).await.unwrap();
    let exported = source.history().export(ExportFormat::Yaml).await.unwrap();
    source.shutdown().await;

    let (target, _) = open(second_state.path()).await;
    let report = target.history().import(&exported, ExportFormat::Yaml).await.unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.skipped, 0);

    let again = target.history().import(&exported, ExportFormat::Yaml).await.unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.skipped, 1);
    target.shutdown().await;
}
