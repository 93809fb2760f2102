//! Toolchain Manager
//!
//! Tracks install state per target language and drives installs and
//! uninstalls through the process spawner. Install progress comes from the
//! installer's own output, parsed by the output stream handler, and is
//! rebroadcast to every subscriber.

mod registry;

pub use registry::{compare_versions, extract_version, CommandSpec, ToolchainDefinition, ToolchainRegistry};

use buildsmith_core::config::{OutputSettings, ToolchainSettings};
use buildsmith_core::error::{BuildsmithError, Result};
use buildsmith_core::models::{TargetLanguage, ToolchainInfo};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::output::{OutputEvent, OutputStreamHandler};
use crate::process::{terminate_gracefully, ProcessSpawner, SpawnRequest};

/// How long installer output may keep draining after the installer exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    NotInstalled,
    Installing,
    Installed,
    InstallFailed,
    Uninstalling,
}

/// Current phase and progress of one language's toolchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationStatus {
    pub language: TargetLanguage,
    pub phase: InstallPhase,
    /// 0..=100, only meaningful while installing or after a failure
    pub progress: u8,
    pub message: Option<String>,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl InstallationStatus {
    fn new(language: TargetLanguage, phase: InstallPhase) -> Self {
        Self {
            language,
            phase,
            progress: 0,
            message: None,
            attempt: 0,
            updated_at: Utc::now(),
        }
    }
}

/// An installed toolchain older than the known latest version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainUpdate {
    pub language: TargetLanguage,
    pub installed_version: String,
    pub latest_version: String,
}

/// Exit code plus captured output of one helper process
struct Execution {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

pub struct ToolchainManager {
    spawner: Arc<dyn ProcessSpawner>,
    registry: ToolchainRegistry,
    settings: ToolchainSettings,
    output: OutputSettings,
    toolchains: RwLock<BTreeMap<TargetLanguage, ToolchainInfo>>,
    statuses: DashMap<TargetLanguage, InstallationStatus>,
    progress_tx: broadcast::Sender<InstallationStatus>,
}

impl ToolchainManager {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        registry: ToolchainRegistry,
        settings: ToolchainSettings,
        output: OutputSettings,
    ) -> Self {
        let toolchains = TargetLanguage::ALL
            .iter()
            .map(|language| {
                let name = registry
                    .get(*language)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| language.as_str().to_string());
                (*language, ToolchainInfo::not_installed(*language, name))
            })
            .collect();
        let (progress_tx, _) = broadcast::channel(64);

        Self {
            spawner,
            registry,
            settings,
            output,
            toolchains: RwLock::new(toolchains),
            statuses: DashMap::new(),
            progress_tx,
        }
    }

    /// Registry with configured installer overrides applied
    pub fn from_settings(
        spawner: Arc<dyn ProcessSpawner>,
        settings: ToolchainSettings,
        output: OutputSettings,
    ) -> Result<Self> {
        let mut registry = ToolchainRegistry::builtin();
        registry.apply_overrides(&settings)?;
        Ok(Self::new(spawner, registry, settings, output))
    }

    pub fn registry(&self) -> &ToolchainRegistry {
        &self.registry
    }

    /// Live status updates for every language
    pub fn subscribe_progress(&self) -> broadcast::Receiver<InstallationStatus> {
        self.progress_tx.subscribe()
    }

    /// Install the toolchain for `language`
    ///
    /// Returns the in-flight status without starting anything when an install
    /// is already running, and the current status when already installed.
    pub async fn install_toolchain(&self, language: TargetLanguage) -> Result<InstallationStatus> {
        let definition = self.registry.get(language).cloned().ok_or_else(|| {
            BuildsmithError::InstallFailed {
                language,
                progress: 0,
                reason: "no installer registered".to_string(),
            }
        })?;

        if self.is_installed(language).await {
            return Ok(self.set_status(language, |s| {
                s.phase = InstallPhase::Installed;
                s.progress = 100;
            }));
        }

        match self.statuses.entry(language) {
            Entry::Occupied(mut entry) => match entry.get().phase {
                InstallPhase::Installing | InstallPhase::Installed => {
                    debug!(%language, "Install already in progress");
                    return Ok(entry.get().clone());
                }
                InstallPhase::Uninstalling => {
                    return Err(BuildsmithError::Validation(format!(
                        "Toolchain for '{}' is being uninstalled",
                        language
                    )));
                }
                InstallPhase::NotInstalled | InstallPhase::InstallFailed => {
                    entry.insert(InstallationStatus::new(language, InstallPhase::Installing));
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(InstallationStatus::new(language, InstallPhase::Installing));
            }
        }
        info!(%language, "Installing toolchain {}", definition.name);

        let max_attempts = self.settings.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            self.set_status(language, |s| {
                s.attempt = attempt;
                s.message = Some(format!("Installing {} (attempt {})", definition.name, attempt));
            });

            match self.run_installer(language, &definition).await {
                Ok(()) => return Ok(self.finish_install(&definition).await),
                Err(reason) => {
                    warn!(%language, attempt, "Toolchain install failed: {}", reason);
                    last_error = reason;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        let status = self.set_status(language, |s| {
            s.phase = InstallPhase::InstallFailed;
            s.message = Some(last_error.clone());
        });
        Err(BuildsmithError::InstallFailed {
            language,
            progress: status.progress,
            reason: last_error,
        })
    }

    async fn run_installer(
        &self,
        language: TargetLanguage,
        definition: &ToolchainDefinition,
    ) -> std::result::Result<(), String> {
        let mut request = SpawnRequest::new(&definition.install.command)
            .args(definition.install.args.iter().cloned());
        if let Some(ref root) = self.settings.install_root {
            let target = root.join(language.as_str());
            request = request.working_dir(root);
            request
                .env
                .insert("BUILDSMITH_INSTALL_DIR".to_string(), target.display().to_string());
        }

        let execution = self
            .execute(&request, Some(language))
            .await
            .map_err(|e| e.to_string())?;
        if execution.exit_code == 0 {
            return Ok(());
        }

        let detail = execution
            .stderr
            .lines()
            .chain(execution.stdout.lines())
            .filter(|l| !l.trim().is_empty())
            .last()
            .unwrap_or("no output")
            .trim()
            .to_string();
        Err(format!("installer exited with code {}: {}", execution.exit_code, detail))
    }

    async fn finish_install(&self, definition: &ToolchainDefinition) -> InstallationStatus {
        let language = definition.language;
        let version = (!definition.latest_version.is_empty()).then(|| definition.latest_version.clone());
        {
            let mut toolchains = self.toolchains.write().await;
            let info = toolchains
                .entry(language)
                .or_insert_with(|| ToolchainInfo::not_installed(language, definition.name.clone()));
            info.name = definition.name.clone();
            info.version = version.clone();
            info.install_path = self
                .settings
                .install_root
                .as_ref()
                .map(|root| root.join(language.as_str()));
            info.installed = true;
            info.capabilities = definition.capabilities.iter().cloned().collect();
            info.installed_at = Some(Utc::now());
        }
        info!(%language, "Installed {} {}", definition.name, version.as_deref().unwrap_or(""));

        self.set_status(language, |s| {
            s.phase = InstallPhase::Installed;
            s.progress = 100;
            s.message = Some(format!("Installed {}", definition.name));
        })
    }

    /// Remove an installed toolchain; `Ok(false)` when nothing was installed
    pub async fn uninstall_toolchain(&self, language: TargetLanguage) -> Result<bool> {
        let (claimed, previous) = match self.statuses.entry(language) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().phase;
                if matches!(previous, InstallPhase::Installing | InstallPhase::Uninstalling) {
                    return Err(BuildsmithError::Validation(format!(
                        "Toolchain for '{}' is busy ({:?})",
                        language, previous
                    )));
                }
                let status = entry.get_mut();
                status.phase = InstallPhase::Uninstalling;
                status.message = None;
                status.updated_at = Utc::now();
                (status.clone(), previous)
            }
            Entry::Vacant(entry) => (
                entry
                    .insert(InstallationStatus::new(language, InstallPhase::Uninstalling))
                    .clone(),
                InstallPhase::NotInstalled,
            ),
        };

        if !self.is_installed(language).await {
            if let Some(mut status) = self.statuses.get_mut(&language) {
                status.phase = previous;
            }
            return Ok(false);
        }
        let _ = self.progress_tx.send(claimed);
        info!(%language, "Uninstalling toolchain");

        if let Some(uninstall) = self.registry.get(language).and_then(|d| d.uninstall.clone()) {
            let request = SpawnRequest::new(&uninstall.command).args(uninstall.args);
            let outcome = self.execute(&request, None).await;
            let failure = match outcome {
                Ok(execution) if execution.exit_code == 0 => None,
                Ok(execution) => Some(format!("uninstaller exited with code {}", execution.exit_code)),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                self.set_status(language, |s| {
                    s.phase = InstallPhase::Installed;
                    s.message = Some(reason.clone());
                });
                return Err(BuildsmithError::UninstallFailed { language, reason });
            }
        }

        {
            let mut toolchains = self.toolchains.write().await;
            if let Some(info) = toolchains.get_mut(&language) {
                *info = ToolchainInfo::not_installed(language, info.name.clone());
            }
        }
        self.set_status(language, |s| {
            s.phase = InstallPhase::NotInstalled;
            s.progress = 0;
            s.message = Some("Uninstalled".to_string());
        });
        Ok(true)
    }

    /// Probe for a toolchain that is already present on the system
    pub async fn detect(&self, language: TargetLanguage) -> Result<bool> {
        let Some(probe) = self.registry.get(language).and_then(|d| d.probe.clone()) else {
            return Ok(false);
        };
        let request = SpawnRequest::new(&probe.command).args(probe.args);
        let execution = match self.execute(&request, None).await {
            Ok(execution) => execution,
            // Probe binary missing means not installed
            Err(BuildsmithError::ProcessSpawn { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if execution.exit_code != 0 {
            return Ok(false);
        }

        let version = extract_version(&execution.stdout).or_else(|| extract_version(&execution.stderr));
        let mut info = self.get_toolchain_info(language).await;
        info.installed = true;
        info.version = version;
        if let Some(definition) = self.registry.get(language) {
            info.capabilities = definition.capabilities.iter().cloned().collect();
        }
        debug!(%language, version = ?info.version, "Detected toolchain");
        self.register_installed(info).await;
        Ok(true)
    }

    /// Record a toolchain provisioned outside this manager
    pub async fn register_installed(&self, mut info: ToolchainInfo) {
        let language = info.language;
        info.installed = true;
        if info.installed_at.is_none() {
            info.installed_at = Some(Utc::now());
        }
        self.toolchains.write().await.insert(language, info);
        self.set_status(language, |s| {
            s.phase = InstallPhase::Installed;
            s.progress = 100;
        });
    }

    /// Installed toolchains whose version is behind the registry's latest
    pub async fn check_for_updates(&self) -> Vec<ToolchainUpdate> {
        let toolchains = self.toolchains.read().await;
        toolchains
            .values()
            .filter(|info| info.installed)
            .filter_map(|info| {
                let installed = info.version.as_ref()?;
                let latest = &self.registry.get(info.language)?.latest_version;
                (!latest.is_empty() && compare_versions(installed, latest) == Ordering::Less).then(
                    || ToolchainUpdate {
                        language: info.language,
                        installed_version: installed.clone(),
                        latest_version: latest.clone(),
                    },
                )
            })
            .collect()
    }

    /// `None` when no install or uninstall was ever attempted
    pub fn get_installation_status(&self, language: TargetLanguage) -> Option<InstallationStatus> {
        self.statuses.get(&language).map(|s| s.clone())
    }

    pub async fn is_installed(&self, language: TargetLanguage) -> bool {
        self.toolchains
            .read()
            .await
            .get(&language)
            .map_or(false, |info| info.installed)
    }

    pub async fn installed_version(&self, language: TargetLanguage) -> Option<String> {
        self.toolchains
            .read()
            .await
            .get(&language)
            .filter(|info| info.installed)
            .and_then(|info| info.version.clone())
    }

    pub async fn get_toolchain_info(&self, language: TargetLanguage) -> ToolchainInfo {
        self.toolchains
            .read()
            .await
            .get(&language)
            .cloned()
            .unwrap_or_else(|| ToolchainInfo::not_installed(language, language.as_str()))
    }

    pub async fn list_toolchains(&self) -> Vec<ToolchainInfo> {
        self.toolchains.read().await.values().cloned().collect()
    }

    pub async fn mark_used(&self, language: TargetLanguage) {
        if let Some(info) = self.toolchains.write().await.get_mut(&language) {
            info.last_used = Some(Utc::now());
        }
    }

    /// Run a helper process to completion, forwarding install progress when
    /// `progress_for` is set
    async fn execute(
        &self,
        request: &SpawnRequest,
        progress_for: Option<TargetLanguage>,
    ) -> Result<Execution> {
        let mut handle = self.spawner.spawn(request).await?;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let listener = progress_for.map(|_| events_tx);
        let mut handler = OutputStreamHandler::attach(handle.as_mut(), &self.output, listener);

        let exit = {
            let wait = handle.wait();
            tokio::pin!(wait);
            let deadline = tokio::time::sleep(self.settings.helper_timeout());
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    exit = &mut wait => break Some(exit),
                    _ = &mut deadline => break None,
                    Some(event) = events_rx.recv() => {
                        if let Some(language) = progress_for {
                            self.forward_progress(language, event);
                        }
                    }
                }
            }
        };

        let Some(exit) = exit else {
            let limit = self.settings.helper_timeout();
            warn!("{} did not finish within {}ms, stopping it", request.display(), limit.as_millis());
            if let Err(e) = terminate_gracefully(handle.as_mut(), DRAIN_TIMEOUT).await {
                debug!("Failed to stop timed out helper: {}", e);
            }
            handler.finish(DRAIN_TIMEOUT).await;
            return Err(BuildsmithError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {}ms", request.display(), limit.as_millis()),
            )));
        };

        handler.finish(DRAIN_TIMEOUT).await;
        while let Ok(event) = events_rx.try_recv() {
            if let Some(language) = progress_for {
                self.forward_progress(language, event);
            }
        }

        Ok(Execution {
            exit_code: exit?,
            stdout: handler.get_output().await,
            stderr: handler.get_error_output().await,
        })
    }

    fn forward_progress(&self, language: TargetLanguage, event: OutputEvent) {
        if let OutputEvent::Progress { percent } = event {
            let current = self.statuses.get(&language).map(|s| (s.phase, s.progress));
            if let Some((InstallPhase::Installing, progress)) = current {
                if percent > progress {
                    self.set_status(language, |s| s.progress = percent);
                }
            }
        }
    }

    fn set_status<F>(&self, language: TargetLanguage, update: F) -> InstallationStatus
    where
        F: FnOnce(&mut InstallationStatus),
    {
        let snapshot = {
            let mut status = self
                .statuses
                .entry(language)
                .or_insert_with(|| InstallationStatus::new(language, InstallPhase::NotInstalled));
            update(&mut *status);
            status.updated_at = Utc::now();
            status.clone()
        };
        // No subscribers is fine
        let _ = self.progress_tx.send(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessScript, ScriptedSpawner};
    use buildsmith_core::config::RetrySettings;

    fn settings(max_attempts: u32) -> ToolchainSettings {
        ToolchainSettings {
            install_root: None,
            retry: RetrySettings {
                min_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
                max_attempts,
            },
            installers: BTreeMap::new(),
            helper_timeout_ms: 5_000,
        }
    }

    fn manager(spawner: Arc<ScriptedSpawner>, max_attempts: u32) -> ToolchainManager {
        ToolchainManager::new(
            spawner,
            ToolchainRegistry::builtin(),
            settings(max_attempts),
            OutputSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_install_reports_progress_and_installs() {
        let spawner = Arc::new(ScriptedSpawner::new(ProcessScript::succeed()).with_script(
            "rustup",
            ProcessScript::succeed().with_stdout("[25%] downloading\n[80%] unpacking\n[100%] done\n"),
        ));
        let manager = manager(spawner.clone(), 3);
        let mut progress = manager.subscribe_progress();

        assert!(manager.get_installation_status(TargetLanguage::Rust).is_none());
        let status = manager.install_toolchain(TargetLanguage::Rust).await.unwrap();
        assert_eq!(status.phase, InstallPhase::Installed);
        assert_eq!(status.progress, 100);
        assert!(manager.is_installed(TargetLanguage::Rust).await);
        assert_eq!(
            manager.installed_version(TargetLanguage::Rust).await.as_deref(),
            Some("1.82.0")
        );

        let mut seen = Vec::new();
        while let Ok(update) = progress.try_recv() {
            if update.phase == InstallPhase::Installing {
                seen.push(update.progress);
            }
        }
        assert!(seen.contains(&25) && seen.contains(&80));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(spawner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_install_failure_after_retries() {
        let spawner = Arc::new(ScriptedSpawner::new(
            ProcessScript::exit(100)
                .with_stdout("[30%] fetching\n")
                .with_stderr("E: unable to fetch archive\n"),
        ));
        let manager = manager(spawner.clone(), 2);

        let err = manager.install_toolchain(TargetLanguage::Go).await.unwrap_err();
        match err {
            BuildsmithError::InstallFailed { language, progress, reason } => {
                assert_eq!(language, TargetLanguage::Go);
                assert_eq!(progress, 30);
                assert!(reason.contains("unable to fetch"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(spawner.call_count(), 2);
        let status = manager.get_installation_status(TargetLanguage::Go).unwrap();
        assert_eq!(status.phase, InstallPhase::InstallFailed);
        assert!(!manager.is_installed(TargetLanguage::Go).await);
    }

    #[tokio::test]
    async fn test_install_retry_succeeds() {
        let spawner = Arc::new(
            ScriptedSpawner::new(ProcessScript::succeed())
                .with_sequence("pkg", vec![ProcessScript::exit(1), ProcessScript::succeed()]),
        );
        let manager = manager(spawner.clone(), 3);

        let status = manager.install_toolchain(TargetLanguage::C).await.unwrap();
        assert_eq!(status.phase, InstallPhase::Installed);
        assert_eq!(status.attempt, 2);
        assert_eq!(spawner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_install_is_idempotent_while_in_flight() {
        let spawner = Arc::new(ScriptedSpawner::new(
            ProcessScript::succeed()
                .with_stdout("[40%] working\n")
                .lasting(Duration::from_millis(300)),
        ));
        let manager = Arc::new(manager(spawner.clone(), 1));

        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.install_toolchain(TargetLanguage::Java).await })
        };
        while manager
            .get_installation_status(TargetLanguage::Java)
            .map_or(true, |s| s.phase != InstallPhase::Installing)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = manager.install_toolchain(TargetLanguage::Java).await.unwrap();
        assert_eq!(second.phase, InstallPhase::Installing);
        assert_eq!(spawner.call_count(), 1);

        let first = background.await.unwrap().unwrap();
        assert_eq!(first.phase, InstallPhase::Installed);
        assert_eq!(spawner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_uninstall_and_updates() {
        let spawner = Arc::new(ScriptedSpawner::new(ProcessScript::succeed()));
        let manager = manager(spawner.clone(), 1);

        let mut rust = ToolchainInfo::not_installed(TargetLanguage::Rust, "rustc");
        rust.version = Some("1.70.0".to_string());
        manager.register_installed(rust).await;
        let mut c = ToolchainInfo::not_installed(TargetLanguage::C, "clang");
        c.version = Some("18.1.8".to_string());
        manager.register_installed(c).await;

        let updates = manager.check_for_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].language, TargetLanguage::Rust);
        assert_eq!(updates[0].latest_version, "1.82.0");

        assert!(manager.uninstall_toolchain(TargetLanguage::Rust).await.unwrap());
        assert!(!manager.is_installed(TargetLanguage::Rust).await);
        assert!(!manager.uninstall_toolchain(TargetLanguage::Rust).await.unwrap());
        assert_eq!(
            manager.get_installation_status(TargetLanguage::Rust).unwrap().phase,
            InstallPhase::NotInstalled
        );
        assert_eq!(spawner.calls().await[0].command, "rustup");
    }

    #[tokio::test]
    async fn test_failed_uninstall_keeps_toolchain() {
        let spawner = Arc::new(ScriptedSpawner::new(ProcessScript::exit(2)));
        let manager = manager(spawner, 1);
        manager
            .register_installed(ToolchainInfo::not_installed(TargetLanguage::Go, "go"))
            .await;

        let err = manager.uninstall_toolchain(TargetLanguage::Go).await.unwrap_err();
        assert!(matches!(err, BuildsmithError::UninstallFailed { .. }));
        assert!(manager.is_installed(TargetLanguage::Go).await);
    }

    #[tokio::test]
    async fn test_detect_and_mark_used() {
        let spawner = Arc::new(
            ScriptedSpawner::new(ProcessScript::fail_to_spawn("not found"))
                .with_script("clang", ProcessScript::succeed().with_stdout("clang version 17.0.6\n")),
        );
        let manager = manager(spawner, 1);

        assert!(manager.detect(TargetLanguage::C).await.unwrap());
        assert!(!manager.detect(TargetLanguage::Go).await.unwrap());
        assert_eq!(
            manager.installed_version(TargetLanguage::C).await.as_deref(),
            Some("17.0.6")
        );

        assert!(manager.get_toolchain_info(TargetLanguage::C).await.last_used.is_none());
        manager.mark_used(TargetLanguage::C).await;
        assert!(manager.get_toolchain_info(TargetLanguage::C).await.last_used.is_some());
        assert_eq!(manager.list_toolchains().await.len(), TargetLanguage::ALL.len());
    }

    #[tokio::test]
    async fn test_concurrent_uninstalls_run_one_helper() {
        let spawner = Arc::new(ScriptedSpawner::new(
            ProcessScript::succeed().lasting(Duration::from_millis(200)),
        ));
        let manager = Arc::new(manager(spawner.clone(), 1));
        manager
            .register_installed(ToolchainInfo::not_installed(TargetLanguage::Rust, "rustc"))
            .await;

        let (first, second) = tokio::join!(
            manager.uninstall_toolchain(TargetLanguage::Rust),
            manager.uninstall_toolchain(TargetLanguage::Rust)
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| matches!(r, Ok(true))).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(BuildsmithError::Validation(_))))
                .count(),
            1
        );
        assert_eq!(spawner.call_count(), 1);
        assert!(!manager.is_installed(TargetLanguage::Rust).await);
    }

    #[tokio::test]
    async fn test_hung_installer_times_out() {
        let spawner = Arc::new(ScriptedSpawner::new(ProcessScript::hang()));
        let mut settings = settings(1);
        settings.helper_timeout_ms = 100;
        let manager = ToolchainManager::new(
            spawner.clone(),
            ToolchainRegistry::builtin(),
            settings,
            OutputSettings::default(),
        );

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            manager.install_toolchain(TargetLanguage::Go),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, BuildsmithError::InstallFailed { .. }));
        assert!(err.to_string().contains("timed out"));
        assert_eq!(spawner.terminate_count(), 1);
        assert_eq!(spawner.running(), 0);
        assert_eq!(
            manager.get_installation_status(TargetLanguage::Go).unwrap().phase,
            InstallPhase::InstallFailed
        );
    }
}
