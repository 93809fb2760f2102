//! Process spawn capability
//!
//! The orchestrator never touches `std::process` directly. Everything that
//! runs an external program goes through a [`ProcessSpawner`], so the sandbox
//! (or a scripted double in tests) decides how processes are actually started.

mod scripted;
mod tokio_spawner;

pub use scripted::{ProcessScript, ScriptedSpawner};
pub use tokio_spawner::TokioProcessSpawner;

use async_trait::async_trait;
use buildsmith_core::error::Result;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Readable output channel of a spawned process
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable input channel of a spawned process
pub type InputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything needed to start one external process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Command line for log messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Live handle on a spawned process
#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Stdout can be taken once; later calls return `None`
    fn take_stdout(&mut self) -> Option<OutputReader>;

    fn take_stderr(&mut self) -> Option<OutputReader>;

    fn take_stdin(&mut self) -> Option<InputWriter>;

    /// Wait for exit. Processes killed by a signal report `128 + signal`.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Ask the process to exit (SIGTERM on Unix)
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully kill the process
    async fn kill(&mut self) -> io::Result<()>;

    /// Current resident memory in bytes, when the platform exposes it
    fn memory_usage(&self) -> Option<u64>;
}

/// Capability to start external processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Fails with `BuildsmithError::ProcessSpawn` when the OS refuses to start it
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessHandle>>;
}

/// Terminate, wait up to `grace`, then kill
///
/// Returns the exit code the process finally reported.
pub async fn terminate_gracefully(handle: &mut dyn ProcessHandle, grace: Duration) -> io::Result<i32> {
    if let Err(e) = handle.terminate() {
        debug!("Terminate signal failed: {}", e);
    }

    tokio::select! {
        code = handle.wait() => code,
        _ = tokio::time::sleep(grace) => {
            warn!(
                pid = ?handle.id(),
                "Process did not exit within {}ms, killing",
                grace.as_millis()
            );
            handle.kill().await?;
            handle.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_request_builder() {
        let mut env = BTreeMap::new();
        env.insert("CC".to_string(), "clang".to_string());
        let request = SpawnRequest::new("make")
            .args(["-j", "4"])
            .working_dir("/tmp/project")
            .envs(&env);

        assert_eq!(request.display(), "make -j 4");
        assert_eq!(request.env.get("CC").map(String::as_str), Some("clang"));
        assert_eq!(request.working_dir, Some(PathBuf::from("/tmp/project")));
    }

    #[tokio::test]
    async fn test_terminate_gracefully_escalates_to_kill() {
        let spawner = ScriptedSpawner::new(ProcessScript::hang().ignore_terminate());
        let mut handle = spawner.spawn(&SpawnRequest::new("stubborn")).await.unwrap();

        let code = terminate_gracefully(handle.as_mut(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(code, 137);
        assert_eq!(spawner.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_gracefully_without_kill() {
        let spawner = ScriptedSpawner::new(ProcessScript::hang());
        let mut handle = spawner.spawn(&SpawnRequest::new("polite")).await.unwrap();

        let code = terminate_gracefully(handle.as_mut(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, 143);
        assert_eq!(spawner.kill_count(), 0);
    }
}
