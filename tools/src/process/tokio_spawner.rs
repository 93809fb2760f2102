//! Real subprocess spawning on top of `tokio::process`

use async_trait::async_trait;
use buildsmith_core::error::{BuildsmithError, Result};
use std::io;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error};

use super::{InputWriter, OutputReader, ProcessHandle, ProcessSpawner, SpawnRequest};

/// Spawns processes directly on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessSpawner;

impl TokioProcessSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSpawner for TokioProcessSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessHandle>> {
        debug!("Spawning process: {}", request.display());

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = request.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn '{}': {}", request.command, e);
            BuildsmithError::ProcessSpawn {
                command: request.command.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Box::new(TokioProcessHandle { child }))
    }
}

struct TokioProcessHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputReader> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputReader)
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputReader)
    }

    fn take_stdin(&mut self) -> Option<InputWriter> {
        self.child.stdin.take().map(|s| Box::new(s) as InputWriter)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(&status))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.child.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(io::Error::from),
            // Already reaped
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        match self.child.kill().await {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn memory_usage(&self) -> Option<u64> {
        self.child.id().and_then(resident_memory)
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// VmRSS from `/proc/<pid>/status`
#[cfg(target_os = "linux")]
fn resident_memory(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory(_pid: u32) -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tcc1\nVmPeak:\t  20480 kB\nVmRSS:\t   1536 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(1536 * 1024));
        assert_eq!(parse_vm_rss("Name:\tzombie\n"), None);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let spawner = TokioProcessSpawner::new();
        let result = spawner
            .spawn(&SpawnRequest::new("buildsmith-definitely-not-a-binary"))
            .await;
        assert!(matches!(result, Err(BuildsmithError::ProcessSpawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_captures_output_and_exit_code() {
        let spawner = TokioProcessSpawner::new();
        let request = SpawnRequest::new("sh")
            .args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let mut handle = spawner.spawn(&request).await.unwrap();

        let mut stdout = handle.take_stdout().unwrap();
        let mut stderr = handle.take_stderr().unwrap();
        assert!(handle.take_stdout().is_none());

        let mut out = String::new();
        let mut err = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        stderr.read_to_string(&mut err).await.unwrap();

        assert_eq!(handle.wait().await.unwrap(), 3);
        assert_eq!(out, "hello\n");
        assert_eq!(err, "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_reports_signal_exit() {
        let spawner = TokioProcessSpawner::new();
        let mut handle = spawner
            .spawn(&SpawnRequest::new("sleep").args(["30"]))
            .await
            .unwrap();

        handle.terminate().unwrap();
        assert_eq!(handle.wait().await.unwrap(), 128 + 15);
    }
}
