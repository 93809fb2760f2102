//! Scripted process double
//!
//! Replays canned stdout/stderr/exit codes instead of starting real
//! processes, and records every spawn request it receives. Used by the test
//! suites of this crate and of the task manager.

use async_trait::async_trait;
use buildsmith_core::error::{BuildsmithError, Result};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{InputWriter, OutputReader, ProcessHandle, ProcessSpawner, SpawnRequest};

const SIGTERM_EXIT: i32 = 128 + 15;
const SIGKILL_EXIT: i32 = 128 + 9;

/// Behaviour of one scripted process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessScript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// How long the process runs; `None` runs until terminated or killed
    pub duration: Option<Duration>,
    /// Keep running after SIGTERM, only a kill stops it
    pub ignore_terminate: bool,
    /// Refuse to spawn with this reason
    pub spawn_error: Option<String>,
    pub memory_bytes: Option<u64>,
}

impl ProcessScript {
    /// Exits immediately with code 0
    pub fn succeed() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i32) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: code,
            duration: Some(Duration::ZERO),
            ignore_terminate: false,
            spawn_error: None,
            memory_bytes: None,
        }
    }

    /// Runs until terminated
    pub fn hang() -> Self {
        Self {
            duration: None,
            ..Self::succeed()
        }
    }

    pub fn fail_to_spawn(reason: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(reason.into()),
            ..Self::succeed()
        }
    }

    pub fn with_stdout(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdout = data.into();
        self
    }

    pub fn with_stderr(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stderr = data.into();
        self
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn ignore_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }
}

#[derive(Default)]
struct Counters {
    spawned: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    terminations: AtomicUsize,
    kills: AtomicUsize,
    next_pid: AtomicU32,
}

/// Process spawner that replays [`ProcessScript`]s
///
/// Scripts are looked up by command name. A command registered with a
/// sequence plays the scripts in order and then keeps repeating the last one.
pub struct ScriptedSpawner {
    default: ProcessScript,
    scripts: Mutex<HashMap<String, VecDeque<ProcessScript>>>,
    calls: Mutex<Vec<SpawnRequest>>,
    counters: Arc<Counters>,
}

impl ScriptedSpawner {
    pub fn new(default: ProcessScript) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_script(self, command: impl Into<String>, script: ProcessScript) -> Self {
        self.with_sequence(command, vec![script])
    }

    pub fn with_sequence(mut self, command: impl Into<String>, scripts: Vec<ProcessScript>) -> Self {
        self.scripts
            .get_mut()
            .insert(command.into(), scripts.into_iter().collect());
        self
    }

    /// Every request received so far, in arrival order
    pub async fn calls(&self) -> Vec<SpawnRequest> {
        self.calls.lock().await.clone()
    }

    /// Number of spawn requests, failed ones included
    pub fn call_count(&self) -> usize {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    /// Processes spawned and not yet exited
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    /// Highest number of processes alive at the same time
    pub fn peak_running(&self) -> usize {
        self.counters.peak_running.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.counters.terminations.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.counters.kills.load(Ordering::SeqCst)
    }

    async fn script_for(&self, command: &str) -> ProcessScript {
        let mut scripts = self.scripts.lock().await;
        match scripts.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| self.default.clone()),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| self.default.clone()),
            None => self.default.clone(),
        }
    }
}

#[async_trait]
impl ProcessSpawner for ScriptedSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessHandle>> {
        self.calls.lock().await.push(request.clone());
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);

        let script = self.script_for(&request.command).await;
        if let Some(reason) = script.spawn_error {
            return Err(BuildsmithError::ProcessSpawn {
                command: request.command.clone(),
                reason,
            });
        }

        let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_running.fetch_max(running, Ordering::SeqCst);
        let pid = self.counters.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;

        Ok(Box::new(ScriptedHandle {
            pid,
            deadline: script.duration.map(|d| Instant::now() + d),
            stdout: Some(Box::new(Cursor::new(script.stdout.clone()))),
            stderr: Some(Box::new(Cursor::new(script.stderr.clone()))),
            script,
            terminate: CancellationToken::new(),
            kill: CancellationToken::new(),
            exit: None,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedHandle {
    pid: u32,
    /// Natural exit time, fixed at spawn so `wait` can be polled repeatedly
    deadline: Option<Instant>,
    script: ProcessScript,
    stdout: Option<OutputReader>,
    stderr: Option<OutputReader>,
    terminate: CancellationToken,
    kill: CancellationToken,
    exit: Option<i32>,
    counters: Arc<Counters>,
}

impl ScriptedHandle {
    fn finish(&mut self, code: i32) -> i32 {
        if self.exit.is_none() {
            self.exit = Some(code);
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
        }
        code
    }
}

async fn run_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    fn id(&self) -> Option<u32> {
        self.exit.is_none().then_some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<OutputReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        self.stderr.take()
    }

    fn take_stdin(&mut self) -> Option<InputWriter> {
        Some(Box::new(tokio::io::sink()))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }

        let terminate = self.terminate.clone();
        let ignore_terminate = self.script.ignore_terminate;
        let terminated = async move {
            if ignore_terminate {
                std::future::pending::<()>().await
            } else {
                terminate.cancelled().await
            }
        };

        let code = tokio::select! {
            biased;
            _ = self.kill.cancelled() => SIGKILL_EXIT,
            _ = terminated => SIGTERM_EXIT,
            _ = run_until(self.deadline) => self.script.exit_code,
        };
        Ok(self.finish(code))
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.counters.terminations.fetch_add(1, Ordering::SeqCst);
        self.terminate.cancel();
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        self.kill.cancel();
        Ok(())
    }

    fn memory_usage(&self) -> Option<u64> {
        self.script.memory_bytes
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_replays_output_and_exit_code() {
        let spawner = ScriptedSpawner::new(ProcessScript::succeed())
            .with_script("cc", ProcessScript::exit(1).with_stderr("main.c:1:1: error: boom\n"));

        let mut handle = spawner.spawn(&SpawnRequest::new("cc")).await.unwrap();
        let mut err = String::new();
        handle.take_stderr().unwrap().read_to_string(&mut err).await.unwrap();
        assert_eq!(err, "main.c:1:1: error: boom\n");
        assert_eq!(handle.wait().await.unwrap(), 1);
        assert_eq!(spawner.running(), 0);

        let mut other = spawner.spawn(&SpawnRequest::new("ld")).await.unwrap();
        assert_eq!(other.wait().await.unwrap(), 0);
        assert_eq!(spawner.call_count(), 2);
        assert_eq!(spawner.calls().await[0].command, "cc");
    }

    #[tokio::test]
    async fn test_sequence_repeats_last_script() {
        let spawner = ScriptedSpawner::new(ProcessScript::succeed()).with_sequence(
            "installer",
            vec![ProcessScript::exit(2), ProcessScript::exit(0)],
        );
        let mut codes = Vec::new();
        for _ in 0..3 {
            let mut handle = spawner.spawn(&SpawnRequest::new("installer")).await.unwrap();
            codes.push(handle.wait().await.unwrap());
        }
        assert_eq!(codes, vec![2, 0, 0]);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded() {
        let spawner = ScriptedSpawner::new(ProcessScript::fail_to_spawn("permission denied"));
        let result = spawner.spawn(&SpawnRequest::new("cc")).await;
        assert!(matches!(result, Err(BuildsmithError::ProcessSpawn { .. })));
        assert_eq!(spawner.call_count(), 1);
        assert_eq!(spawner.running(), 0);
    }

    #[tokio::test]
    async fn test_hanging_process_tracks_peak() {
        let spawner = ScriptedSpawner::new(ProcessScript::hang());
        let mut first = spawner.spawn(&SpawnRequest::new("a")).await.unwrap();
        let second = spawner.spawn(&SpawnRequest::new("b")).await.unwrap();
        assert_eq!(spawner.running(), 2);
        drop(second);

        first.terminate().unwrap();
        assert_eq!(first.wait().await.unwrap(), SIGTERM_EXIT);
        assert_eq!(spawner.running(), 0);
        assert_eq!(spawner.peak_running(), 2);
    }
}
