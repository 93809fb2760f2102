//! Task Manager
//!
//! Accepts compile tasks, keeps them in a priority queue and runs them on a
//! fixed pool of workers. Each worker takes the next task, consults the
//! cache, checks the toolchain, runs the compiler through the process
//! spawner and writes the outcome through to the cache and history before
//! publishing the terminal state. Finished tasks stay queryable until
//! `engine.retain_finished_tasks` newer ones have finished.

use buildsmith_core::cache::CacheManager;
use buildsmith_core::config::{EngineSettings, OutputSettings};
use buildsmith_core::error::{BuildsmithError, Result};
use buildsmith_core::hashing::{environment_hash, hash_sources};
use buildsmith_core::history::HistoryManager;
use buildsmith_core::models::{
    CompileHistoryEntry, CompileResult, CompileTask, FailureKind, TaskId, TaskStatus,
};
use buildsmith_tools::{
    terminate_gracefully, OutputEvent, OutputStreamHandler, ProcessSpawner, ToolchainManager,
};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command;
use super::queue::TaskQueue;
use super::result_builder::{self, ProcessOutcome};

/// Extra slack on top of the teardown grace while `cancel` waits
const CANCEL_ACK_SLACK: Duration = Duration::from_secs(1);

struct TaskSlot {
    task: CompileTask,
    status_tx: watch::Sender<TaskStatus>,
    output_tx: broadcast::Sender<OutputEvent>,
    cancel: CancellationToken,
    /// Set once the worker has settled the outcome; cancel no longer applies
    finalizing: bool,
}

#[derive(Default)]
struct EngineState {
    tasks: HashMap<TaskId, TaskSlot>,
    /// Submission order, for listings
    order: Vec<TaskId>,
    /// Terminal tasks, oldest first
    finished: VecDeque<TaskId>,
    queue: TaskQueue,
    running: usize,
}

impl EngineState {
    fn snapshot(&self) -> Vec<CompileTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|slot| slot.task.clone())
            .collect()
    }

    fn remove(&mut self, id: &TaskId) {
        self.tasks.remove(id);
        self.order.retain(|known| known != id);
    }

    /// Drop the oldest finished tasks beyond `retain`
    fn evict_finished(&mut self, retain: usize) {
        while self.finished.len() > retain.max(1) {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            self.remove(&oldest);
            debug!(task_id = %oldest, "Evicted finished task");
        }
    }
}

/// A claimed task, owned by one worker until it reaches a terminal state
struct Job {
    task: CompileTask,
    cancel: CancellationToken,
    output_tx: broadcast::Sender<OutputEvent>,
}

struct JobOutcome {
    status: TaskStatus,
    result: CompileResult,
    stdout: String,
    stderr: String,
    /// Set only for fresh successful runs
    cache_key: Option<String>,
    toolchain_version: Option<String>,
}

impl JobOutcome {
    fn without_output(status: TaskStatus, result: CompileResult) -> Self {
        Self {
            status,
            result,
            stdout: String::new(),
            stderr: String::new(),
            cache_key: None,
            toolchain_version: None,
        }
    }

    /// Outcome for a task whose cancellation won over its result
    fn into_cancelled(self) -> Self {
        let elapsed = Duration::from_millis(self.result.execution_time_ms);
        Self {
            status: TaskStatus::Cancelled,
            result: result_builder::cancelled(Some(elapsed)),
            stdout: self.stdout,
            stderr: self.stderr,
            cache_key: None,
            toolchain_version: None,
        }
    }
}

enum ProcessEnd {
    Exited(std::io::Result<i32>),
    Cancelled,
}

struct Shared {
    state: Mutex<EngineState>,
    work_available: Notify,
    shutdown: CancellationToken,
    spawner: Arc<dyn ProcessSpawner>,
    toolchains: Arc<ToolchainManager>,
    cache: Arc<CacheManager>,
    history: Arc<HistoryManager>,
    engine: EngineSettings,
    output: OutputSettings,
    snapshots_tx: broadcast::Sender<Vec<CompileTask>>,
}

pub struct TaskManager {
    shared: Arc<Shared>,
    workers: Mutex<JoinSet<()>>,
}

impl TaskManager {
    /// Create the manager and start its worker pool
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        toolchains: Arc<ToolchainManager>,
        cache: Arc<CacheManager>,
        history: Arc<HistoryManager>,
        engine: EngineSettings,
        output: OutputSettings,
    ) -> Self {
        let worker_count = engine.concurrency_limit().max(1);
        let (snapshots_tx, _) = broadcast::channel(engine.event_channel_capacity.max(1));
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState::default()),
            work_available: Notify::new(),
            shutdown: CancellationToken::new(),
            spawner,
            toolchains,
            cache,
            history,
            engine,
            output,
            snapshots_tx,
        });

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            workers.spawn(worker_loop(Arc::clone(&shared), worker));
        }
        info!("Task manager started with {} workers", worker_count);

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Validate and enqueue a task; returns without waiting for it to run
    pub async fn submit(&self, mut task: CompileTask) -> Result<TaskId> {
        if task.source_files.is_empty() {
            return Err(BuildsmithError::InvalidTask(
                "Task has no source files".to_string(),
            ));
        }
        if task.config.command.trim().is_empty() {
            return Err(BuildsmithError::InvalidTask(
                "Compiler command is empty".to_string(),
            ));
        }
        if self.shared.toolchains.registry().get(task.language).is_none() {
            return Err(BuildsmithError::InvalidTask(format!(
                "Unsupported target language: {}",
                task.language
            )));
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(BuildsmithError::Validation(
                "Task manager is shut down".to_string(),
            ));
        }

        task.status = TaskStatus::Pending;
        task.created_at = Utc::now();
        task.started_at = None;
        task.finished_at = None;
        task.stdout.clear();
        task.stderr.clear();
        task.exit_code = None;
        task.result = None;

        let id = task.id;
        let priority = task.priority;
        {
            let mut state = self.shared.state.lock().await;
            if state.tasks.contains_key(&id) {
                return Err(BuildsmithError::InvalidTask(format!(
                    "Task {} was already submitted",
                    id
                )));
            }
            let (status_tx, _) = watch::channel(TaskStatus::Pending);
            let (output_tx, _) = broadcast::channel(self.shared.engine.event_channel_capacity.max(1));
            state.tasks.insert(
                id,
                TaskSlot {
                    task,
                    status_tx,
                    output_tx,
                    cancel: CancellationToken::new(),
                    finalizing: false,
                },
            );
            state.order.push(id);
            state.queue.push(id, priority);
            self.shared.publish(&state);
        }
        debug!(task_id = %id, ?priority, "Task queued");
        self.shared.work_available.notify_one();
        Ok(id)
    }

    /// Cancel a pending or running task
    ///
    /// A running task is terminated and this waits (bounded) for its
    /// teardown. Returns true only when the task ends up CANCELLED; false
    /// when it is unknown, already terminal, already being cancelled, or its
    /// worker had already settled the outcome.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let mut status_rx = {
            let mut state = self.shared.state.lock().await;
            let Some(slot) = state.tasks.get(&id) else {
                return false;
            };
            match slot.task.status {
                TaskStatus::Pending => {
                    state.queue.remove(&id);
                    let cancelled = self.shared.apply_terminal(
                        &mut state,
                        id,
                        TaskStatus::Cancelled,
                        result_builder::cancelled(None),
                        String::new(),
                        String::new(),
                    );
                    drop(state);
                    info!(task_id = %id, "Cancelled pending task");
                    if let Some(task) = cancelled {
                        self.shared.record_history(task).await;
                    }
                    return true;
                }
                TaskStatus::Running => {
                    if slot.cancel.is_cancelled() || slot.finalizing {
                        return false;
                    }
                    slot.cancel.cancel();
                    slot.status_tx.subscribe()
                }
                _ => return false,
            }
        };

        info!(task_id = %id, "Cancelling running task");
        let deadline = self.shared.engine.teardown_grace() * 2 + CANCEL_ACK_SLACK;
        let acknowledged =
            match tokio::time::timeout(deadline, status_rx.wait_for(|s| s.is_terminal())).await {
                Ok(Ok(status)) => *status == TaskStatus::Cancelled,
                // Slot evicted; the outcome was settled as cancelled before that
                Ok(Err(_)) => true,
                Err(_) => {
                    warn!(task_id = %id, "Task did not acknowledge cancellation in time");
                    true
                }
            };
        acknowledged
    }

    /// Drop a finished task from memory; false when unknown or still active
    pub async fn forget(&self, id: TaskId) -> bool {
        let mut state = self.shared.state.lock().await;
        match state.tasks.get(&id) {
            Some(slot) if slot.task.status.is_terminal() => {}
            _ => return false,
        }
        state.remove(&id);
        state.finished.retain(|known| *known != id);
        self.shared.publish(&state);
        true
    }

    pub async fn get_state(&self, id: TaskId) -> Option<CompileTask> {
        let state = self.shared.state.lock().await;
        state.tasks.get(&id).map(|slot| slot.task.clone())
    }

    /// Every known task in submission order
    pub async fn list_all(&self) -> Vec<CompileTask> {
        self.shared.state.lock().await.snapshot()
    }

    /// Live status of one task
    ///
    /// Yields the current status first, then each change, and completes after
    /// the terminal status.
    pub async fn observe_state(&self, id: TaskId) -> Option<BoxStream<'static, TaskStatus>> {
        let rx = {
            let state = self.shared.state.lock().await;
            state.tasks.get(&id)?.status_tx.subscribe()
        };
        Some(status_stream(rx))
    }

    /// All tasks, re-emitted on every state change
    ///
    /// Slow subscribers skip snapshots they fell behind on.
    pub fn observe_all(&self) -> BoxStream<'static, Vec<CompileTask>> {
        BroadcastStream::new(self.shared.snapshots_tx.subscribe())
            .filter_map(|snapshot| async move { snapshot.ok() })
            .boxed()
    }

    /// Live output events of one task
    pub async fn subscribe_output(&self, id: TaskId) -> Option<broadcast::Receiver<OutputEvent>> {
        let state = self.shared.state.lock().await;
        state.tasks.get(&id).map(|slot| slot.output_tx.subscribe())
    }

    /// Wait until the task is terminal and return it
    pub async fn wait_for(&self, id: TaskId) -> Option<CompileTask> {
        let mut rx = {
            let state = self.shared.state.lock().await;
            state.tasks.get(&id)?.status_tx.subscribe()
        };
        if rx.wait_for(|s| s.is_terminal()).await.is_err() {
            debug!(task_id = %id, "Status channel closed before a terminal state");
        }
        self.get_state(id).await
    }

    /// Submit and block until the task finishes
    ///
    /// Entry point for external schedulers.
    pub async fn run_to_completion(&self, task: CompileTask) -> Result<CompileTask> {
        let id = self.submit(task).await?;
        self.wait_for(id)
            .await
            .ok_or_else(|| BuildsmithError::Validation(format!("Task {} disappeared", id)))
    }

    pub async fn queue_len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    pub async fn running_count(&self) -> usize {
        self.shared.state.lock().await.running
    }

    /// Stop accepting work, cancel everything in flight and join the workers
    pub async fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down task manager");
        self.shared.shutdown.cancel();

        let pending = {
            let mut state = self.shared.state.lock().await;
            let queued = state.queue.drain();
            let mut cancelled = Vec::with_capacity(queued.len());
            for id in queued {
                if let Some(task) = self.shared.apply_terminal(
                    &mut state,
                    id,
                    TaskStatus::Cancelled,
                    result_builder::cancelled(None),
                    String::new(),
                    String::new(),
                ) {
                    cancelled.push(task);
                }
            }
            for slot in state.tasks.values() {
                if slot.task.status == TaskStatus::Running {
                    slot.cancel.cancel();
                }
            }
            cancelled
        };
        for task in pending {
            self.shared.record_history(task).await;
        }

        let mut workers = self.workers.lock().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker crashed: {}", e);
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

fn status_stream(rx: watch::Receiver<TaskStatus>) -> BoxStream<'static, TaskStatus> {
    stream::unfold((rx, true, false), |(mut rx, first, done)| async move {
        if done {
            return None;
        }
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let status = *rx.borrow_and_update();
        Some((status, (rx, false, status.is_terminal())))
    })
    .boxed()
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "Worker started");
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        match shared.claim_next().await {
            Some(job) => shared.execute(job).await,
            None => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.work_available.notified() => {}
                }
            }
        }
    }
    debug!(worker, "Worker stopped");
}

impl Shared {
    fn publish(&self, state: &EngineState) {
        if self.snapshots_tx.receiver_count() > 0 {
            let _ = self.snapshots_tx.send(state.snapshot());
        }
    }

    /// Pop the next pending task and mark it RUNNING
    async fn claim_next(&self) -> Option<Job> {
        let mut state = self.state.lock().await;
        while let Some(id) = state.queue.pop() {
            let Some(slot) = state.tasks.get_mut(&id) else {
                continue;
            };
            if !slot.task.status.can_transition_to(TaskStatus::Running) {
                continue;
            }
            slot.task.status = TaskStatus::Running;
            slot.task.started_at = Some(Utc::now());
            slot.status_tx.send_replace(TaskStatus::Running);
            let job = Job {
                task: slot.task.clone(),
                cancel: slot.cancel.clone(),
                output_tx: slot.output_tx.clone(),
            };
            state.running += 1;
            self.publish(&state);
            return Some(job);
        }
        None
    }

    async fn execute(&self, job: Job) {
        let id = job.task.id;
        info!(task_id = %id, language = %job.task.language, "Running task");
        let mut outcome = self.run_job(&job).await;

        {
            let mut state = self.state.lock().await;
            if job.cancel.is_cancelled() && outcome.status != TaskStatus::Cancelled {
                debug!(task_id = %id, "Cancelled after the run finished, discarding {}", outcome.status);
                outcome = outcome.into_cancelled();
            }
            if let Some(slot) = state.tasks.get_mut(&id) {
                slot.finalizing = true;
            }
        }

        if let Some(ref key) = outcome.cache_key {
            let mut extra = BTreeMap::new();
            extra.insert("task_id".to_string(), id.to_string());
            extra.insert("language".to_string(), job.task.language.to_string());
            if let Some(ref version) = outcome.toolchain_version {
                extra.insert("toolchain_version".to_string(), version.clone());
            }
            let artifacts = outcome.result.output_files.clone();
            if let Err(e) = self.cache.save_cache(key, &outcome.result, artifacts, extra).await {
                warn!(task_id = %id, fingerprint = %key, "Cache write skipped: {}", e);
            }
        }

        let mut finished = job.task.clone();
        finished.status = outcome.status;
        finished.finished_at = Some(Utc::now());
        finished.stdout = outcome.stdout.clone();
        finished.stderr = outcome.stderr.clone();
        finished.exit_code = outcome.result.exit_code;
        finished.result = Some(outcome.result.clone());
        self.record_history(finished).await;

        let mut state = self.state.lock().await;
        state.running = state.running.saturating_sub(1);
        self.apply_terminal(
            &mut state,
            id,
            outcome.status,
            outcome.result,
            outcome.stdout,
            outcome.stderr,
        );
        drop(state);
        info!(task_id = %id, status = %outcome.status, "Task finished");
    }

    async fn run_job(&self, job: &Job) -> JobOutcome {
        let task = &job.task;
        let toolchain_version = self.toolchains.installed_version(task.language).await;

        let fingerprint = if self.cache.is_enabled() {
            let version = toolchain_version.as_deref().unwrap_or("none");
            match self.cache.fingerprint(task, version).await {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(task_id = %task.id, "Skipping cache, fingerprint failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        if let Some(ref key) = fingerprint {
            if let Some(entry) = self.cache.lookup(key).await {
                if job.cancel.is_cancelled() {
                    return JobOutcome::without_output(
                        TaskStatus::Cancelled,
                        result_builder::cancelled(None),
                    );
                }
                info!(task_id = %task.id, fingerprint = %key, "Serving task from cache");
                return JobOutcome::without_output(
                    TaskStatus::Success,
                    result_builder::from_cache(&entry),
                );
            }
        }

        if !self.toolchains.is_installed(task.language).await {
            let error = BuildsmithError::ToolchainMissing(task.language);
            warn!(task_id = %task.id, "{}", error);
            return JobOutcome::without_output(
                TaskStatus::Failed,
                result_builder::from_error(FailureKind::ToolchainMissing, &error),
            );
        }
        self.toolchains.mark_used(task.language).await;

        if job.cancel.is_cancelled() {
            return JobOutcome::without_output(TaskStatus::Cancelled, result_builder::cancelled(None));
        }

        let mut outcome = self.run_process(job).await;
        if outcome.status == TaskStatus::Success {
            outcome.cache_key = fingerprint;
            outcome.toolchain_version = toolchain_version;
        }
        outcome
    }

    async fn run_process(&self, job: &Job) -> JobOutcome {
        let task = &job.task;
        let request = command::spawn_request(task);
        let started = Instant::now();

        let mut handle = match self.spawner.spawn(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(task_id = %task.id, "{}", e);
                return JobOutcome::without_output(
                    TaskStatus::Failed,
                    result_builder::from_error(FailureKind::ProcessSpawn, &e),
                );
            }
        };
        debug!(task_id = %task.id, pid = ?handle.id(), "Spawned {}", request.display());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut handler = OutputStreamHandler::attach(handle.as_mut(), &self.output, Some(events_tx));

        let mut peak_memory = handle.memory_usage().unwrap_or(0);
        let sample_every = Duration::from_millis(self.engine.memory_sample_interval_ms.max(1));
        let mut sampler = tokio::time::interval(sample_every);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => break ProcessEnd::Cancelled,
                exit = handle.wait() => break ProcessEnd::Exited(exit),
                Some(event) = events_rx.recv() => {
                    let _ = job.output_tx.send(event);
                }
                _ = sampler.tick() => {
                    if let Some(bytes) = handle.memory_usage() {
                        peak_memory = peak_memory.max(bytes);
                    }
                }
            }
        };

        let grace = self.engine.teardown_grace();
        let exit = match end {
            ProcessEnd::Cancelled => {
                match terminate_gracefully(handle.as_mut(), grace).await {
                    Ok(code) => debug!(task_id = %task.id, code, "Cancelled process exited"),
                    Err(e) => warn!(task_id = %task.id, "Failed to tear down process: {}", e),
                }
                None
            }
            ProcessEnd::Exited(exit) => Some(exit),
        };

        handler.finish(grace).await;
        while let Ok(event) = events_rx.try_recv() {
            let _ = job.output_tx.send(event);
        }
        let discarded = handler.discarded_bytes().await;
        if discarded > 0 {
            debug!(task_id = %task.id, discarded, "Output was truncated");
        }
        let stdout = handler.get_output().await;
        let stderr = handler.get_error_output().await;
        let execution_time = started.elapsed();

        let code = match exit {
            None => {
                return JobOutcome {
                    status: TaskStatus::Cancelled,
                    result: result_builder::cancelled(Some(execution_time)),
                    stdout,
                    stderr,
                    cache_key: None,
                    toolchain_version: None,
                };
            }
            Some(Ok(code)) => code,
            Some(Err(e)) => {
                let error = BuildsmithError::ProcessSpawn {
                    command: request.command.clone(),
                    reason: format!("waiting for exit failed: {}", e),
                };
                error!(task_id = %task.id, "{}", error);
                return JobOutcome {
                    status: TaskStatus::Failed,
                    result: result_builder::from_error(FailureKind::ProcessSpawn, &error),
                    stdout,
                    stderr,
                    cache_key: None,
                    toolchain_version: None,
                };
            }
        };

        let outcome = ProcessOutcome {
            exit_code: code,
            execution_time,
            peak_memory_bytes: peak_memory,
            output: handler.parse_output_for_info().await,
            stderr: stderr.clone(),
        };
        let output_files = existing_outputs(task).await;
        let source_lines = count_source_lines(task).await;
        let result = result_builder::from_process(task, outcome, output_files, source_lines);
        let status = if result.success {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };

        JobOutcome {
            status,
            result,
            stdout,
            stderr,
            cache_key: None,
            toolchain_version: None,
        }
    }

    /// Move a task into a terminal state and notify observers
    ///
    /// Returns the finished task, or `None` when the transition is illegal.
    fn apply_terminal(
        &self,
        state: &mut EngineState,
        id: TaskId,
        status: TaskStatus,
        result: CompileResult,
        stdout: String,
        stderr: String,
    ) -> Option<CompileTask> {
        let slot = state.tasks.get_mut(&id)?;
        if !slot.task.status.can_transition_to(status) {
            warn!(
                task_id = %id,
                "Ignoring transition {} -> {}",
                slot.task.status,
                status
            );
            return None;
        }
        slot.task.status = status;
        slot.task.finished_at = Some(Utc::now());
        slot.task.exit_code = result.exit_code;
        slot.task.stdout = stdout;
        slot.task.stderr = stderr;
        slot.task.result = Some(result);
        slot.status_tx.send_replace(status);
        let finished = slot.task.clone();
        state.finished.push_back(id);
        state.evict_finished(self.engine.retain_finished_tasks);
        self.publish(state);
        Some(finished)
    }

    /// Best-effort history append
    async fn record_history(&self, task: CompileTask) {
        let file_hashes = match hash_sources(&task).await {
            Ok(hashes) => hashes.into_iter().collect(),
            Err(e) => {
                debug!(task_id = %task.id, "Could not hash sources for history: {}", e);
                BTreeMap::new()
            }
        };
        let env_hash = environment_hash(&task.environment, &task.working_dir);
        let result = task.result.clone().unwrap_or_default();
        let entry = CompileHistoryEntry::new(task, result, env_hash, file_hashes);
        if let Err(e) = self.history.record_history(entry).await {
            warn!("History append skipped: {}", e);
        }
    }
}

/// Configured output path, if the run produced it
async fn existing_outputs(task: &CompileTask) -> Vec<PathBuf> {
    let Some(ref output) = task.config.output_path else {
        return Vec::new();
    };
    let path = if output.is_absolute() {
        output.clone()
    } else {
        task.working_dir.join(output)
    };
    match tokio::fs::try_exists(&path).await {
        Ok(true) => vec![path],
        _ => Vec::new(),
    }
}

async fn count_source_lines(task: &CompileTask) -> usize {
    let mut total = 0;
    for source in &task.source_files {
        let path = if source.is_absolute() {
            source.clone()
        } else {
            task.working_dir.join(source)
        };
        if let Ok(content) = tokio::fs::read(&path).await {
            total += content.iter().filter(|b| **b == b'\n').count();
        }
    }
    total
}
