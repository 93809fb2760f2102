//! Output Stream Handler
//!
//! Wraps the two output channels of one spawned process. Each channel gets its
//! own drain task that appends raw text into a shared bounded buffer and
//! forwards complete lines to a dispatcher task. The dispatcher classifies
//! lines and pushes [`OutputEvent`]s to the registered listener, so drain
//! loops never wait on parsing or on the listener.

mod buffer;
mod parser;

pub use parser::{classify_line, summarize, LineKind, OutputSummary, ProgressTracker};

use buffer::{LineAssembler, OutputBuffers, Utf8Decoder};
use buildsmith_core::config::OutputSettings;
use buildsmith_core::error::BuildsmithError;
use buildsmith_core::models::{CompileMessage, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::{OutputReader, ProcessHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputChannel::Stdout => f.write_str("stdout"),
            OutputChannel::Stderr => f.write_str("stderr"),
        }
    }
}

/// Live event parsed from process output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputEvent {
    Progress { percent: u8 },
    FileProcessed { channel: OutputChannel, file: String },
    Warning { channel: OutputChannel, message: CompileMessage },
    Error { channel: OutputChannel, message: CompileMessage },
    Output { channel: OutputChannel, line: String },
}

/// Sink for live output events
pub type OutputListener = mpsc::UnboundedSender<OutputEvent>;

enum DrainMessage {
    Line(OutputChannel, String),
    ReadFailed(OutputChannel, String),
}

pub struct OutputStreamHandler {
    buffers: Arc<Mutex<OutputBuffers>>,
    started_at: Instant,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl OutputStreamHandler {
    /// Start draining both channels
    ///
    /// A missing channel is treated as already closed.
    pub fn start(
        settings: &OutputSettings,
        stdout: Option<OutputReader>,
        stderr: Option<OutputReader>,
        listener: Option<OutputListener>,
    ) -> Self {
        let buffers = Arc::new(Mutex::new(OutputBuffers::new(settings.max_buffer_bytes)));
        let cancel = CancellationToken::new();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let chunk_size = settings.read_chunk_size.max(1);

        let mut tasks = Vec::with_capacity(3);
        for (channel, reader) in [(OutputChannel::Stdout, stdout), (OutputChannel::Stderr, stderr)] {
            if let Some(reader) = reader {
                tasks.push(tokio::spawn(drain(
                    channel,
                    reader,
                    chunk_size,
                    Arc::clone(&buffers),
                    lines_tx.clone(),
                    cancel.clone(),
                )));
            }
        }
        drop(lines_tx);

        tasks.push(tokio::spawn(dispatch(
            lines_rx,
            listener,
            Duration::from_millis(settings.progress_interval_ms),
        )));

        Self {
            buffers,
            started_at: Instant::now(),
            cancel,
            tasks,
        }
    }

    /// Take the output channels of `handle` and start draining them
    pub fn attach(
        handle: &mut dyn ProcessHandle,
        settings: &OutputSettings,
        listener: Option<OutputListener>,
    ) -> Self {
        let stdout = handle.take_stdout();
        let stderr = handle.take_stderr();
        Self::start(settings, stdout, stderr, listener)
    }

    pub async fn get_output(&self) -> String {
        self.buffers.lock().await.get(OutputChannel::Stdout).to_string()
    }

    pub async fn get_error_output(&self) -> String {
        self.buffers.lock().await.get(OutputChannel::Stderr).to_string()
    }

    /// Bytes dropped from the front of the buffers so far
    pub async fn discarded_bytes(&self) -> usize {
        self.buffers.lock().await.discarded()
    }

    /// Wall-clock time since the handler started
    pub fn get_execution_time(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// One-shot structured extraction over everything currently buffered
    pub async fn parse_output_for_info(&self) -> OutputSummary {
        let buffers = self.buffers.lock().await;
        summarize([
            buffers.get(OutputChannel::Stdout),
            buffers.get(OutputChannel::Stderr),
        ])
    }

    /// Cancel both drain loops; the process itself is left alone
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until both channels hit end of stream and every event was dispatched
    pub async fn wait_for_drain(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Output task ended abnormally: {}", e);
            }
        }
    }

    /// Wait for the drain up to `timeout`, then stop the loops
    ///
    /// Covers grandchildren that keep a pipe open after the process exited.
    pub async fn finish(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.tasks.is_empty() {
            let outcome = tokio::time::timeout_at(deadline, &mut self.tasks[0]).await;
            match outcome {
                Ok(joined) => {
                    if let Err(e) = joined {
                        debug!("Output task ended abnormally: {}", e);
                    }
                    self.tasks.remove(0);
                }
                Err(_) => {
                    debug!(
                        "Output drain did not finish within {}ms, stopping",
                        timeout.as_millis()
                    );
                    self.stop();
                    self.wait_for_drain().await;
                    return;
                }
            }
        }
    }
}

impl Drop for OutputStreamHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain(
    channel: OutputChannel,
    mut reader: OutputReader,
    chunk_size: usize,
    buffers: Arc<Mutex<OutputBuffers>>,
    lines_tx: mpsc::UnboundedSender<DrainMessage>,
    cancel: CancellationToken,
) {
    let mut chunk = vec![0u8; chunk_size];
    let mut decoder = Utf8Decoder::default();
    let mut lines = LineAssembler::default();

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&chunk[..n]);
                push_text(channel, &text, &buffers, &mut lines, &lines_tx).await;
            }
            Err(e) => {
                warn!("Failed to read {}: {}", channel, e);
                let _ = lines_tx.send(DrainMessage::ReadFailed(channel, e.to_string()));
                break;
            }
        }
    }

    let tail = decoder.finish();
    push_text(channel, &tail, &buffers, &mut lines, &lines_tx).await;
    if let Some(line) = lines.finish() {
        let _ = lines_tx.send(DrainMessage::Line(channel, line));
    }
    debug!("{} drain finished", channel);
}

async fn push_text(
    channel: OutputChannel,
    text: &str,
    buffers: &Mutex<OutputBuffers>,
    lines: &mut LineAssembler,
    lines_tx: &mpsc::UnboundedSender<DrainMessage>,
) {
    if text.is_empty() {
        return;
    }

    {
        let mut buffers = buffers.lock().await;
        let discarded = buffers.append(channel, text);
        // Log only the first truncation
        if discarded > 0 && buffers.discarded() == discarded {
            let overflow = BuildsmithError::OutputOverflow {
                limit: buffers.ceiling(),
                discarded,
            };
            warn!("{}", overflow);
        }
    }

    for line in lines.push(text) {
        let _ = lines_tx.send(DrainMessage::Line(channel, line));
    }
}

async fn dispatch(
    mut lines_rx: mpsc::UnboundedReceiver<DrainMessage>,
    listener: Option<OutputListener>,
    progress_interval: Duration,
) {
    let mut tracker = ProgressTracker::new(progress_interval);

    while let Some(message) = lines_rx.recv().await {
        let Some(ref listener) = listener else {
            continue;
        };
        match message {
            DrainMessage::Line(channel, line) => {
                for event in line_events(channel, line, &mut tracker) {
                    let _ = listener.send(event);
                }
            }
            DrainMessage::ReadFailed(channel, reason) => {
                let message = CompileMessage::new(
                    Severity::Error,
                    format!("Failed to read {}: {}", channel, reason),
                );
                let _ = listener.send(OutputEvent::Error { channel, message });
            }
        }
    }
}

fn line_events(channel: OutputChannel, line: String, tracker: &mut ProgressTracker) -> Vec<OutputEvent> {
    let kind = classify_line(&line);
    let progress = tracker.observe(&kind, Instant::now());

    let mut events = Vec::with_capacity(2);
    match kind {
        LineKind::Progress(_) => {}
        LineKind::Error(message) => events.push(OutputEvent::Error { channel, message }),
        LineKind::Warning(message) => events.push(OutputEvent::Warning { channel, message }),
        LineKind::FileProcessed(file) => events.push(OutputEvent::FileProcessed { channel, file }),
        LineKind::Suggestion(_)
        | LineKind::Location { .. }
        | LineKind::Dependency { .. }
        | LineKind::Plain => events.push(OutputEvent::Output { channel, line }),
    }
    if let Some(percent) = progress {
        events.push(OutputEvent::Progress { percent });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    fn settings(max_buffer_bytes: usize) -> OutputSettings {
        OutputSettings {
            max_buffer_bytes,
            read_chunk_size: 64,
            progress_interval_ms: 1_000,
        }
    }

    fn reader(text: &str) -> Option<OutputReader> {
        Some(Box::new(Cursor::new(text.as_bytes().to_vec())))
    }

    /// Reader that yields some bytes and then fails
    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.sent {
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "pipe broke")))
            } else {
                self.sent = true;
                buf.put_slice(b"partial line\n");
                Poll::Ready(Ok(()))
            }
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<OutputEvent>) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_captures_both_channels_and_emits_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handler = OutputStreamHandler::start(
            &settings(1024 * 1024),
            reader("[10%] a\n[20%] b\n[30%] c\nlinking\n"),
            reader("main.c:1:2: warning: unused variable 'x'\n"),
            Some(tx),
        );
        handler.wait_for_drain().await;

        assert_eq!(handler.get_output().await, "[10%] a\n[20%] b\n[30%] c\nlinking\n");
        assert!(handler.get_error_output().await.contains("unused variable"));

        let events = collect(rx).await;
        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Progress { percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 20, 30]);
        assert!(events.iter().any(|e| matches!(e, OutputEvent::Warning { channel: OutputChannel::Stderr, .. })));
        assert!(events.iter().any(|e| matches!(e, OutputEvent::Output { line, .. } if line == "linking")));

        let summary = handler.parse_output_for_info().await;
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.final_progress(), Some(30));
    }

    #[tokio::test]
    async fn test_buffer_never_exceeds_ceiling() {
        let ceiling = 4096;
        let big_out = "o".repeat(3 * ceiling) + "\nlast stdout line\n";
        let big_err = "e".repeat(2 * ceiling) + "\nfinal error: boom\n";
        let mut handler = OutputStreamHandler::start(
            &settings(ceiling),
            reader(&big_out),
            reader(&big_err),
            None,
        );
        handler.wait_for_drain().await;

        let out = handler.get_output().await;
        let err = handler.get_error_output().await;
        assert!(out.len() + err.len() <= ceiling);
        assert!(out.ends_with("last stdout line\n"));
        assert!(err.ends_with("final error: boom\n"));
        assert!(handler.discarded_bytes().await > 0);
    }

    #[tokio::test]
    async fn test_read_failure_reports_single_error_and_other_channel_continues() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handler = OutputStreamHandler::start(
            &settings(1024),
            reader("still here\n"),
            Some(Box::new(FailingReader { sent: false })),
            Some(tx),
        );
        handler.wait_for_drain().await;

        assert_eq!(handler.get_output().await, "still here\n");
        assert_eq!(handler.get_error_output().await, "partial line\n");

        let events = collect(rx).await;
        let read_errors = events
            .iter()
            .filter(|e| matches!(e, OutputEvent::Error { message, .. } if message.message.contains("pipe broke")))
            .count();
        assert_eq!(read_errors, 1);
        assert!(events.iter().any(|e| matches!(e, OutputEvent::Output { line, .. } if line == "still here")));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_ends_drain() {
        let (_keep_open, pipe) = tokio::io::duplex(64);
        let mut handler =
            OutputStreamHandler::start(&settings(1024), Some(Box::new(pipe)), None, None);

        assert!(!handler.is_stopped());
        handler.stop();
        handler.stop();
        assert!(handler.is_stopped());
        handler.wait_for_drain().await;
        assert!(handler.get_execution_time() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_finish_stops_stuck_drain() {
        let (_keep_open, pipe) = tokio::io::duplex(64);
        let mut handler =
            OutputStreamHandler::start(&settings(1024), Some(Box::new(pipe)), None, None);
        handler.finish(Duration::from_millis(20)).await;
        assert!(handler.is_stopped());
    }
}
