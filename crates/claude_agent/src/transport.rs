//! Subprocess transport: one child process framed as a line-delimited JSON
//! duplex with multi-subscriber fan-out.
//!
//! The [`Transport`] trait is the plug-in point: hosts can inject mocks or
//! non-subprocess transports as long as they honor the same contract
//! (ordered fan-out, terminal exit event, serialized writes).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::options::{AgentOptions, StderrLineHandler};

/// How long `close` waits for the child to exit before force-killing it.
/// Closing the pipes while the CLI is still writing provokes spurious
/// broken-pipe errors in the child, so it gets a moment to finish.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const READ_CHUNK_BYTES: usize = 8192;

/// Inbound transport events, fanned out to every subscriber in arrival
/// order. `Exited` is always the final event.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Line(String),
    Exited { status: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected,
    Error,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&mut self) -> Result<(), AgentError>;
    /// Writes one payload line; a trailing newline is appended if absent.
    async fn send(&self, payload: &str) -> Result<(), AgentError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    async fn close(&mut self) -> Result<(), AgentError>;
    fn status(&self) -> TransportStatus;
}

/// Shared connection-state cell readable from any task.
#[derive(Debug, Clone, Default)]
struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    const DISCONNECTED: u8 = 0;
    const CONNECTED: u8 = 1;
    const ERROR: u8 = 2;

    fn set(&self, status: TransportStatus) {
        let raw = match status {
            TransportStatus::Disconnected => Self::DISCONNECTED,
            TransportStatus::Connected => Self::CONNECTED,
            TransportStatus::Error => Self::ERROR,
        };
        self.0.store(raw, Ordering::Release);
    }

    fn get(&self) -> TransportStatus {
        match self.0.load(Ordering::Acquire) {
            Self::CONNECTED => TransportStatus::Connected,
            Self::ERROR => TransportStatus::Error,
            _ => TransportStatus::Disconnected,
        }
    }
}

/// Accumulates raw reads into newline-delimited lines, enforcing a maximum
/// line length. Oversized lines are discarded wholesale rather than split.
struct LineAccumulator {
    max_line_bytes: usize,
    buf: Vec<u8>,
    overflow: bool,
    observed_bytes: usize,
}

enum LineOutcome {
    Line(String),
    TooLong { observed_bytes: usize },
    InvalidUtf8,
}

impl LineAccumulator {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            buf: Vec::new(),
            overflow: false,
            observed_bytes: 0,
        }
    }

    fn push(&mut self, chunk: &[u8], out: &mut Vec<LineOutcome>) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            self.extend(head);
            out.push(self.finish_line());
            rest = &tail[1..];
        }
        self.extend(rest);
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.observed_bytes = self.observed_bytes.saturating_add(bytes.len());
        if self.overflow {
            return;
        }
        if self.observed_bytes > self.max_line_bytes {
            self.overflow = true;
            self.buf.clear();
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    fn finish_line(&mut self) -> LineOutcome {
        let outcome = if self.overflow {
            LineOutcome::TooLong {
                observed_bytes: self.observed_bytes,
            }
        } else {
            let mut bytes = std::mem::take(&mut self.buf);
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            match String::from_utf8(bytes) {
                Ok(line) => LineOutcome::Line(line),
                Err(_) => LineOutcome::InvalidUtf8,
            }
        };
        self.buf.clear();
        self.overflow = false;
        self.observed_bytes = 0;
        outcome
    }

    fn has_partial(&self) -> bool {
        self.overflow || !self.buf.is_empty()
    }
}

/// Spawns and owns the CLI subprocess.
pub struct SubprocessTransport {
    binary: Option<PathBuf>,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stderr_handler: Option<StderrLineHandler>,
    max_line_bytes: usize,
    events: broadcast::Sender<TransportEvent>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    status: StatusCell,
    shutdown: Option<watch::Sender<bool>>,
    reader_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl SubprocessTransport {
    pub fn new(args: Vec<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            binary: None,
            args,
            working_dir: None,
            env: BTreeMap::new(),
            stderr_handler: None,
            max_line_bytes: crate::options::DEFAULT_MAX_LINE_BYTES,
            events,
            stdin: Arc::new(Mutex::new(None)),
            status: StatusCell::default(),
            shutdown: None,
            reader_task: None,
            stderr_task: None,
        }
    }

    pub fn from_options(options: &AgentOptions) -> Self {
        let mut transport = Self::new(options.cli_args.clone());
        transport.binary = options.binary.clone();
        transport.working_dir = options.working_dir.clone();
        transport.env = options.env.clone();
        transport.stderr_handler = options.stderr_handler.clone();
        transport.max_line_bytes = options.max_line_bytes();
        transport
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn resolve_binary(&self) -> PathBuf {
        if let Some(b) = self.binary.as_ref() {
            return b.clone();
        }
        if let Ok(v) = std::env::var("CLAUDE_BINARY") {
            if !v.trim().is_empty() {
                return PathBuf::from(v);
            }
        }
        PathBuf::from("claude")
    }
}

fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, AgentError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(AgentError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry should return before exhausting retries")
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn start(&mut self) -> Result<(), AgentError> {
        if let Some(dir) = self.working_dir.as_ref() {
            if !dir.is_dir() {
                return Err(AgentError::WorkingDirectory { path: dir.clone() });
            }
        }

        let binary = self.resolve_binary();
        let mut command = Command::new(&binary);
        command
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if self.stderr_handler.is_some() {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = self.working_dir.as_ref() {
            command.current_dir(dir);
        }
        for (k, v) in &self.env {
            command.env(k, v);
        }

        let mut child = spawn_with_retry(&mut command, &binary)?;

        *self.stdin.lock().await = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::Internal("child stdout pipe was not captured".to_string())
        })?;

        if let Some(handler) = self.stderr_handler.clone() {
            if let Some(stderr) = child.stderr.take() {
                self.stderr_task = Some(tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        handler(&line);
                    }
                }));
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.status.set(TransportStatus::Connected);

        self.reader_task = Some(tokio::spawn(read_loop(
            child,
            stdout,
            self.events.clone(),
            self.status.clone(),
            self.stdin.clone(),
            shutdown_rx,
            self.max_line_bytes,
        )));

        Ok(())
    }

    async fn send(&self, payload: &str) -> Result<(), AgentError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AgentError::NotConnected)?;

        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.extend_from_slice(payload.as_bytes());
        if !payload.ends_with('\n') {
            bytes.push(b'\n');
        }

        // Single buffered write under the lock keeps concurrent callers from
        // interleaving partial lines.
        stdin.write_all(&bytes).await.map_err(AgentError::SendFailed)?;
        stdin.flush().await.map_err(AgentError::SendFailed)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        // Stop writing first; dropping stdin signals EOF to the child.
        *self.stdin.lock().await = None;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.status.set(TransportStatus::Disconnected);
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        self.status.get()
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut child: Child,
    mut stdout: tokio::process::ChildStdout,
    events: broadcast::Sender<TransportEvent>,
    status: StatusCell,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    mut shutdown: watch::Receiver<bool>,
    max_line_bytes: usize,
) {
    let mut accumulator = LineAccumulator::new(max_line_bytes);
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    let mut outcomes = Vec::new();

    let exit_status = loop {
        tokio::select! {
            read = stdout.read(&mut chunk) => match read {
                Ok(0) => {
                    // EOF; reap the child, forcing it if it lingers.
                    break wait_or_kill(&mut child).await;
                }
                Ok(n) => {
                    accumulator.push(&chunk[..n], &mut outcomes);
                    for outcome in outcomes.drain(..) {
                        emit(&events, outcome);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "agent stdout read failed");
                    status.set(TransportStatus::Error);
                    break wait_or_kill(&mut child).await;
                }
            },
            _ = shutdown.changed() => {
                break wait_or_kill(&mut child).await;
            }
        }
    };

    if accumulator.has_partial() {
        debug!("discarding unterminated line at agent exit");
    }

    *stdin.lock().await = None;
    if status.get() != TransportStatus::Error {
        status.set(TransportStatus::Disconnected);
    }
    let _ = events.send(TransportEvent::Exited {
        status: exit_status,
    });
}

async fn wait_or_kill(child: &mut Child) -> Option<i32> {
    match time::timeout(CLOSE_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            warn!(error = %err, "failed waiting for agent process");
            None
        }
        Err(_) => {
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(error = %err, "failed reaping agent process after kill");
                    None
                }
            }
        }
    }
}

fn emit(events: &broadcast::Sender<TransportEvent>, outcome: LineOutcome) {
    match outcome {
        LineOutcome::Line(line) => {
            if line.trim().is_empty() {
                return;
            }
            // Send only fails when no subscriber exists yet, which is fine.
            let _ = events.send(TransportEvent::Line(line));
        }
        LineOutcome::TooLong { observed_bytes } => {
            warn!(observed_bytes, "dropping oversized agent output line");
        }
        LineOutcome::InvalidUtf8 => {
            warn!("dropping non-UTF-8 agent output line");
        }
    }
}
