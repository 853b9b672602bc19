//! Worker client — owns one child process and speaks the line protocol with it.
//!
//! Requests are correlated by id. Each `dispatch` registers a one-shot slot
//! before the frame is written, and the reader task resolves whichever slot
//! matches the id of an incoming `result`/`error` frame. Arrival order does
//! not matter.
//!
//! Any connection-level failure (bad frame, unknown type, stream closed,
//! process exit) moves the client to `Crashed` and fails every pending
//! request with the same `ProtocolError`. No request is left unresolved.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use loom_core::config::SupervisorConfig;
use loom_core::wire::{HandshakeInfo, Message, Request};
use loom_core::{LineCodec, ProtocolError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = Result<Value, RequestError>;

// ── Public types ─────────────────────────────────────────────────────────────

/// Lifecycle of one worker connection. `Crashed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Starting,
    Ready,
    /// `Ready` with at least one request outstanding. Derived, never stored.
    Busy,
    ShuttingDown,
    Terminated,
    Crashed,
}

impl WorkerState {
    pub fn accepts_requests(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }
}

/// What to execute for a process-backed worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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
}

/// One line a worker wrote to stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLog {
    pub worker: String,
    pub line: String,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Used in logs and as the default request-id prefix.
    pub name: String,
    pub handshake_timeout: Duration,
    /// Default deadline for `dispatch`. `None` = wait forever.
    pub request_timeout: Option<Duration>,
    pub kill_grace: Duration,
    pub exit_grace: Duration,
    pub max_frame_bytes: usize,
    /// Receives every stderr line in addition to the tracing output.
    pub log_tx: Option<mpsc::UnboundedSender<WorkerLog>>,
}

impl WorkerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &SupervisorConfig::default())
    }

    pub fn from_config(name: impl Into<String>, config: &SupervisorConfig) -> Self {
        Self {
            name: name.into(),
            handshake_timeout: config.handshake_timeout(),
            request_timeout: config.request_timeout(),
            kill_grace: config.kill_grace(),
            exit_grace: config.exit_grace(),
            max_frame_bytes: config.max_frame_bytes,
            log_tx: None,
        }
    }

    pub fn with_log_channel(mut self, tx: mpsc::UnboundedSender<WorkerLog>) -> Self {
        self.log_tx = Some(tx);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("worker cannot be started from state {0:?}")]
    AlreadyStarted(WorkerState),

    #[error("worker has no launch command")]
    NoCommand,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited before handshake completed: {0}")]
    ExitedEarly(ProtocolError),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure of a single request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// The connection failed; every pending request saw the same error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The worker answered this request with an `error` frame.
    #[error("worker error: {0}")]
    Worker(String),

    /// Deadline passed. The worker process is left running.
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("request id {0:?} already used on this connection")]
    DuplicateId(String),

    #[error("worker not accepting requests ({0:?})")]
    NotReady(WorkerState),
}

impl RequestError {
    /// True when the connection itself is gone, not just this request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RequestError::Protocol(_) | RequestError::NotReady(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
}

// ── Shared connection state ──────────────────────────────────────────────────

struct Shared {
    name: String,
    pending: DashMap<String, oneshot::Sender<Reply>>,
    /// Every id ever dispatched on this connection.
    issued: DashSet<String>,
    state: watch::Sender<WorkerState>,
    handshake: Mutex<Option<oneshot::Sender<HandshakeInfo>>>,
    /// First connection-level error, kept for late callers.
    fatal: Mutex<Option<ProtocolError>>,
    seq: AtomicU64,
}

impl Shared {
    fn new(name: String) -> Self {
        let (state, _) = watch::channel(WorkerState::NotStarted);
        Self {
            name,
            pending: DashMap::new(),
            issued: DashSet::new(),
            state,
            handshake: Mutex::new(None),
            fatal: Mutex::new(None),
            seq: AtomicU64::new(0),
        }
    }

    fn stored_state(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|s| {
            // Crashed and Terminated are final.
            if matches!(*s, WorkerState::Crashed | WorkerState::Terminated) || *s == next {
                return false;
            }
            *s = next;
            true
        });
    }

    fn fatal(&self) -> Option<ProtocolError> {
        self.fatal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_handshake_slot(&self) -> Option<oneshot::Sender<HandshakeInfo>> {
        self.handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Fail every pending request. The first error is remembered.
    fn fail_all(&self, err: ProtocolError) {
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if fatal.is_none() {
                *fatal = Some(err.clone());
            }
        }
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            tracing::warn!(
                worker = %self.name,
                pending = ids.len(),
                error = %err,
                "failing pending requests"
            );
        }
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RequestError::Protocol(err.clone())));
            }
        }
    }

    fn resolve(&self, id: &str, reply: Reply) {
        match self.pending.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => {
                tracing::warn!(worker = %self.name, id, "dropping response for unknown request id");
            }
        }
    }

    /// Deliver one inbound frame. An `Err` is fatal to the connection.
    fn route(&self, msg: Message) -> Result<(), ProtocolError> {
        match msg {
            Message::Handshake { name, version } => match self.take_handshake_slot() {
                Some(tx) => {
                    let _ = tx.send(HandshakeInfo {
                        name: name.unwrap_or_default(),
                        version: version.unwrap_or_default(),
                    });
                }
                None => tracing::warn!(worker = %self.name, "ignoring unsolicited handshake"),
            },
            Message::Result { id: Some(id), value } => self.resolve(&id, Ok(value)),
            Message::Error {
                id: Some(id),
                message,
            } => self.resolve(&id, Err(RequestError::Worker(message))),
            Message::Result { id: None, .. } => {
                tracing::warn!(worker = %self.name, "dropping result without id");
            }
            Message::Error { id: None, message } => {
                return Err(ProtocolError::WorkerAborted(message));
            }
            other => return Err(ProtocolError::UnexpectedFrame(other.kind().to_string())),
        }
        Ok(())
    }
}

// ── PendingReply ─────────────────────────────────────────────────────────────

/// Handle to one outstanding request. Await it (or call `wait`) for the reply.
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Reply>,
    timeout: Option<Duration>,
    shared: Arc<Shared>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<Value, RequestError> {
        let PendingReply {
            id,
            rx,
            timeout,
            shared,
        } = self;

        let received = match timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(r) => r,
                Err(_) => {
                    // A late answer for this id is now unmatched and gets dropped.
                    shared.pending.remove(&id);
                    tracing::warn!(worker = %shared.name, id = %id, ?after, "request timed out");
                    return Err(RequestError::Timeout { id, after });
                }
            },
            None => rx.await,
        };

        received.unwrap_or_else(|_| {
            Err(RequestError::Protocol(
                shared.fatal().unwrap_or(ProtocolError::StreamClosed),
            ))
        })
    }
}

impl IntoFuture for PendingReply {
    type Output = Result<Value, RequestError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

// ── WorkerClient ─────────────────────────────────────────────────────────────

pub struct WorkerClient {
    shared: Arc<Shared>,
    options: WorkerOptions,
    command: Option<LaunchCommand>,
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxedWriter, LineCodec>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    kill_signal: Arc<Notify>,
    pid: Option<u32>,
    info: Option<HandshakeInfo>,
}

impl WorkerClient {
    /// A process-backed client in `NotStarted`. Call [`WorkerClient::start`].
    pub fn new(command: LaunchCommand, options: WorkerOptions) -> Self {
        Self::build(Some(command), options)
    }

    fn build(command: Option<LaunchCommand>, options: WorkerOptions) -> Self {
        Self {
            shared: Arc::new(Shared::new(options.name.clone())),
            options,
            command,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            exit_rx: None,
            kill_signal: Arc::new(Notify::new()),
            pid: None,
            info: None,
        }
    }

    /// Handshake over an already-open byte stream instead of a child process.
    pub async fn attach<R, W>(
        options: WorkerOptions,
        reader: R,
        writer: W,
    ) -> Result<Self, StartupError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut client = Self::build(None, options);
        client.shared.set_state(WorkerState::Starting);
        client.connect(Box::new(reader), Box::new(writer)).await?;
        Ok(client)
    }

    /// Spawn the child process and complete the handshake.
    pub async fn start(&mut self) -> Result<HandshakeInfo, StartupError> {
        let state = self.shared.stored_state();
        if state != WorkerState::NotStarted {
            return Err(StartupError::AlreadyStarted(state));
        }
        let command = self.command.clone().ok_or(StartupError::NoCommand)?;
        self.shared.set_state(WorkerState::Starting);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(source) => {
                self.shared.set_state(WorkerState::Crashed);
                return Err(StartupError::Spawn {
                    program: command.program,
                    source,
                });
            }
        };
        self.pid = child.id();
        tracing::info!(
            worker = %self.shared.name,
            pid = ?self.pid,
            program = %command.program,
            "worker process spawned"
        );

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.shared.set_state(WorkerState::Crashed);
            let _ = child.start_kill();
            return Err(ProtocolError::Io("child stdio not captured".into()).into());
        };
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(
                self.shared.name.clone(),
                self.pid,
                stderr,
                self.options.log_tx.clone(),
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(
            child,
            self.kill_signal.clone(),
            self.options.kill_grace,
            exit_tx,
        ));
        self.exit_rx = Some(exit_rx);

        self.connect(Box::new(stdout), Box::new(stdin)).await
    }

    async fn connect(
        &mut self,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<HandshakeInfo, StartupError> {
        let codec = LineCodec::with_max_line_bytes(self.options.max_frame_bytes);
        let frames = FramedRead::new(reader, codec.clone());
        *self.writer.get_mut() = Some(FramedWrite::new(writer, codec));

        let (hs_tx, hs_rx) = oneshot::channel();
        *self
            .shared
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(hs_tx);

        let task = tokio::spawn(read_loop(
            self.shared.clone(),
            frames,
            self.exit_rx.clone(),
            self.kill_signal.clone(),
            self.options.exit_grace,
        ));
        *self.reader.get_mut().unwrap_or_else(|e| e.into_inner()) = Some(task);

        if let Err(e) = self.write(Message::handshake_request()).await {
            self.kill().await;
            return Err(StartupError::ExitedEarly(e));
        }

        let timeout = self.options.handshake_timeout;
        match tokio::time::timeout(timeout, hs_rx).await {
            Ok(Ok(info)) => {
                self.shared.set_state(WorkerState::Ready);
                if self.shared.stored_state() != WorkerState::Ready {
                    let cause = self.shared.fatal().unwrap_or(ProtocolError::StreamClosed);
                    self.kill().await;
                    return Err(StartupError::ExitedEarly(cause));
                }
                tracing::info!(
                    worker = %self.shared.name,
                    remote = %info.name,
                    version = %info.version,
                    "worker handshake complete"
                );
                self.info = Some(info.clone());
                Ok(info)
            }
            Ok(Err(_)) => {
                let cause = self.shared.fatal().unwrap_or(ProtocolError::StreamClosed);
                self.kill().await;
                Err(StartupError::ExitedEarly(cause))
            }
            Err(_) => {
                tracing::warn!(worker = %self.shared.name, ?timeout, "handshake timed out");
                self.kill().await;
                Err(StartupError::HandshakeTimeout(timeout))
            }
        }
    }

    async fn write(&self, frame: Message) -> Result<(), ProtocolError> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(w) => w.send(frame).await,
            None => Err(ProtocolError::Terminated),
        }
    }

    /// Send a request and return a handle to its reply, using the default deadline.
    pub async fn dispatch(
        &self,
        id: impl Into<String>,
        request: Request,
    ) -> Result<PendingReply, RequestError> {
        self.dispatch_with_timeout(id, request, self.options.request_timeout)
            .await
    }

    pub async fn dispatch_with_timeout(
        &self,
        id: impl Into<String>,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<PendingReply, RequestError> {
        let id = id.into();
        let state = self.state();
        if !state.accepts_requests() {
            return Err(RequestError::NotReady(state));
        }
        if !self.shared.issued.insert(id.clone()) {
            return Err(RequestError::DuplicateId(id));
        }

        // Register before writing so a fast reply always finds its slot.
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id.clone(), tx);
        if !self.shared.stored_state().accepts_requests() {
            self.shared.pending.remove(&id);
            return Err(match self.shared.fatal() {
                Some(e) => RequestError::Protocol(e),
                None => RequestError::NotReady(self.state()),
            });
        }

        let kind = request.kind();
        if let Err(e) = self.write(request.into_message(id.clone())).await {
            self.shared.pending.remove(&id);
            return Err(RequestError::Protocol(e));
        }
        tracing::trace!(worker = %self.shared.name, id = %id, kind, "request sent");

        Ok(PendingReply {
            id,
            rx,
            timeout,
            shared: self.shared.clone(),
        })
    }

    /// `dispatch` and wait for the reply.
    pub async fn send(
        &self,
        id: impl Into<String>,
        request: Request,
    ) -> Result<Value, RequestError> {
        self.dispatch(id, request).await?.await
    }

    /// Fresh id of the form `<prefix>-<n>`, unique for this client.
    pub fn next_request_id(&self, prefix: &str) -> String {
        let n = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }

    /// Stop the worker. Pending requests fail with `ProtocolError::Terminated`.
    ///
    /// Closes stdin, sends SIGTERM, escalates to SIGKILL after the kill grace,
    /// then waits for the exit. Calling it again is a no-op.
    pub async fn kill(&self) {
        match self.shared.stored_state() {
            WorkerState::Terminated => return,
            WorkerState::NotStarted => {
                self.shared.set_state(WorkerState::Terminated);
                return;
            }
            _ => {}
        }
        self.shared.set_state(WorkerState::ShuttingDown);

        // Dropping the sink closes the child's stdin.
        self.writer.lock().await.take();
        self.shared.fail_all(ProtocolError::Terminated);
        self.kill_signal.notify_one();

        if let Some(rx) = &self.exit_rx {
            let mut rx = rx.clone();
            let _ = rx.wait_for(Option::is_some).await;
        }
        let task = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        // Handshake waiters must not outlive the connection.
        self.shared.take_handshake_slot();

        self.shared.set_state(WorkerState::Terminated);
        tracing::info!(worker = %self.shared.name, pid = ?self.pid, "worker terminated");
    }

    pub fn state(&self) -> WorkerState {
        let state = self.shared.stored_state();
        if state == WorkerState::Ready && !self.shared.pending.is_empty() {
            WorkerState::Busy
        } else {
            state
        }
    }

    /// Watch stored state changes (never reports `Busy`).
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    /// The error that brought the connection down, if any.
    pub fn failure(&self) -> Option<ProtocolError> {
        self.shared.fatal()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.info.as_ref()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the reader must not outlive us.
        if let Some(task) = self
            .reader
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

async fn read_loop(
    shared: Arc<Shared>,
    mut frames: FramedRead<BoxedReader, LineCodec>,
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    kill_signal: Arc<Notify>,
    exit_grace: Duration,
) {
    let cause = loop {
        match frames.next().await {
            Some(Ok(msg)) => {
                if let Err(e) = shared.route(msg) {
                    break Some(e);
                }
            }
            Some(Err(e)) => break Some(e),
            None => break None,
        }
    };

    let shutting_down = matches!(
        shared.stored_state(),
        WorkerState::ShuttingDown | WorkerState::Terminated
    );
    let err = match cause {
        Some(e) => {
            tracing::error!(worker = %shared.name, error = %e, "protocol violation, dropping worker");
            e
        }
        None if shutting_down => ProtocolError::Terminated,
        None => match observed_exit(exit_rx, exit_grace).await {
            Some(exit) => ProtocolError::from_exit_code(exit.code),
            None => ProtocolError::StreamClosed,
        },
    };

    if !shutting_down {
        shared.set_state(WorkerState::Crashed);
        // A worker that broke protocol may still be running.
        kill_signal.notify_one();
        tracing::warn!(worker = %shared.name, error = %err, "worker connection lost");
    }
    shared.fail_all(err);
    shared.take_handshake_slot();
}

async fn observed_exit(
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    grace: Duration,
) -> Option<ExitInfo> {
    let mut rx = exit_rx?;
    let exit = match tokio::time::timeout(grace, rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => *exit,
        _ => None,
    };
    exit
}

async fn watch_exit(
    mut child: Child,
    kill_signal: Arc<Notify>,
    grace: Duration,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_signal.notified() => terminate_child(&mut child, grace).await,
    };
    let code = match status {
        Ok(s) => s.code(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap worker process");
            None
        }
    };
    tracing::debug!(?code, "worker process exited");
    exit_tx.send_replace(Some(ExitInfo { code }));
}

async fn terminate_child(
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.start_kill();
    child.wait().await
}

fn forward_stderr(
    name: String,
    pid: Option<u32>,
    stderr: ChildStderr,
    log_tx: Option<mpsc::UnboundedSender<WorkerLog>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "loom::worker", worker = %name, pid = ?pid, "{line}");
                    if let Some(tx) = &log_tx {
                        let _ = tx.send(WorkerLog {
                            worker: name.clone(),
                            line,
                        });
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = %name, error = %e, "stopped reading worker stderr");
                    break;
                }
            }
        }
    });
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use loom_core::codec::{decode_line, encode};
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    /// Worker end of an in-memory connection.
    pub(crate) struct FakeWorker {
        pub lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        pub out: WriteHalf<DuplexStream>,
    }

    impl FakeWorker {
        pub async fn recv(&mut self) -> Option<Message> {
            let line = self.lines.next_line().await.ok()??;
            Some(decode_line(line.as_bytes()).expect("client sent a bad frame"))
        }

        /// Write errors mean the client hung up; callers notice on the next `recv`.
        pub async fn send(&mut self, msg: Message) {
            let bytes = encode(&msg).unwrap();
            let _ = self.out.write_all(&bytes).await;
        }

        pub async fn send_raw(&mut self, bytes: &[u8]) {
            let _ = self.out.write_all(bytes).await;
        }

        /// Answer the handshake the client sends first.
        pub async fn handshake(&mut self) {
            let first = self.recv().await.expect("no handshake");
            assert_eq!(first, Message::handshake_request());
            self.send(Message::Handshake {
                name: Some("fake".into()),
                version: Some("0.0.1".into()),
            })
            .await;
        }
    }

    pub(crate) fn connection() -> (
        ReadHalf<DuplexStream>,
        WriteHalf<DuplexStream>,
        FakeWorker,
    ) {
        let (client_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client_side);
        let (wr, ww) = tokio::io::split(worker_side);
        (
            cr,
            cw,
            FakeWorker {
                lines: BufReader::new(wr).lines(),
                out: ww,
            },
        )
    }

    pub(crate) fn options() -> WorkerOptions {
        let mut o = WorkerOptions::new("test");
        o.handshake_timeout = Duration::from_secs(2);
        o.exit_grace = Duration::from_millis(50);
        o
    }

    async fn ready_client() -> (WorkerClient, FakeWorker) {
        let (cr, cw, mut worker) = connection();
        let (client, ()) = tokio::join!(
            async { WorkerClient::attach(options(), cr, cw).await.unwrap() },
            worker.handshake()
        );
        (client, worker)
    }

    fn transform(v: Value) -> Request {
        Request::Transform { object: v }
    }

    #[tokio::test]
    async fn handshake_reports_identity_and_ready() {
        let (client, _worker) = ready_client().await;
        assert_eq!(client.state(), WorkerState::Ready);
        let info = client.handshake().unwrap();
        assert_eq!(info.name, "fake");
        assert_eq!(info.version, "0.0.1");
    }

    #[tokio::test]
    async fn out_of_order_replies_resolve_by_id() {
        let (client, mut worker) = ready_client().await;

        let mut pending = Vec::new();
        for i in 0..5 {
            pending.push(
                client
                    .dispatch(format!("req-{i}"), transform(json!(i)))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(client.state(), WorkerState::Busy);

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(worker.recv().await.unwrap());
        }
        for idx in [3, 0, 4, 1, 2] {
            let Message::Transform { id, object } = &received[idx] else {
                panic!("expected transform");
            };
            worker
                .send(Message::Result {
                    id: Some(id.clone()),
                    value: json!({"echo": object, "id": id}),
                })
                .await;
        }

        let results = futures::future::join_all(pending.into_iter().map(PendingReply::wait)).await;
        for (i, r) in results.into_iter().enumerate() {
            let v = r.unwrap();
            assert_eq!(v["id"], json!(format!("req-{i}")));
            assert_eq!(v["echo"], json!(i));
        }
        assert_eq!(client.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn unknown_reply_id_is_dropped() {
        let (client, mut worker) = ready_client().await;
        let reply = client.dispatch("real", transform(json!(1))).await.unwrap();
        worker.recv().await.unwrap();

        worker
            .send(Message::Result {
                id: Some("ghost".into()),
                value: json!("nobody"),
            })
            .await;
        worker
            .send(Message::Result {
                id: None,
                value: json!("anonymous"),
            })
            .await;
        worker
            .send(Message::Result {
                id: Some("real".into()),
                value: json!("mine"),
            })
            .await;

        assert_eq!(reply.await.unwrap(), json!("mine"));
        assert_eq!(client.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn error_frame_fails_only_its_request() {
        let (client, mut worker) = ready_client().await;
        let bad = client.dispatch("bad", transform(json!(0))).await.unwrap();
        let good = client.dispatch("good", transform(json!(1))).await.unwrap();
        worker.recv().await.unwrap();
        worker.recv().await.unwrap();

        worker
            .send(Message::Error {
                id: Some("bad".into()),
                message: "division by zero".into(),
            })
            .await;
        worker
            .send(Message::Result {
                id: Some("good".into()),
                value: json!(1),
            })
            .await;

        match bad.await {
            Err(RequestError::Worker(msg)) => assert_eq!(msg, "division by zero"),
            other => panic!("expected worker error, got {other:?}"),
        }
        assert_eq!(good.await.unwrap(), json!(1));
        assert!(client.state().accepts_requests());
    }

    #[tokio::test]
    async fn closed_stream_fails_every_pending_request() {
        let (client, mut worker) = ready_client().await;
        let mut pending = Vec::new();
        for i in 0..3 {
            pending.push(
                client
                    .dispatch(format!("p{i}"), transform(json!(i)))
                    .await
                    .unwrap(),
            );
        }
        for _ in 0..3 {
            worker.recv().await.unwrap();
        }
        drop(worker);

        for r in futures::future::join_all(pending.into_iter().map(PendingReply::wait)).await {
            assert!(matches!(
                r,
                Err(RequestError::Protocol(ProtocolError::StreamClosed))
            ));
        }
        assert_eq!(client.state(), WorkerState::Crashed);
        assert!(matches!(
            client.dispatch("late", transform(json!(0))).await,
            Err(RequestError::NotReady(WorkerState::Crashed))
        ));
    }

    #[tokio::test]
    async fn malformed_line_is_fatal() {
        let (client, mut worker) = ready_client().await;
        let reply = client.dispatch("a", transform(json!(0))).await.unwrap();
        worker.recv().await.unwrap();
        worker.send_raw(b"this is not json\n").await;

        assert!(matches!(
            reply.await,
            Err(RequestError::Protocol(ProtocolError::MalformedFrame(_)))
        ));
        assert_eq!(client.state(), WorkerState::Crashed);
        assert!(matches!(
            client.failure(),
            Some(ProtocolError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn unknown_type_from_worker_is_fatal() {
        let (client, mut worker) = ready_client().await;
        let reply = client.dispatch("a", transform(json!(0))).await.unwrap();
        worker.recv().await.unwrap();
        worker.send_raw(b"{\"type\":\"progress\",\"id\":\"a\"}\n").await;

        assert!(matches!(
            reply.await,
            Err(RequestError::Protocol(ProtocolError::UnknownType(t))) if t == "progress"
        ));
    }

    #[tokio::test]
    async fn timeout_is_request_local() {
        let (client, mut worker) = ready_client().await;
        let slow = client
            .dispatch_with_timeout("slow", transform(json!(0)), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        worker.recv().await.unwrap();

        assert!(matches!(
            slow.await,
            Err(RequestError::Timeout { ref id, .. }) if id == "slow"
        ));
        assert_eq!(client.pending_count(), 0);

        // The late answer is dropped; the connection keeps working.
        worker
            .send(Message::Result {
                id: Some("slow".into()),
                value: json!("late"),
            })
            .await;
        let next = client.dispatch("next", transform(json!(1))).await.unwrap();
        worker.recv().await.unwrap();
        worker
            .send(Message::Result {
                id: Some("next".into()),
                value: json!("ok"),
            })
            .await;
        assert_eq!(next.await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn reused_ids_are_rejected() {
        let (client, mut worker) = ready_client().await;
        let first = client.dispatch("same", transform(json!(0))).await.unwrap();
        assert!(matches!(
            client.dispatch("same", transform(json!(1))).await,
            Err(RequestError::DuplicateId(id)) if id == "same"
        ));
        worker.recv().await.unwrap();
        worker
            .send(Message::Result {
                id: Some("same".into()),
                value: json!(0),
            })
            .await;
        first.await.unwrap();
        assert!(matches!(
            client.dispatch("same", transform(json!(2))).await,
            Err(RequestError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn silent_worker_times_out_handshake() {
        let (cr, cw, _worker) = connection();
        let mut opts = options();
        opts.handshake_timeout = Duration::from_millis(50);
        match WorkerClient::attach(opts, cr, cw).await {
            Err(StartupError::HandshakeTimeout(d)) => assert_eq!(d, Duration::from_millis(50)),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("handshake should not succeed"),
        }
    }

    #[tokio::test]
    async fn kill_fails_pending_and_is_idempotent() {
        let (client, mut worker) = ready_client().await;
        let reply = client.dispatch("a", transform(json!(0))).await.unwrap();
        worker.recv().await.unwrap();

        client.kill().await;
        assert_eq!(client.state(), WorkerState::Terminated);
        assert!(matches!(
            reply.await,
            Err(RequestError::Protocol(ProtocolError::Terminated))
        ));
        // Worker side sees stdin close.
        assert!(worker.recv().await.is_none());

        client.kill().await;
        assert_eq!(client.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn kill_before_start_is_noop_termination() {
        let client = WorkerClient::new(LaunchCommand::new("true"), options());
        assert_eq!(client.state(), WorkerState::NotStarted);
        client.kill().await;
        assert_eq!(client.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn request_ids_from_helper_are_unique() {
        let client = WorkerClient::new(LaunchCommand::new("true"), options());
        let a = client.next_request_id("train");
        let b = client.next_request_id("train");
        assert_ne!(a, b);
        assert!(a.starts_with("train-"));
    }
}
