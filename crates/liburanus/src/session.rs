use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uranus_protocol::{DEFAULT_COLS, DEFAULT_ROWS, SessionId, now_millis};

use crate::error::AgentError;
use crate::escalation::{self, EscalationPolicy, EscalationStage, SignalScope};

pub const DEFAULT_QUEUE_CAPACITY: usize = 200;
const READ_CHUNK_BYTES: usize = 16 * 1024;
const CTRL_C: u8 = 0x03;
/// How long the exit monitor lets the read pump drain before announcing exit.
const READER_DRAIN_WAIT: Duration = Duration::from_millis(200);
/// How long `close` waits for the exit monitor to queue its notice.
const EXIT_NOTICE_WAIT: Duration = Duration::from_millis(500);

/// Parameters for spawning a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: PathBuf,
    pub rows: u16,
    pub cols: u16,
    pub cwd: Option<PathBuf>,
    pub queue_capacity: usize,
    pub escalation: EscalationPolicy,
}

impl SessionOptions {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            cwd: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            escalation: EscalationPolicy::default(),
        }
    }

    pub fn with_geometry(mut self, rows: Option<u16>, cols: Option<u16>) -> Self {
        self.rows = rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);
        self.cols = cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub rows: u16,
    pub cols: u16,
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub shell: String,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
    pub created_at_ms: i64,
    pub idle_ms: u64,
    pub alive: bool,
}

struct PtyState {
    master: Box<dyn MasterPty + Send>,
    geometry: Geometry,
}

/// One shell process attached to one pseudo-terminal.
///
/// Three pumps run per session: an input task writing queued bytes to the
/// PTY, a reader thread pushing PTY output into the bounded output queue,
/// and an exit monitor blocked on the child's wait. `done` fires once the
/// session is closed or its process has exited.
pub struct Session {
    id: SessionId,
    shell: PathBuf,
    pid: Option<u32>,
    scope: Option<SignalScope>,
    created_at: SystemTime,
    pty: Mutex<PtyState>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    output_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    last_activity_ms: Arc<AtomicI64>,
    exited: CancellationToken,
    done: CancellationToken,
    closing: AtomicBool,
    escalation: EscalationPolicy,
}

impl Session {
    /// Spawn `options.shell` as a process group leader on a fresh PTY.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(id: impl Into<SessionId>, options: SessionOptions) -> Result<Arc<Self>, AgentError> {
        let id = id.into();
        let geometry = Geometry {
            rows: options.rows,
            cols: options.cols,
        };

        let pair = native_pty_system()
            .openpty(pty_size(geometry))
            .map_err(|e| AgentError::ProcessSpawn(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.env("TERM", "xterm-256color");
        if let Some(cwd) = options.cwd.clone().or_else(home_dir) {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AgentError::ProcessSpawn(format!("{}: {e}", options.shell.display())))?;
        drop(pair.slave);

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(AgentError::ProcessSpawn(format!("pty handles: {e}")));
            }
        };

        let pid = child.process_id();
        let scope = pid.map(SignalScope::for_pid);
        let killer = child.clone_killer();
        let capacity = options.queue_capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let last_activity_ms = Arc::new(AtomicI64::new(now_millis()));
        let exited = CancellationToken::new();
        let done = CancellationToken::new();

        tokio::spawn(input_pump(id.clone(), input_rx, writer, done.clone()));

        let (reader_done_tx, reader_done_rx) = std::sync::mpsc::channel::<()>();
        {
            let id = id.clone();
            let output_tx = output_tx.clone();
            let activity = Arc::clone(&last_activity_ms);
            std::thread::Builder::new()
                .name(format!("pty-read-{id}"))
                .spawn(move || {
                    read_pump(&id, reader, &output_tx, &activity);
                    drop(reader_done_tx);
                })?;
        }
        {
            let id = id.clone();
            let exited = exited.clone();
            let done = done.clone();
            std::thread::Builder::new()
                .name(format!("pty-wait-{id}"))
                .spawn(move || {
                    exit_monitor(&id, child, reader_done_rx, &output_tx, &exited, &done);
                })?;
        }

        info!(session_id = %id, pid = ?pid, shell = %options.shell.display(), rows = geometry.rows, cols = geometry.cols, "session started");

        Ok(Arc::new(Self {
            id,
            shell: options.shell,
            pid,
            scope,
            created_at: SystemTime::now(),
            pty: Mutex::new(PtyState {
                master: pair.master,
                geometry,
            }),
            killer: Mutex::new(killer),
            input_tx,
            output_rx: tokio::sync::Mutex::new(output_rx),
            last_activity_ms,
            exited,
            done,
            closing: AtomicBool::new(false),
            escalation: options.escalation,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub fn geometry(&self) -> Geometry {
        lock(&self.pty).geometry
    }

    /// True until the completion signal fires.
    pub fn is_alive(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// Completion signal; cancelled when the session is finished.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Time since the last input or output.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last).max(0) as u64)
    }

    pub fn info(&self) -> SessionInfo {
        let geometry = self.geometry();
        SessionInfo {
            id: self.id.clone(),
            shell: self.shell.display().to_string(),
            pid: self.pid,
            rows: geometry.rows,
            cols: geometry.cols,
            created_at_ms: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
            idle_ms: self.idle_for().as_millis() as u64,
            alive: self.is_alive(),
        }
    }

    /// Queue bytes for the shell. A lone Ctrl+C also interrupts the
    /// foreground process group.
    pub fn send_input(&self, data: Vec<u8>) -> Result<(), AgentError> {
        if !self.is_alive() {
            return Err(AgentError::SessionClosed(self.id.clone()));
        }
        let interrupt = data.as_slice() == [CTRL_C];
        match self.input_tx.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(AgentError::QueueFull(self.id.clone())),
            Err(TrySendError::Closed(_)) => return Err(AgentError::SessionClosed(self.id.clone())),
        }
        self.touch();
        if interrupt && let Some(scope) = self.scope {
            escalation::interrupt(scope);
        }
        Ok(())
    }

    /// Interrupt the foreground job: signal the group and write Ctrl+C.
    pub fn interrupt(&self) -> Result<(), AgentError> {
        self.send_input(vec![CTRL_C])
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), AgentError> {
        if !self.is_alive() {
            return Err(AgentError::Resize(format!("pty for session {} is closed", self.id)));
        }
        let geometry = Geometry { rows, cols };
        let mut pty = lock(&self.pty);
        pty.master
            .resize(pty_size(geometry))
            .map_err(|e| AgentError::Resize(e.to_string()))?;
        pty.geometry = geometry;
        debug!(session_id = %self.id, rows, cols, "pty resized");
        Ok(())
    }

    /// Exclusive access to the output queue. Held by the active forwarder.
    pub async fn output(&self) -> tokio::sync::MutexGuard<'_, mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().await
    }

    /// Tear the session down through the escalation sequence.
    ///
    /// Returns `None` if another caller already started closing it.
    pub async fn close(&self) -> Option<EscalationStage> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return None;
        }

        let stage = match self.scope {
            Some(scope) => escalation::escalate(scope, &self.exited, self.escalation).await,
            None if self.exited.is_cancelled() => EscalationStage::Reaped,
            None => {
                if let Err(err) = lock(&self.killer).kill() {
                    warn!(session_id = %self.id, error = %err, "failed to kill session process");
                }
                EscalationStage::Killed
            }
        };

        // The exit monitor queues the exit notice and then fires `done`.
        if tokio::time::timeout(EXIT_NOTICE_WAIT, self.done.cancelled())
            .await
            .is_err()
        {
            debug!(session_id = %self.id, ?stage, "exit monitor did not finish in time");
        }
        info!(session_id = %self.id, ?stage, "session closed");
        self.done.cancel();
        Some(stage)
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("shell", &self.shell)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.exited.is_cancelled() {
            let _ = lock(&self.killer).kill();
        }
        self.done.cancel();
    }
}

async fn input_pump(
    id: SessionId,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    writer: Box<dyn Write + Send>,
    done: CancellationToken,
) {
    let writer = Arc::new(Mutex::new(writer));
    loop {
        let data = tokio::select! {
            _ = done.cancelled() => break,
            next = input_rx.recv() => match next {
                Some(data) => data,
                None => break,
            },
        };

        let writer = Arc::clone(&writer);
        let written = tokio::task::spawn_blocking(move || {
            let mut w = lock(&writer);
            w.write_all(&data)?;
            w.flush()
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(session_id = %id, error = %err, "pty write failed");
                break;
            }
            Err(err) => {
                warn!(session_id = %id, error = %err, "pty write task failed");
                break;
            }
        }
    }
    debug!(session_id = %id, "input pump stopped");
}

fn read_pump(
    id: &str,
    mut reader: Box<dyn Read + Send>,
    output_tx: &mpsc::Sender<Vec<u8>>,
    activity: &AtomicI64,
) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                activity.store(now_millis(), Ordering::Relaxed);
                match output_tx.try_send(buf[..n].to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(session_id = %id, bytes = n, "output queue full, dropping chunk");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(session_id = %id, error = %err, "pty read ended");
                break;
            }
        }
    }
}

fn exit_monitor(
    id: &str,
    mut child: Box<dyn Child + Send + Sync>,
    reader_done: std::sync::mpsc::Receiver<()>,
    output_tx: &mpsc::Sender<Vec<u8>>,
    exited: &CancellationToken,
    done: &CancellationToken,
) {
    let code = match child.wait() {
        Ok(status) => i64::from(status.exit_code()),
        Err(err) => {
            warn!(session_id = %id, error = %err, "waiting for session process failed");
            -1
        }
    };
    exited.cancel();

    let _ = reader_done.recv_timeout(READER_DRAIN_WAIT);
    let notice = format!("\r\n[process exited, code {code}]\r\n");
    if output_tx.try_send(notice.into_bytes()).is_err() {
        debug!(session_id = %id, "could not queue exit notice");
    }

    info!(session_id = %id, code, "session process exited");
    done.cancel();
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
