//! Subprocess transport for the analysis oracle.
//!
//! Spawns the oracle, writes newline-terminated frames to its stdin and reads
//! its stdout strictly line by line, so one JSON object per line is delivered
//! whole. Everything the process does is reported as a [`TransportEvent`] on a
//! bounded channel; request/response semantics live in the bridge.
//!
//! # Tasks
//!
//! - stdout reader: one `Message` per line, `Closed` on EOF
//! - stderr reader: one `Stderr` per line
//! - exit supervisor: owns the `Child`, emits `Exit(code)` once it is reaped
//!
//! `stop()` cancels the stdout reader before terminating the process so no
//! read is left dangling on a handle that is about to close.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{LockResultExt, TransportError};

const LOG_TARGET: &str = "oracle_ls::transport";

/// Capacity of the event channel. A slow consumer back-pressures the readers
/// rather than growing memory without bound.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Grace period between SIGTERM and SIGKILL when stopping the oracle.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How to launch the oracle process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl TransportConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Something the oracle process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete line from stdout, without its terminator.
    Message(String),
    /// One line from stderr.
    Stderr(String),
    /// stdout reached EOF.
    Closed,
    /// The process was reaped.
    Exit(Option<i32>),
    /// A read failed.
    Error(String),
}

/// Handle to a running oracle process.
pub struct Transport {
    command: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    alive: Arc<AtomicBool>,
    reader_cancel: CancellationToken,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    /// `Some(code)` once the process has been reaped.
    exited: watch::Receiver<Option<Option<i32>>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Transport {
    /// Spawn the oracle and its reader tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            command: config.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::MissingPipe("stderr"))?;
        let pid = child.id();

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let reader_cancel = CancellationToken::new();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(None);

        tokio::spawn(read_stdout(stdout, events_tx.clone(), reader_cancel.clone()));
        tokio::spawn(read_stderr(stderr, events_tx.clone(), reader_cancel.clone()));
        tokio::spawn(supervise_exit(
            child,
            kill_rx,
            Arc::clone(&alive),
            events_tx,
            exited_tx,
        ));

        debug!(
            target: LOG_TARGET,
            "Spawned oracle `{}` (pid {:?})",
            config.command,
            pid
        );

        Ok((
            Self {
                command: config.command.clone(),
                pid,
                stdin: tokio::sync::Mutex::new(Some(stdin)),
                alive,
                reader_cancel,
                kill_tx: std::sync::Mutex::new(Some(kill_tx)),
                exited: exited_rx,
            },
            events_rx,
        ))
    }

    /// Write one frame followed by `\n`.
    ///
    /// Frames must not contain raw newlines; multi-line content has to be
    /// escaped inside the JSON string.
    pub async fn send(&self, frame: &str) -> Result<(), TransportError> {
        if frame.contains('\n') {
            return Err(TransportError::InvalidFrame);
        }
        if !self.is_alive() {
            return Err(match *self.exited.borrow() {
                Some(code) if !self.reader_cancel.is_cancelled() => {
                    TransportError::Exited { code }
                }
                _ => TransportError::NotRunning,
            });
        }

        let mut line = Vec::with_capacity(frame.len() + 1);
        line.extend_from_slice(frame.as_bytes());
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotRunning)?;
        stdin.write_all(&line).await.map_err(TransportError::Write)?;
        stdin.flush().await.map_err(TransportError::Write)
    }

    /// Stop the oracle: cancel the stdout reader, close stdin, then terminate
    /// the process (SIGTERM, then SIGKILL after a grace period on Unix).
    ///
    /// Returns once the process has been reaped. Idempotent.
    pub async fn stop(&self) {
        self.reader_cancel.cancel();
        self.stdin.lock().await.take();

        let kill_tx = self.kill_tx.lock().recover_poison("Transport::stop").take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }

        let mut exited = self.exited.clone();
        let _ = exited.wait_for(Option::is_some).await;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

/// Read one line (up to and including `\n`) and strip the terminator.
///
/// Invalid UTF-8 is replaced rather than treated as a fatal read error; the
/// bridge will reject the line as malformed JSON.
async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn read_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(target: LOG_TARGET, "stdout reader cancelled");
                return;
            }

            line = read_line(&mut reader, &mut buf) => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if events.send(TransportEvent::Message(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!(target: LOG_TARGET, "oracle stdout reached EOF");
                    let _ = events.send(TransportEvent::Closed).await;
                    return;
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, "stdout read error: {}", e);
                    let _ = events
                        .send(TransportEvent::Error(format!("stdout read error: {}", e)))
                        .await;
                    let _ = events.send(TransportEvent::Closed).await;
                    return;
                }
            }
        }
    }
}

async fn read_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,

            line = read_line(&mut reader, &mut buf) => match line {
                Ok(Some(line)) => {
                    if events.send(TransportEvent::Stderr(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }
}

/// Own the child until it exits or a stop is requested.
///
/// A dropped `kill_rx` sender (the `Transport` went away) counts as a stop
/// request.
async fn supervise_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
    exited: watch::Sender<Option<Option<i32>>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => terminate(&mut child).await,
    };

    alive.store(false, Ordering::SeqCst);
    let code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(target: LOG_TARGET, "failed to reap oracle: {}", e);
            None
        }
    };
    debug!(target: LOG_TARGET, "oracle exited (code {:?})", code);

    exited.send_replace(Some(code));
    let _ = events.send(TransportEvent::Exit(code)).await;
}

#[cfg(unix)]
async fn terminate(child: &mut Child) -> std::io::Result<ExitStatus> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            return status;
        }
        debug!(
            target: LOG_TARGET,
            "oracle ignored SIGTERM for {:?}, sending SIGKILL",
            TERMINATE_GRACE
        );
    }
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) -> std::io::Result<ExitStatus> {
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> TransportConfig {
        TransportConfig::new("sh").with_args(["-c", script])
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open")
    }

    #[tokio::test]
    async fn echoes_frames_line_by_line() {
        let (transport, mut events) = Transport::start(&TransportConfig::new("cat")).unwrap();

        transport.send(r#"{"id":1}"#).await.unwrap();
        transport.send(r#"{"id":2,"code":"a\nb"}"#).await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message(r#"{"id":1}"#.to_string())
        );
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message(r#"{"id":2,"code":"a\nb"}"#.to_string())
        );
        transport.stop().await;
    }

    #[tokio::test]
    async fn large_frame_arrives_whole() {
        let (transport, mut events) = Transport::start(&TransportConfig::new("cat")).unwrap();
        let payload = "x".repeat(256 * 1024);
        let frame = format!(r#"{{"id":1,"blob":"{}"}}"#, payload);

        transport.send(&frame).await.unwrap();

        match next_event(&mut events).await {
            TransportEvent::Message(line) => assert_eq!(line.len(), frame.len()),
            other => panic!("expected message, got {:?}", other),
        }
        transport.stop().await;
    }

    #[tokio::test]
    async fn rejects_raw_newlines() {
        let (transport, _events) = Transport::start(&TransportConfig::new("cat")).unwrap();
        let err = transport.send("{\"id\":1}\n{\"id\":2}").await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame));
        transport.stop().await;
    }

    #[tokio::test]
    async fn reports_spawn_failure() {
        let err =
            Transport::start(&TransportConfig::new("/nonexistent/oracle-binary")).unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
    }

    #[tokio::test]
    async fn reports_close_and_exit_code() {
        let (transport, mut events) = Transport::start(&sh("exit 3")).unwrap();

        let mut saw_closed = false;
        let mut exit_code = None;
        while !saw_closed || exit_code.is_none() {
            match next_event(&mut events).await {
                TransportEvent::Closed => saw_closed = true,
                TransportEvent::Exit(code) => exit_code = Some(code),
                _ => {}
            }
        }
        assert_eq!(exit_code, Some(Some(3)));
        assert!(!transport.is_alive());
        assert!(matches!(
            transport.send("{}").await,
            Err(TransportError::Exited { code: Some(3) })
        ));
    }

    #[tokio::test]
    async fn forwards_stderr_lines() {
        let (transport, mut events) = Transport::start(&sh("echo oops >&2; sleep 5")).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Stderr("oops".to_string())
        );
        transport.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_process_and_is_idempotent() {
        let (transport, mut events) = Transport::start(&sh("sleep 30")).unwrap();
        assert!(transport.is_alive());
        assert!(transport.pid().is_some());

        transport.stop().await;
        assert!(!transport.is_alive());
        transport.stop().await;
        assert!(matches!(
            transport.send("{}").await,
            Err(TransportError::NotRunning)
        ));

        // The reader was cancelled first, so only the exit is reported.
        loop {
            match next_event(&mut events).await {
                TransportEvent::Exit(_) => break,
                TransportEvent::Closed => panic!("reader should be cancelled before exit"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn passes_environment() {
        let config = sh("echo \"$ORACLE_TEST_VAR\"; sleep 5").with_env("ORACLE_TEST_VAR", "hello");
        let (transport, mut events) = Transport::start(&config).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message("hello".to_string())
        );
        transport.stop().await;
    }
}
