use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_bridge_error::BridgeError;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::launch::LaunchSpec;
use crate::rpc::method_of;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const EVENT_CHANNEL_SIZE: usize = 64;
const STDOUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn subprocess `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture subprocess stdin")]
    MissingStdin,
    #[error("failed to capture subprocess stdout")]
    MissingStdout,
    #[error("failed to capture subprocess stderr")]
    MissingStderr,
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(serde_json::Error),
    #[error("worker stdin is not writable: {0}")]
    Closed(&'static str),
    #[error("failed to write worker stdin: {0}")]
    Write(std::io::Error),
}

impl From<TransportError> for BridgeError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Spawn { command, error } => BridgeError::Spawn { command, error },
            other => BridgeError::TransportClosed {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: Option<ExitStatus>) -> Self {
        let Some(status) = status else {
            return Self {
                code: None,
                signal: None,
            };
        };
        Self {
            code: status.code(),
            signal: exit_signal(&status),
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Raw stdout bytes in arrival order; framing happens downstream.
    Output(Vec<u8>),
    /// Always the last event, sent after stdout has drained.
    Exited(ExitInfo),
}

/// One spawned worker with piped stdio.
#[derive(Debug)]
pub struct WorkerProcess {
    session_id: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    alive: Arc<AtomicBool>,
    kill: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    spawned_at: Instant,
}

impl WorkerProcess {
    pub fn spawn(
        session_id: &str,
        launch: &LaunchSpec,
        env: HashMap<String, String>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let spawned_at = Instant::now();

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            session_id = session_id,
            program = ?launch.program,
            args = ?launch.args,
            "spawning worker process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                session_id = session_id,
                program = ?launch.program,
                error = %err,
                "failed to spawn worker process"
            );
            TransportError::Spawn {
                command: launch.display(),
                error: err,
            }
        })?;

        let pid = child.id();
        tracing::info!(
            session_id = session_id,
            pid = pid.unwrap_or(0),
            elapsed_ms = spawned_at.elapsed().as_millis() as u64,
            "worker process spawned"
        );

        let stdin = child.stdin.take().ok_or(TransportError::MissingStdin)?;
        let stdout = child.stdout.take().ok_or(TransportError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(TransportError::MissingStderr)?;

        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (kill_tx, kill_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));

        let stdout_task = spawn_stdout_loop(session_id.to_string(), stdout, events.clone());
        spawn_stderr_loop(session_id.to_string(), stderr, spawned_at);
        spawn_exit_watcher(
            session_id.to_string(),
            child,
            kill_rx,
            stdout_task,
            events,
            alive.clone(),
            spawned_at,
        );

        Ok((
            Self {
                session_id: session_id.to_string(),
                pid,
                stdin: Mutex::new(Some(stdin)),
                alive,
                kill: std::sync::Mutex::new(Some(kill_tx)),
                spawned_at,
            },
            receiver,
        ))
    }

    /// Writes one JSON message followed by a newline.
    pub async fn send(&self, payload: &Value) -> Result<(), TransportError> {
        let mut bytes = serde_json::to_vec(payload).map_err(TransportError::Serialize)?;
        bytes.push(b'\n');

        tracing::debug!(
            session_id = %self.session_id,
            method = method_of(payload),
            id = %payload.get("id").map(|v| v.to_string()).unwrap_or_default(),
            bytes = bytes.len(),
            "stdin: writing message to worker"
        );
        self.write(&bytes).await
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed("worker process has exited"));
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or(TransportError::Closed("stdin already closed"))?;

        let written = match stdin.write_all(bytes).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };

        if let Err(err) = written {
            tracing::error!(
                session_id = %self.session_id,
                error = %err,
                "stdin: write failed, closing pipe"
            );
            *guard = None;
            return Err(TransportError::Write(err));
        }
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn age(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Asks the exit watcher to kill the process. Returns `false` if it was already asked.
    pub fn terminate(&self) -> bool {
        let sender = self
            .kill
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(sender) => {
                tracing::info!(
                    session_id = %self.session_id,
                    pid = self.pid.unwrap_or(0),
                    age_ms = self.age().as_millis() as u64,
                    "terminating worker process"
                );
                let _ = sender.send(());
                true
            }
            None => false,
        }
    }
}

fn spawn_stdout_loop(
    session_id: String,
    mut stdout: ChildStdout,
    events: mpsc::Sender<TransportEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        let mut total_bytes: u64 = 0;

        loop {
            match stdout.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => {
                    total_bytes += read as u64;
                    if events
                        .send(TransportEvent::Output(buffer[..read].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "worker stdout: read failed");
                    break;
                }
            }
        }

        tracing::debug!(
            session_id = %session_id,
            total_bytes = total_bytes,
            "worker stdout: stream ended"
        );
    })
}

fn spawn_stderr_loop(session_id: String, stderr: ChildStderr, spawned_at: Instant) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut line_count: u64 = 0;

        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            tracing::info!(
                session_id = %session_id,
                line_number = line_count,
                age_ms = spawned_at.elapsed().as_millis() as u64,
                "worker stderr: {}",
                line
            );
        }

        tracing::debug!(
            session_id = %session_id,
            total_lines = line_count,
            "worker stderr: stream ended"
        );
    });
}

fn spawn_exit_watcher(
    session_id: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    stdout_task: tokio::task::JoinHandle<()>,
    events: mpsc::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
    spawned_at: Instant,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            // A dropped sender means the owning session is gone; kill in that case too.
            _ = kill => {
                if let Err(err) = child.start_kill() {
                    tracing::warn!(session_id = %session_id, error = %err, "failed to kill worker process");
                }
                child.wait().await.ok()
            }
        };
        alive.store(false, Ordering::SeqCst);

        let exit = ExitInfo::from_status(status);
        tracing::warn!(
            session_id = %session_id,
            code = exit.code,
            signal = exit.signal,
            age_ms = spawned_at.elapsed().as_millis() as u64,
            "worker process exited"
        );

        // Output written just before exit is delivered ahead of the exit event. A grandchild
        // holding the pipe open must not stall exit handling, hence the bound.
        if tokio::time::timeout(STDOUT_DRAIN_GRACE, stdout_task).await.is_err() {
            tracing::debug!(session_id = %session_id, "worker stdout still open after exit");
        }
        let _ = events.send(TransportEvent::Exited(exit)).await;
    });
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
