use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mcp_bridge_error::{BridgeError, JSONRPC_VERSION};
use serde::Serialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{BridgeConfig, TOOLS_CHANGED_DELAY};
use crate::correlator::{Completion, Correlator};
use crate::framing::{Frame, LineFramer};
use crate::launch::LaunchSpec;
use crate::process::{ExitInfo, TransportEvent, WorkerProcess};
use crate::rpc::{is_response, method_of, NOTIFICATION_TOOLS_CHANGED};
use crate::sink::{EventSink, SinkEvent};
use crate::timers::{TimerKey, TimerSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    Initializing,
    Initialized,
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    wall: OffsetDateTime,
}

/// One client identity bound to one worker process.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    created_at_wall: OffsetDateTime,
    last_activity: Mutex<Activity>,
    state: Mutex<SessionState>,
    worker: WorkerProcess,
    correlator: Correlator,
    sink: Arc<EventSink>,
    timers: Arc<TimerSet<TimerKey>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequestInfo {
    pub id: Value,
    pub method: String,
    pub age: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub state: SessionState,
    pub initialized: bool,
    pub initializing: bool,
    pub process_alive: bool,
    pub pid: Option<u32>,
    pub pending_requests: Vec<PendingRequestInfo>,
    pub last_activity: String,
    pub created_at: String,
    pub age: u64,
    pub idle_time: u64,
    pub has_sse_connection: bool,
}

impl Session {
    pub(crate) fn start(
        id: &str,
        launch: &LaunchSpec,
        config: &BridgeConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), BridgeError> {
        let (worker, events) =
            WorkerProcess::spawn(id, launch, launch.worker_env(config.request_timeout))?;
        let timers = Arc::new(TimerSet::new());
        let now = Activity {
            at: Instant::now(),
            wall: OffsetDateTime::now_utc(),
        };

        let session = Arc::new(Self {
            id: id.to_string(),
            created_at: now.at,
            created_at_wall: now.wall,
            last_activity: Mutex::new(now),
            state: Mutex::new(SessionState::New),
            worker,
            correlator: Correlator::new(id, timers.clone()),
            sink: Arc::new(EventSink::new()),
            timers,
        });
        Ok((session, events))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == SessionState::Destroyed
    }

    pub fn is_process_alive(&self) -> bool {
        self.worker.is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker.pid()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).at.elapsed()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.len()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub(crate) fn timers(&self) -> &Arc<TimerSet<TimerKey>> {
        &self.timers
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Activity {
            at: Instant::now(),
            wall: OffsetDateTime::now_utc(),
        };
    }

    /// Moves to `initializing`; an already initialized session is re-initialized.
    pub fn begin_initialize(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Destroyed => false,
            SessionState::Initialized => {
                tracing::info!(session_id = %self.id, "session already initialized, reinitializing");
                *state = SessionState::Initializing;
                true
            }
            SessionState::New | SessionState::Initializing => {
                *state = SessionState::Initializing;
                true
            }
        }
    }

    pub fn mark_initialized(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == SessionState::Destroyed {
            return false;
        }
        if *state != SessionState::Initialized {
            tracing::info!(session_id = %self.id, "session initialized");
        }
        *state = SessionState::Initialized;
        true
    }

    /// Attaches a new event-stream subscriber, replacing any previous one.
    pub fn attach_sink(&self) -> ReceiverStream<SinkEvent> {
        let stream = self.sink.attach();
        self.sink
            .push(SinkEvent::Comment(format!("Connected to session {}", self.id)));
        tracing::info!(session_id = %self.id, "event stream opened");
        stream
    }

    pub fn has_open_sink(&self) -> bool {
        self.sink.is_open()
    }

    /// Registers `payload` as a pending request and writes it to the worker. The returned
    /// receiver yields exactly one outcome.
    pub async fn submit(
        &self,
        id: &Value,
        method: &str,
        timeout: Duration,
        payload: &Value,
    ) -> Result<oneshot::Receiver<Completion>, BridgeError> {
        let receiver = self
            .correlator
            .register(id, method, timeout, Some(&self.sink))?;

        if let Err(err) = self.worker.send(payload).await {
            tracing::error!(
                session_id = %self.id,
                method = method,
                id = %id,
                error = %err,
                "failed to write request to worker"
            );
            self.correlator.fail(id, err.into());
        }
        Ok(receiver)
    }

    /// Writes a message that expects no response.
    pub async fn notify(&self, payload: &Value) -> Result<(), BridgeError> {
        if self.is_destroyed() {
            return Err(BridgeError::terminated("session destroyed"));
        }
        self.worker.send(payload).await.map_err(BridgeError::from)
    }

    /// Pushes `notifications/tools/list_changed` after a short delay, if a subscriber is open.
    pub fn schedule_tools_changed(&self) {
        let sink = self.sink.clone();
        let session_id = self.id.clone();
        self.timers
            .once(TimerKey::ToolsChanged, TOOLS_CHANGED_DELAY, async move {
                let notification = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": NOTIFICATION_TOOLS_CHANGED,
                });
                if sink.push(SinkEvent::Message(notification)) {
                    tracing::debug!(session_id = %session_id, "sent tools/list_changed notification");
                }
            });
    }

    /// Consumes worker output until the process exits, returning its exit status.
    pub(crate) async fn run_output_loop(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> Option<ExitInfo> {
        let mut framer = LineFramer::new();
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Output(bytes) => {
                    for frame in framer.feed(&bytes) {
                        self.route_frame(frame);
                    }
                }
                TransportEvent::Exited(exit) => {
                    if framer.pending_len() > 0 {
                        tracing::debug!(
                            session_id = %self.id,
                            bytes = framer.pending_len(),
                            "discarding unterminated worker output"
                        );
                    }
                    return Some(exit);
                }
            }
        }
        None
    }

    fn route_frame(&self, frame: Frame) {
        let payload = match frame {
            Frame::Message(payload) => payload,
            Frame::Invalid { raw, error } => {
                tracing::warn!(
                    session_id = %self.id,
                    error = %error,
                    raw = %Frame::preview(&raw),
                    "worker stdout: non-JSON output discarded"
                );
                return;
            }
        };

        if is_response(&payload) {
            self.correlator.resolve(payload);
            return;
        }

        if payload.get("method").is_some() {
            let method = method_of(&payload).to_string();
            if self.sink.push(SinkEvent::Message(payload)) {
                tracing::debug!(
                    session_id = %self.id,
                    method = %method,
                    "worker stdout: notification forwarded to event stream"
                );
            } else {
                tracing::debug!(
                    session_id = %self.id,
                    method = %method,
                    "worker stdout: notification dropped, no event stream attached"
                );
            }
            return;
        }

        tracing::debug!(session_id = %self.id, "worker stdout: message without id or method ignored");
    }

    /// Releases every resource the session holds. Returns the number of requests failed.
    pub(crate) fn teardown(&self, reason: &str) -> usize {
        *lock(&self.state) = SessionState::Destroyed;
        self.timers.cancel_all();
        let failed = self.correlator.fail_all(reason);
        self.sink.close();
        if self.worker.is_alive() {
            self.worker.terminate();
        }
        failed
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        let activity = *lock(&self.last_activity);
        SessionInfo {
            state,
            initialized: state == SessionState::Initialized,
            initializing: state == SessionState::Initializing,
            process_alive: self.worker.is_alive(),
            pid: self.worker.pid(),
            pending_requests: self
                .correlator
                .snapshot()
                .into_iter()
                .map(|pending| PendingRequestInfo {
                    id: pending.id,
                    method: pending.method,
                    age: pending.age.as_millis() as u64,
                })
                .collect(),
            last_activity: format_timestamp(activity.wall),
            created_at: format_timestamp(self.created_at_wall),
            age: self.age().as_millis() as u64,
            idle_time: activity.at.elapsed().as_millis() as u64,
            has_sse_connection: self.sink.is_open(),
        }
    }
}

pub(crate) fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
