use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use mcp_bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::rpc::{id_key, METHOD_TOOLS_CALL};
use crate::sink::{EventSink, SinkEvent};
use crate::timers::{TimerKey, TimerSet};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Terminal outcome of a registered request: the worker's response or a bridge error.
pub type Completion = Result<Value, BridgeError>;

#[derive(Debug)]
struct PendingRequest {
    id: Value,
    method: String,
    created_at: Instant,
    timeout: Duration,
    responder: oneshot::Sender<Completion>,
}

#[derive(Debug, Clone)]
pub struct PendingSummary {
    pub id: Value,
    pub method: String,
    pub age: Duration,
}

#[derive(Debug, Default)]
struct PendingTable {
    closed: Option<String>,
    entries: HashMap<String, PendingRequest>,
}

#[derive(Debug)]
struct CorrelatorInner {
    session_id: String,
    pending: Mutex<PendingTable>,
    timers: Arc<TimerSet<TimerKey>>,
}

/// Tracks one session's outstanding requests by JSON-RPC id.
///
/// Each entry leaves the table exactly once: through [`resolve`](Self::resolve),
/// [`expire`](Self::expire), [`fail`](Self::fail) or [`fail_all`](Self::fail_all). Whichever
/// path removes the entry delivers the outcome; the others find nothing and do nothing.
#[derive(Debug, Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Correlator {
    pub fn new(session_id: impl Into<String>, timers: Arc<TimerSet<TimerKey>>) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                session_id: session_id.into(),
                pending: Mutex::new(PendingTable::default()),
                timers,
            }),
        }
    }

    /// Registers `id` and arms its timeout. `tools/call` requests also get a progress heartbeat
    /// on `sink` when it is open at registration time.
    pub fn register(
        &self,
        id: &Value,
        method: &str,
        timeout: Duration,
        sink: Option<&Arc<EventSink>>,
    ) -> Result<oneshot::Receiver<Completion>, BridgeError> {
        let key = id_key(id);
        let (responder, receiver) = oneshot::channel();

        let mut table = lock(&self.inner.pending);
        if let Some(reason) = &table.closed {
            return Err(BridgeError::terminated(reason.clone()));
        }

        let displaced = table.entries.insert(
            key.clone(),
            PendingRequest {
                id: id.clone(),
                method: method.to_string(),
                created_at: Instant::now(),
                timeout,
                responder,
            },
        );
        if let Some(displaced) = displaced {
            tracing::warn!(
                session_id = %self.inner.session_id,
                id = %key,
                method = %method,
                displaced_method = %displaced.method,
                "correlator: duplicate id registered, replacing pending request"
            );
            self.inner.timers.cancel(&TimerKey::Heartbeat(key.clone()));
            let _ = displaced.responder.send(Err(BridgeError::internal(format!(
                "request superseded by a newer request with id {key}"
            ))));
        }

        let weak = Arc::downgrade(&self.inner);
        let expire_key = key.clone();
        self.inner.timers.once(
            TimerKey::RequestTimeout(key.clone()),
            timeout,
            async move {
                if let Some(correlator) = upgrade(&weak) {
                    correlator.expire(&expire_key);
                }
            },
        );

        if method == METHOD_TOOLS_CALL {
            if let Some(sink) = sink.filter(|sink| sink.is_open()) {
                tracing::debug!(
                    session_id = %self.inner.session_id,
                    id = %key,
                    "correlator: starting progress heartbeat"
                );
                let sink = sink.clone();
                let heartbeat_id = key.clone();
                self.inner.timers.every(
                    TimerKey::Heartbeat(key.clone()),
                    HEARTBEAT_INTERVAL,
                    move |count| {
                        let delivered =
                            sink.push(SinkEvent::Comment(format!("progress {heartbeat_id} {count}")));
                        let keep_going = delivered || sink.is_open();
                        async move { keep_going }
                    },
                );
            }
        }

        tracing::debug!(
            session_id = %self.inner.session_id,
            id = %key,
            method = %method,
            timeout_ms = timeout.as_millis() as u64,
            pending_count = table.entries.len(),
            "correlator: request registered"
        );

        Ok(receiver)
    }

    /// Delivers a worker response to its caller. Unknown ids are ignored.
    pub fn resolve(&self, payload: Value) -> bool {
        let Some(id) = payload.get("id") else {
            return false;
        };
        let key = id_key(id);
        let Some(entry) = self.take(&key) else {
            tracing::warn!(
                session_id = %self.inner.session_id,
                id = %key,
                has_error = payload.get("error").is_some(),
                "correlator: response has no matching pending request (orphan)"
            );
            return false;
        };

        tracing::info!(
            session_id = %self.inner.session_id,
            id = %key,
            method = %entry.method,
            response_ms = entry.created_at.elapsed().as_millis() as u64,
            "correlator: response matched"
        );
        deliver(entry, Ok(payload))
    }

    /// Fails `key` with a request-timeout error if it is still pending.
    pub fn expire(&self, key: &str) -> bool {
        let Some(entry) = self.take(key) else {
            return false;
        };
        let elapsed = entry.created_at.elapsed();
        tracing::warn!(
            session_id = %self.inner.session_id,
            id = %key,
            method = %entry.method,
            timeout_ms = entry.timeout.as_millis() as u64,
            "correlator: request timed out"
        );
        let error = BridgeError::RequestTimeout {
            method: entry.method.clone(),
            timeout: entry.timeout,
            elapsed,
        };
        deliver(entry, Err(error))
    }

    /// Fails a single pending request, e.g. after a transport write error.
    pub fn fail(&self, id: &Value, error: BridgeError) -> bool {
        match self.take(&id_key(id)) {
            Some(entry) => deliver(entry, Err(error)),
            None => false,
        }
    }

    /// Fails everything still pending with a terminated-session error and refuses further
    /// registrations. Returns the number of requests failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained = {
            let mut table = lock(&self.inner.pending);
            table.closed = Some(reason.to_string());
            let drained = table.entries.drain().collect::<Vec<_>>();
            for (key, _) in &drained {
                self.cancel_timers(key);
            }
            drained
        };

        let count = drained.len();
        for (_, entry) in drained {
            deliver(entry, Err(BridgeError::terminated(reason)));
        }
        if count > 0 {
            tracing::info!(
                session_id = %self.inner.session_id,
                failed = count,
                reason = reason,
                "correlator: failed pending requests"
            );
        }
        count
    }

    pub fn is_pending(&self, id: &Value) -> bool {
        lock(&self.inner.pending)
            .entries
            .contains_key(&id_key(id))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.pending).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PendingSummary> {
        let table = lock(&self.inner.pending);
        let mut summaries = table
            .entries
            .values()
            .map(|entry| PendingSummary {
                id: entry.id.clone(),
                method: entry.method.clone(),
                age: entry.created_at.elapsed(),
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|left, right| right.age.cmp(&left.age));
        summaries
    }

    /// Removes `key` and cancels its timers under the table lock, so a request registered
    /// under the same id right afterwards keeps its own timeout.
    fn take(&self, key: &str) -> Option<PendingRequest> {
        let mut table = lock(&self.inner.pending);
        let entry = table.entries.remove(key)?;
        self.cancel_timers(key);
        drop(table);
        Some(entry)
    }

    fn cancel_timers(&self, key: &str) {
        self.inner
            .timers
            .cancel(&TimerKey::RequestTimeout(key.to_string()));
        self.inner.timers.cancel(&TimerKey::Heartbeat(key.to_string()));
    }
}

fn deliver(entry: PendingRequest, completion: Completion) -> bool {
    if entry.responder.send(completion).is_err() {
        tracing::debug!(
            id = %entry.id,
            method = %entry.method,
            "correlator: caller went away before delivery"
        );
    }
    true
}

fn upgrade(weak: &Weak<CorrelatorInner>) -> Option<Correlator> {
    weak.upgrade().map(|inner| Correlator { inner })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
