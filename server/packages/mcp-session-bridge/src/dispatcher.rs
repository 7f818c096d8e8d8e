use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use mcp_bridge_error::BridgeError;
use serde_json::{json, Map, Value};

use crate::registry::{SessionRegistry, REASON_PROCESS_EXITED};
use crate::rpc::{InboundMessage, METHOD_INITIALIZE, NOTIFICATION_INITIALIZED, PROTOCOL_VERSION};
use crate::session::Session;

/// What the HTTP layer should send back for one inbound message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A JSON-RPC response (success or worker-reported error).
    Response(Value),
    /// Notification accepted; nothing to wait for.
    Accepted,
    /// The bridge itself failed the message; `body` is a JSON-RPC error response.
    Failed { status: u16, body: Value },
}

impl DispatchOutcome {
    fn failed(error: &BridgeError, id: Option<&Value>) -> Self {
        Self::Failed {
            status: error.status_code(),
            body: error.to_response(id),
        }
    }
}

/// Routes inbound JSON-RPC messages to their session's worker.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
}

impl Dispatcher {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, session_id: &str, message: Value) -> DispatchOutcome {
        let inbound = InboundMessage::classify(&message);
        tracing::info!(
            session_id = session_id,
            method = inbound.method().unwrap_or("<none>"),
            id = %message.get("id").map(|id| id.to_string()).unwrap_or_default(),
            "dispatch: received message"
        );

        let start = Instant::now();
        let outcome = match &inbound {
            InboundMessage::Invalid { id } => {
                tracing::warn!(session_id = session_id, "dispatch: invalid JSON-RPC message");
                return DispatchOutcome::failed(&BridgeError::InvalidRequest, id.as_ref());
            }
            InboundMessage::Notification { method } => {
                self.notify(session_id, method, &message).await
            }
            InboundMessage::Initialize { id } => {
                self.request(session_id, id, METHOD_INITIALIZE, &message)
                    .await
            }
            InboundMessage::Request { id, method } => {
                self.request(session_id, id, method, &message).await
            }
        };

        match outcome {
            Ok(outcome) => {
                tracing::debug!(
                    session_id = session_id,
                    total_ms = start.elapsed().as_millis() as u64,
                    "dispatch: complete"
                );
                outcome
            }
            Err(err) => {
                tracing::warn!(
                    session_id = session_id,
                    total_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "dispatch: failed"
                );
                DispatchOutcome::failed(&err, message.get("id"))
            }
        }
    }

    async fn notify(
        &self,
        session_id: &str,
        method: &str,
        message: &Value,
    ) -> Result<DispatchOutcome, BridgeError> {
        let session = self
            .with_live_session(session_id, |session| async move {
                session.notify(message).await?;
                Ok(session)
            })
            .await?;
        if method == NOTIFICATION_INITIALIZED && session.mark_initialized() {
            session.schedule_tools_changed();
        }
        Ok(DispatchOutcome::Accepted)
    }

    async fn request(
        &self,
        session_id: &str,
        id: &Value,
        method: &str,
        message: &Value,
    ) -> Result<DispatchOutcome, BridgeError> {
        let initialize = method == METHOD_INITIALIZE;
        let config = self.registry.config();
        let timeout = if initialize {
            config.initialization_timeout
        } else {
            config.request_timeout
        };

        let (session, receiver) = self
            .with_live_session(session_id, |session| async move {
                if initialize && !session.begin_initialize() {
                    return Err(BridgeError::terminated("session destroyed"));
                }
                let receiver = session.submit(id, method, timeout, message).await?;
                Ok((session, receiver))
            })
            .await?;

        let mut response = match receiver.await {
            Ok(completion) => completion?,
            Err(_) => return Err(BridgeError::internal("response channel dropped")),
        };
        if initialize && response.get("error").is_none() {
            session.mark_initialized();
            augment_initialize_result(&mut response, session.id());
        }
        Ok(DispatchOutcome::Response(response))
    }

    /// Runs `send` against the live session for `session_id`. If the session was evicted
    /// before the message reached its worker, `send` runs once more on a fresh session.
    async fn with_live_session<T, F, Fut>(&self, session_id: &str, send: F) -> Result<T, BridgeError>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let session = self.live_session(session_id).await?;
        match send(session.clone()).await {
            Err(err) if session.is_destroyed() => {
                tracing::debug!(
                    session_id = session_id,
                    error = %err,
                    "dispatch: session evicted mid-dispatch, retrying on a fresh session"
                );
                let fresh = self.live_session(session_id).await?;
                send(fresh).await
            }
            other => other,
        }
    }

    /// Resolves the session and makes sure its worker is still running. A dead worker has
    /// already been reaped, so the session goes down with the exit reason even if its stdout
    /// is still draining.
    async fn live_session(&self, session_id: &str) -> Result<Arc<Session>, BridgeError> {
        let session = self.registry.resolve(session_id).await?;
        if !session.is_process_alive() {
            tracing::error!(session_id = session_id, "dispatch: worker process not available");
            self.registry
                .evict_session(&session, REASON_PROCESS_EXITED)
                .await;
            return Err(BridgeError::internal("MCP process not available"));
        }
        Ok(session)
    }
}

/// Adds `sessionId` and, when the worker left it out, the default `protocolVersion`.
fn augment_initialize_result(response: &mut Value, session_id: &str) {
    let Some(object) = response.as_object_mut() else {
        return;
    };
    let result = object
        .entry("result")
        .or_insert_with(|| Value::Object(Map::new()));
    if !result.is_object() {
        *result = json!({});
    }
    if let Some(result) = result.as_object_mut() {
        result.insert("sessionId".to_string(), Value::String(session_id.to_string()));
        let has_version = result
            .get("protocolVersion")
            .is_some_and(|version| !version.is_null());
        if !has_version {
            result.insert(
                "protocolVersion".to_string(),
                Value::String(PROTOCOL_VERSION.to_string()),
            );
        }
    }
}
