use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{Stream, StreamExt};
use mcp_bridge_error::BridgeError;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::rpc::{METHOD_TOOLS_LIST, PROTOCOL_VERSION};
use crate::session::{format_timestamp, SessionState};
use crate::sink::SinkEvent;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

const SERVICE_NAME: &str = "mcp-session-bridge";
const REASON_CLIENT_SHUTDOWN: &str = "client shutdown";
const DERIVED_SESSION_ID_LEN: usize = 16;
const DEBUG_TOOLS_REQUEST_ID: u64 = 999;

pub fn build_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/mcp", post(post_mcp).get(get_mcp).delete(delete_mcp))
        .route("/debug/sessions", get(get_debug_sessions))
        .route("/debug/tools", post(post_debug_tools))
        .layer(cors_layer())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                })
                .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                    tracing::debug!(
                        parent: span,
                        status = %res.status(),
                        latency_ms = latency.as_millis() as u64
                    );
                }),
        )
        .with_state(dispatcher)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CACHE_CONTROL,
            header::USER_AGENT,
            header::ORIGIN,
            header::REFERER,
            HeaderName::from_static("last-event-id"),
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(PROTOCOL_VERSION_HEADER),
        ])
        .expose_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(PROTOCOL_VERSION_HEADER),
        ])
}

async fn get_root(State(dispatcher): State<Dispatcher>) -> Json<Value> {
    let config = dispatcher.registry().config();
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "transport": "Streamable HTTP",
        "endpoints": {
            "health": "/health",
            "mcp": "/mcp",
            "sessions": "/debug/sessions",
        },
        "documentation": "Connect your MCP client to /mcp endpoint",
        "timeouts": {
            "requestTimeout": format_ms(config.request_timeout),
            "sessionIdleTimeout": format_ms(config.session_idle_timeout),
            "sessionMaxLifetime": format_ms(config.session_max_lifetime),
        },
    }))
}

async fn get_health(State(dispatcher): State<Dispatcher>) -> Json<Value> {
    let registry = dispatcher.registry();
    let config = registry.config();
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": format_timestamp(OffsetDateTime::now_utc()),
        "config": {
            "requestTimeout": format_ms(config.request_timeout),
            "sessionIdleTimeout": format_ms(config.session_idle_timeout),
            "sessionMaxLifetime": format_ms(config.session_max_lifetime),
        },
        "sessions": {
            "active": registry.len().await,
        },
    }))
}

async fn post_mcp(
    State(dispatcher): State<Dispatcher>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let session_id = session_id_for(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    let outcome = match serde_json::from_slice::<Value>(&body) {
        Ok(message) => dispatcher.dispatch(&session_id, message).await,
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "request body is not JSON");
            let error = BridgeError::InvalidRequest;
            DispatchOutcome::Failed {
                status: error.status_code(),
                body: error.to_response(None),
            }
        }
    };

    let response = match outcome {
        DispatchOutcome::Response(value) => (StatusCode::OK, Json(value)).into_response(),
        DispatchOutcome::Accepted => {
            (StatusCode::ACCEPTED, Json(json!({"success": true}))).into_response()
        }
        DispatchOutcome::Failed { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(body)).into_response()
        }
    };
    with_session_headers(response, &session_id)
}

async fn get_mcp(
    State(dispatcher): State<Dispatcher>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let session_id = session_id_for(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let registry = dispatcher.registry();
    let session = match registry.resolve(&session_id).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(session_id = %session_id, error = %err, "failed to open event stream");
            let response = (
                StatusCode::from_u16(err.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                Json(err.to_response(None)),
            )
                .into_response();
            return with_session_headers(response, &session_id);
        }
    };

    let stream = sse_events(session.attach_sink());
    let keep_alive = KeepAlive::new()
        .interval(registry.config().keepalive_interval)
        .text("ping");
    let mut response = Sse::new(stream).keep_alive(keep_alive).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    with_session_headers(response, &session_id)
}

async fn delete_mcp(
    State(dispatcher): State<Dispatcher>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let session_id = session_id_for(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let evicted = dispatcher
        .registry()
        .evict(&session_id, REASON_CLIENT_SHUTDOWN)
        .await;
    let status = if evicted {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    };
    with_session_headers(status.into_response(), &session_id)
}

async fn get_debug_sessions(State(dispatcher): State<Dispatcher>) -> Json<Value> {
    let registry = dispatcher.registry();
    let config = registry.config();
    let sessions = registry
        .snapshot()
        .await
        .into_iter()
        .map(|(id, info)| (id, serde_json::to_value(info).unwrap_or(Value::Null)))
        .collect::<serde_json::Map<_, _>>();

    Json(json!({
        "totalSessions": sessions.len(),
        "config": {
            "requestTimeout": config.request_timeout.as_millis() as u64,
            "initializationTimeout": config.initialization_timeout.as_millis() as u64,
            "sessionIdleTimeout": config.session_idle_timeout.as_millis() as u64,
            "sessionMaxLifetime": config.session_max_lifetime.as_millis() as u64,
            "keepaliveInterval": config.keepalive_interval.as_millis() as u64,
            "sessionCheckInterval": config.session_check_interval.as_millis() as u64,
        },
        "sessions": sessions,
    }))
}

async fn post_debug_tools(
    State(dispatcher): State<Dispatcher>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Json<Value> {
    let session_id = session_id_for(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    tracing::info!(session_id = %session_id, "manual tools/list request");

    let Some(session) = dispatcher.registry().get(&session_id).await else {
        return Json(json!({"error": "No active session found. Connect to /mcp first."}));
    };
    if session.state() != SessionState::Initialized {
        return Json(json!({"error": "Session not initialized yet."}));
    }

    let message = json!({
        "jsonrpc": "2.0",
        "id": DEBUG_TOOLS_REQUEST_ID,
        "method": METHOD_TOOLS_LIST,
        "params": {},
    });
    if let Err(err) = session.notify(&message).await {
        return Json(json!({"error": err.to_string()}));
    }

    Json(json!({
        "success": true,
        "message": "tools/list sent to MCP process, check logs for response",
        "sessionInfo": {
            "initialized": true,
            "processAlive": session.is_process_alive(),
            "pendingRequests": session.pending_count(),
            "age": session.age().as_millis() as u64,
            "idleSince": session.idle_for().as_millis() as u64,
        },
    }))
}

fn sse_events(
    events: impl Stream<Item = SinkEvent> + Send + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    events.map(|event| {
        Ok(match event {
            SinkEvent::Comment(text) => Event::default().comment(text),
            SinkEvent::Message(payload) => Event::default().data(payload.to_string()),
        })
    })
}

fn with_session_headers(mut response: Response, session_id: &str) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(session_id) {
        headers.insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(PROTOCOL_VERSION_HEADER),
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    response
}

/// The `Mcp-Session-Id` header when present, otherwise an id derived from the caller's
/// address and user agent so that header-less clients keep landing on the same session.
pub fn session_id_for(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(explicit) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return explicit.to_string();
    }

    let ip = peer
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");
    derive_session_id(&ip, user_agent)
}

fn derive_session_id(ip: &str, user_agent: &str) -> String {
    let mut encoded = STANDARD.encode(format!("{ip}{user_agent}"));
    encoded.truncate(DERIVED_SESSION_ID_LEN);
    encoded
}

fn format_ms(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}
