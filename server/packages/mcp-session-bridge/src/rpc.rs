//! JSON-RPC message classification for inbound client traffic.

use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const NOTIFICATION_PREFIX: &str = "notifications/";
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
pub const NOTIFICATION_TOOLS_CHANGED: &str = "notifications/tools/list_changed";

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Missing `jsonrpc` or `method`; carries the id (if any) for the error reply.
    Invalid { id: Option<Value> },
    Notification { method: String },
    Initialize { id: Value },
    Request { id: Value, method: String },
}

impl InboundMessage {
    pub fn classify(message: &Value) -> Self {
        let id = message.get("id").filter(|id| !id.is_null()).cloned();
        let has_version = message.get("jsonrpc").is_some_and(is_truthy);
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .filter(|method| !method.is_empty());

        let Some(method) = method.filter(|_| has_version) else {
            return Self::Invalid { id };
        };

        match id {
            _ if method.starts_with(NOTIFICATION_PREFIX) => Self::Notification {
                method: method.to_string(),
            },
            None => Self::Notification {
                method: method.to_string(),
            },
            Some(id) if method == METHOD_INITIALIZE => Self::Initialize { id },
            Some(id) => Self::Request {
                id,
                method: method.to_string(),
            },
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Invalid { .. } => None,
            Self::Notification { method } | Self::Request { method, .. } => Some(method),
            Self::Initialize { .. } => Some(METHOD_INITIALIZE),
        }
    }
}

/// Stable map key for a JSON-RPC id; `1` and `"1"` stay distinct.
pub fn id_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Worker output that answers a request: it has an id and no method.
pub fn is_response(message: &Value) -> bool {
    message.get("id").is_some() && message.get("method").is_none()
}

pub fn method_of(message: &Value) -> &str {
    message
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("<none>")
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}
