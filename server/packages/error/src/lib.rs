use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InternalError,
    RequestTimeout,
    SessionTerminated,
}

impl ErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidRequest => -32600,
            Self::InternalError => -32603,
            Self::RequestTimeout => -32001,
            Self::SessionTerminated => -32000,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::InternalError => 500,
            Self::RequestTimeout => 408,
            Self::SessionTerminated => 408,
        }
    }
}

/// The `error` member of a JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid Request")]
    InvalidRequest,
    #[error("Internal error: {message}")]
    Internal { message: String },
    #[error("worker transport closed: {message}")]
    TransportClosed { message: String },
    #[error("failed to spawn worker `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("Request timed out after {}ms", .timeout.as_millis())]
    RequestTimeout {
        method: String,
        timeout: Duration,
        elapsed: Duration,
    },
    #[error("Session terminated: {reason}")]
    SessionTerminated { reason: String },
}

impl BridgeError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::SessionTerminated {
            reason: reason.into(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest => ErrorCode::InvalidRequest,
            Self::Internal { .. } | Self::TransportClosed { .. } | Self::Spawn { .. } => {
                ErrorCode::InternalError
            }
            Self::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Self::SessionTerminated { .. } => ErrorCode::SessionTerminated,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.error_code().status_code()
    }

    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        let data = match self {
            Self::InvalidRequest | Self::SessionTerminated { .. } => None,
            Self::Internal { message } => Some(Value::String(message.clone())),
            Self::TransportClosed { message } => Some(Value::String(message.clone())),
            Self::Spawn { command, error } => {
                let mut map = Map::new();
                map.insert("command".to_string(), Value::String(command.clone()));
                map.insert("error".to_string(), Value::String(error.to_string()));
                Some(Value::Object(map))
            }
            Self::RequestTimeout {
                method,
                timeout,
                elapsed,
            } => Some(json!({
                "timeout": timeout.as_millis() as u64,
                "elapsed": elapsed.as_millis() as u64,
                "method": method,
            })),
        };

        let message = match self {
            // Transport failures surface as a plain internal error with the cause in `data`.
            Self::TransportClosed { .. } | Self::Spawn { .. } => "Internal error".to_string(),
            _ => self.to_string(),
        };

        JsonRpcErrorObject {
            code: self.error_code().code(),
            message,
            data,
        }
    }

    /// Renders a complete JSON-RPC error response. A missing id is encoded as `null`.
    pub fn to_response(&self, id: Option<&Value>) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id.cloned().unwrap_or(Value::Null),
            "error": self.to_error_object(),
        })
    }
}

impl From<BridgeError> for JsonRpcErrorObject {
    fn from(value: BridgeError) -> Self {
        value.to_error_object()
    }
}

impl From<&BridgeError> for JsonRpcErrorObject {
    fn from(value: &BridgeError) -> Self {
        value.to_error_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_response_carries_method_and_duration() {
        let err = BridgeError::RequestTimeout {
            method: "tools/call".to_string(),
            timeout: Duration::from_millis(180_000),
            elapsed: Duration::from_millis(180_004),
        };
        let response = err.to_response(Some(&json!(7)));

        assert_eq!(response["id"], 7);
        assert_eq!(response["error"]["code"], -32001);
        assert_eq!(response["error"]["message"], "Request timed out after 180000ms");
        assert_eq!(response["error"]["data"]["method"], "tools/call");
        assert_eq!(response["error"]["data"]["timeout"], 180_000);
        assert_eq!(err.status_code(), 408);
    }

    #[test]
    fn terminated_response_has_reason_and_no_data() {
        let err = BridgeError::terminated("process exited");
        let response = err.to_response(None);

        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["error"]["message"], "Session terminated: process exited");
        assert!(response["error"].get("data").is_none());
    }

    #[test]
    fn transport_failures_map_to_internal_error() {
        let err = BridgeError::TransportClosed {
            message: "stdin is not writable".to_string(),
        };
        let object = err.to_error_object();

        assert_eq!(object.code, -32603);
        assert_eq!(object.message, "Internal error");
        assert_eq!(object.data, Some(json!("stdin is not writable")));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn invalid_request_uses_standard_code() {
        let err = BridgeError::InvalidRequest;
        assert_eq!(err.to_error_object().code, -32600);
        assert_eq!(err.to_error_object().message, "Invalid Request");
        assert_eq!(err.status_code(), 400);
    }
}
