use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Numeric error codes shared with the server. The taxonomy is server-defined;
/// the client only needs a handful of them for errors it raises itself.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const BAD_REQUEST: i32 = -32600;
    pub const INTERNAL_SERVER_ERROR: i32 = -32603;
    pub const UNAUTHORIZED: i32 = -32001;
    pub const FORBIDDEN: i32 = -32003;
    pub const NOT_FOUND: i32 = -32004;
    pub const METHOD_NOT_SUPPORTED: i32 = -32005;
    pub const TIMEOUT: i32 = -32008;
    pub const CONFLICT: i32 = -32009;
    pub const PRECONDITION_FAILED: i32 = -32012;
    pub const PAYLOAD_TOO_LARGE: i32 = -32013;
    pub const TOO_MANY_REQUESTS: i32 = -32029;
    pub const CLIENT_CLOSED_REQUEST: i32 = -32099;
}

/// The `{code, message}` error value that crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorShape {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ErrorShape {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        ErrorShape {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Failures of the physical transport. Scoped to the requests that were in
/// flight on the failing connection or HTTP request.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection closed prematurely")]
    ClosedPrematurely,
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// The uniform error surfaced to callers. Every variant carries a numeric
/// code and a message; no transport internals leak past `shape()`.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Programmer error: misconfigured chain, subscription on a transport
    /// that cannot carry one, `next` called from a terminating link.
    #[error("Usage error: {0}")]
    Usage(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Application error returned by the server for one operation.
    #[error("{0}")]
    Server(ErrorShape),
    #[error("Failed to deserialize result: {0}")]
    Deserialize(String),
}

impl ClientError {
    pub fn usage(message: impl Into<String>) -> Self {
        ClientError::Usage(message.into())
    }

    pub fn code(&self) -> i32 {
        match self {
            ClientError::Usage(_) => error_codes::BAD_REQUEST,
            ClientError::Transport(TransportError::ConnectionClosed)
            | ClientError::Transport(TransportError::ClosedPrematurely) => {
                error_codes::CLIENT_CLOSED_REQUEST
            }
            ClientError::Transport(_) => error_codes::INTERNAL_SERVER_ERROR,
            ClientError::Server(shape) => shape.code,
            ClientError::Deserialize(_) => error_codes::PARSE_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ClientError::Server(shape) => shape.message.clone(),
            other => other.to_string(),
        }
    }

    pub fn shape(&self) -> ErrorShape {
        match self {
            ClientError::Server(shape) => shape.clone(),
            other => ErrorShape::new(other.code(), other.message()),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, ClientError::Usage(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

impl From<ErrorShape> for ClientError {
    fn from(shape: ErrorShape) -> Self {
        ClientError::Server(shape)
    }
}
