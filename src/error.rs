//! Error types for oracle-ls.
//!
//! Errors are layered by where they originate:
//!
//! - [`TransportError`]: the oracle process could not be spawned, exited, or
//!   its stdin pipe rejected a write.
//! - [`OracleError`]: everything a caller of the bridge can observe, wrapping
//!   transport failures and adding correlator failures (timeouts, lost
//!   connections, malformed frames) and oracle-reported errors.
//!
//! Transport errors are wrapped, never flattened into strings, so
//! `std::error::Error::source()` lets a caller tell "the oracle reported a
//! syntax error" apart from "the oracle process died".

use std::sync::PoisonError;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failures of the subprocess transport itself.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The oracle executable could not be started.
    #[error("failed to spawn oracle `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A stdio pipe was not available after spawning.
    #[error("oracle {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// Writing a frame to the oracle's stdin failed (pipe closed).
    #[error("failed to write frame to oracle stdin")]
    Write(#[source] std::io::Error),

    /// A frame contained a raw newline and would break line framing.
    #[error("frame contains a raw newline")]
    InvalidFrame,

    /// The transport has been stopped or its process is gone.
    #[error("oracle transport is not running")]
    NotRunning,

    /// The oracle process exited.
    #[error("oracle process exited (code {code:?})")]
    Exited { code: Option<i32> },
}

/// Standard JSON-RPC error codes used when the host synthesizes an error.
pub struct ErrorCodes;

impl ErrorCodes {
    /// Malformed JSON received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not known to the receiver.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal failure (also used for connection loss on the host front end).
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Request failed but was syntactically correct (timeouts, dead oracle).
    pub const REQUEST_FAILED: i32 = -32803;
}

/// `{code, message, data?}` error object, as carried in a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Coarse classification of an [`OracleError`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Transport,
    Timeout,
    ConnectionLost,
    ConnectionClosed,
    Protocol,
    Encode,
    Oracle,
    NotStarted,
}

/// Error returned by bridge calls and everything layered on top of them.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failed")]
    Transport(#[from] TransportError),

    /// No response arrived within the per-call timeout.
    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The oracle process died (or its stdout closed) while the call was pending.
    #[error("connection to oracle lost: {reason}")]
    ConnectionLost { reason: String },

    /// The bridge was stopped while the call was pending.
    #[error("connection to oracle closed")]
    ConnectionClosed,

    /// The oracle sent something that is not a valid response.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    #[error("failed to encode request")]
    Encode(#[source] serde_json::Error),

    /// Structured error reported by the oracle itself. Domain data, not a bug.
    #[error("oracle error: {0}")]
    Oracle(ResponseError),

    #[error("bridge is not started")]
    NotStarted,
}

impl OracleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OracleError::Transport(_) => ErrorKind::Transport,
            OracleError::Timeout { .. } => ErrorKind::Timeout,
            OracleError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            OracleError::ConnectionClosed => ErrorKind::ConnectionClosed,
            OracleError::Protocol { .. } => ErrorKind::Protocol,
            OracleError::Encode(_) => ErrorKind::Encode,
            OracleError::Oracle(_) => ErrorKind::Oracle,
            OracleError::NotStarted => ErrorKind::NotStarted,
        }
    }

    /// True when the oracle answered with a structured error.
    pub fn is_oracle_reported(&self) -> bool {
        matches!(self, OracleError::Oracle(_))
    }

    /// Convert into the error object returned by the host front end.
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            OracleError::Oracle(inner) => inner.clone(),
            other => {
                let code = match other.kind() {
                    ErrorKind::Protocol | ErrorKind::Encode => ErrorCodes::INTERNAL_ERROR,
                    _ => ErrorCodes::REQUEST_FAILED,
                };
                ResponseError {
                    code,
                    message: error_chain(other),
                    data: Some(serde_json::json!({ "kind": other.kind() })),
                }
            }
        }
    }
}

/// Render an error and its `source()` chain as `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Result type for bridge operations.
pub type OracleResult<T> = Result<T, OracleError>;

/// Recover the guard from a poisoned lock instead of propagating the panic.
pub trait LockResultExt<T> {
    /// The context names the operation that found the lock poisoned.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "oracle_ls::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
