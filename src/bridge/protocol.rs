//! Wire envelopes exchanged with the oracle.
//!
//! Requests are `{id, method, params}`; responses are `{id, result?, error?}`.
//! Lines without an `id` are oracle notifications and are not routed.

use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorCodes, OracleError, ResponseError};

/// Request id for oracle calls.
///
/// Unique and monotonically increasing for the lifetime of one oracle
/// process; each new process starts again at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Parse an id value. `None` unless it is a non-negative integer.
    pub fn from_value(id: &Value) -> Option<Self> {
        id.as_u64().map(Self)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    id: RequestId,
    method: &'a str,
    params: &'a Value,
}

/// Encode a request as a single line (no trailing newline).
///
/// `serde_json` escapes control characters inside strings, so the output
/// never contains a raw newline.
pub fn encode_request(
    id: RequestId,
    method: &str,
    params: &Value,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RequestEnvelope { id, method, params })
}

/// A decoded line from the oracle.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: RequestId,
        outcome: Result<Value, ResponseError>,
    },
    /// A message without an id.
    Notification { method: Option<String> },
}

/// Decode one line of oracle output.
///
/// `error` wins over `result` when both are present. A `result` that is
/// absent resolves to `null`. An `error` object that does not have the
/// `{code, message}` shape is kept as an internal error carrying the raw
/// value, so the waiting caller still gets an answer.
///
/// Lines that are not JSON objects, or carry an id that is not a
/// non-negative integer, are protocol violations.
pub fn decode_inbound(line: &str) -> Result<Inbound, OracleError> {
    let message: Value = serde_json::from_str(line).map_err(|e| OracleError::Protocol {
        message: format!("invalid JSON: {}", e),
    })?;
    if !message.is_object() {
        return Err(OracleError::Protocol {
            message: "expected a JSON object".to_string(),
        });
    }

    let id = match message.get("id") {
        None | Some(Value::Null) => {
            let method = message
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Inbound::Notification { method });
        }
        Some(raw) => RequestId::from_value(raw).ok_or_else(|| OracleError::Protocol {
            message: format!("invalid response id {}", raw),
        })?,
    };

    let outcome = match message.get("error") {
        Some(error) if !error.is_null() => Err(decode_error(error)),
        _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
    };
    Ok(Inbound::Response { id, outcome })
}

fn decode_error(error: &Value) -> ResponseError {
    serde_json::from_value::<ResponseError>(error.clone()).unwrap_or_else(|_| ResponseError {
        code: ErrorCodes::INTERNAL_ERROR,
        message: match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        data: Some(error.clone()),
    })
}

/// Identity of a call for in-flight deduplication: method plus canonical
/// params.
///
/// `serde_json` objects are ordered maps, so two params values that differ
/// only in key order serialize identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    method: String,
    params: String,
}

impl DedupKey {
    pub fn new(method: &str, params: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: method.to_string(),
            params: serde_json::to_string(params)?,
        })
    }
}
