//! Error taxonomy for host operations.
//!
//! Every failure a manager can produce is one of these kinds. The
//! dispatcher converts any of them into the single-field [`ErrorPayload`]
//! shape before a response crosses the IPC boundary, so the UI side only
//! ever branches on one error shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure kinds for host operations.
// Adjacent tagging: internal tagging cannot represent the newtype
// variants over String.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HostError {
    /// The sanitizer rejected malformed input. Fatal before any process
    /// exists.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The OS failed to create a process.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// A child process emitted a structured JSON error on stderr.
    #[error("{message}")]
    ProcessReported {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<i64>,
    },

    /// A bounded operation exceeded its limit.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A socket response outside 2xx-3xx, or an unparsable body.
    #[error("daemon request failed (status {status}): {message}")]
    Protocol { status: u16, message: String },

    /// A tracked resource (terminal, session) was not found.
    #[error("{0} not found")]
    NotFound(String),
}

impl HostError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// The HTTP-ish status carried by this error, if any.
    pub fn status(&self) -> Option<i64> {
        match self {
            Self::ProcessReported { status, .. } => *status,
            Self::Protocol { status, .. } => Some(i64::from(*status)),
            _ => None,
        }
    }
}

/// The one error shape the transport layer observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

impl From<HostError> for ErrorPayload {
    fn from(err: HostError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_protocol_status() {
        let err = HostError::Protocol {
            status: 409,
            message: "daemon is paused".into(),
        };
        let payload = ErrorPayload::from(err);
        assert_eq!(payload.status, Some(409));
        assert!(payload.message.contains("daemon is paused"));
    }

    #[test]
    fn test_payload_has_no_status_for_validation() {
        let payload = ErrorPayload::from(HostError::validation("bad token"));
        assert_eq!(payload.status, None);
        assert!(payload.message.contains("bad token"));
    }

    #[test]
    fn test_process_reported_status_survives() {
        let err = HostError::ProcessReported {
            message: "target not found".into(),
            status: Some(404),
        };
        assert_eq!(ErrorPayload::from(err).status, Some(404));
    }

    #[test]
    fn test_json_round_trip() {
        let err = HostError::Timeout("cache status".into());
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"timeout\""));
        let back: HostError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_every_kind_serializes() {
        let errors = [
            HostError::validation("bad token"),
            HostError::spawn("no such file"),
            HostError::ProcessReported {
                message: "target not found".into(),
                status: Some(404),
            },
            HostError::timeout("cache status"),
            HostError::Protocol {
                status: 423,
                message: "cache locked".into(),
            },
            HostError::not_found("terminal 't1'"),
        ];
        for err in errors {
            let json = serde_json::to_string(&err).unwrap();
            let back: HostError = serde_json::from_str(&json).unwrap();
            assert_eq!(back, err);
        }
    }
}
