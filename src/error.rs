//! Error types shared by the executor, snapshot store and runners.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Classification of a failed send, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Dns,
    Tls,
    Read,
    Other,
}

impl TransportErrorKind {
    /// Timeouts and refused/reset connections are worth another attempt
    /// regardless of policy configuration.
    pub fn is_transient(self) -> bool {
        matches!(self, TransportErrorKind::Timeout | TransportErrorKind::Connect)
    }
}

impl Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "TIMEOUT",
            TransportErrorKind::Connect => "CONNECT_ERROR",
            TransportErrorKind::Dns => "DNS_ERROR",
            TransportErrorKind::Tls => "TLS_ERROR",
            TransportErrorKind::Read => "READ_ERROR",
            TransportErrorKind::Other => "OTHER_ERROR",
        };
        write!(f, "{label}")
    }
}

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Invalid request: {0}")]
    RequestConstruction(String),

    #[error("Request failed after {attempts} attempt(s) [{kind}]: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        attempts: u32,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Snapshot not found: {0}")]
    SnapshotMissing(String),

    #[error("Snapshot `{path}` is corrupt: {reason}")]
    SnapshotCorrupt { path: String, reason: String },

    #[error("Schema validator failed to run: {0}")]
    SchemaValidation(String),

    #[error("Assertion could not be evaluated: {0}")]
    AssertionEvaluation(String),

    #[error("Required variable `{name}` could not be extracted: {reason}")]
    VariableExtraction { name: String, reason: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Persistence error at `{path}`: {message}")]
    Persistence { path: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl CheckError {
    /// Failures that mean the run itself cannot continue, as opposed to a
    /// single request or step going wrong.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            CheckError::Persistence { .. }
                | CheckError::Config(_)
                | CheckError::Worker(_)
                | CheckError::Io(_)
                | CheckError::Sqlite(_)
        )
    }

    pub fn persistence(path: impl Into<String>, message: impl Display) -> Self {
        CheckError::Persistence {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type CheckResult<T> = Result<T, CheckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_message_includes_attempts_and_kind() {
        let err = CheckError::Transport {
            kind: TransportErrorKind::Timeout,
            message: "operation timed out".into(),
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "Request failed after 4 attempt(s) [TIMEOUT]: operation timed out"
        );
    }

    #[test]
    fn missing_and_corrupt_snapshots_are_distinct() {
        let missing = CheckError::SnapshotMissing("a.snap.json".into());
        let corrupt = CheckError::SnapshotCorrupt {
            path: "a.snap.json".into(),
            reason: "bad json".into(),
        };
        assert!(matches!(missing, CheckError::SnapshotMissing(_)));
        assert!(matches!(corrupt, CheckError::SnapshotCorrupt { .. }));
        assert!(!missing.is_infrastructure());
    }

    #[test]
    fn io_errors_abort_the_run() {
        let err: CheckError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.is_infrastructure());
        assert!(!CheckError::Cancelled.is_infrastructure());
    }
}
