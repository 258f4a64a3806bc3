use bridge_traits::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Ledger corruption for {key}: {message}")]
    LedgerCorruption { key: String, message: String },

    #[error("Media source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Invalid job key: {0}")]
    InvalidJobKey(String),

    #[error("Invalid job state: {0}")]
    InvalidStatus(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Persistence failures stop the scheduler; everything else is a job
    /// level failure handled by the retry machinery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Database(_))
    }

    /// Failure kind recorded when this error ends a task attempt.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::LedgerCorruption { .. } => FailureKind::LedgerCorruption,
            SyncError::SourceUnavailable(_) => FailureKind::SourceUnavailable,
            SyncError::Bridge(BridgeError::NotFound(_)) => FailureKind::ItemGone,
            SyncError::Bridge(BridgeError::Timeout(_)) | SyncError::Timeout(_) => {
                FailureKind::Timeout
            }
            SyncError::Bridge(BridgeError::Network(_)) => FailureKind::TransientNetwork,
            SyncError::Bridge(_) => FailureKind::SourceUnavailable,
            _ => FailureKind::Internal,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

// ============================================================================
// Failure Taxonomy
// ============================================================================

/// Why a single task attempt did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The media store could not be enumerated or read
    SourceUnavailable,
    /// The item no longer exists on the device
    ItemGone,
    /// Connection failure, 5xx, 408 or 429
    TransientNetwork,
    /// The attempt exceeded its deadline
    Timeout,
    /// The remote refused the item with a non-retryable 4xx
    RemoteRejected,
    /// Persisted state could not be decoded
    LedgerCorruption,
    /// The task body panicked or failed for a reason outside the taxonomy
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnavailable => "source_unavailable",
            FailureKind::ItemGone => "item_gone",
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::Timeout => "timeout",
            FailureKind::RemoteRejected => "remote_rejected",
            FailureKind::LedgerCorruption => "ledger_corruption",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure carried by a task outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_database_errors_are_fatal() {
        assert!(SyncError::Database("disk I/O error".into()).is_fatal());
        assert!(!SyncError::SourceUnavailable("denied".into()).is_fatal());
        assert!(!SyncError::LedgerCorruption {
            key: "scan".into(),
            message: "bad state".into()
        }
        .is_fatal());
        assert!(!SyncError::Bridge(BridgeError::Network("reset".into())).is_fatal());
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            SyncError::Bridge(BridgeError::NotFound("a.jpg".into())).failure_kind(),
            FailureKind::ItemGone
        );
        assert_eq!(
            SyncError::Bridge(BridgeError::Timeout("slow".into())).failure_kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            SyncError::SourceUnavailable("revoked".into()).failure_kind(),
            FailureKind::SourceUnavailable
        );
    }

    #[test]
    fn test_task_failure_display() {
        let failure = TaskFailure::new(FailureKind::RemoteRejected, "HTTP 413");
        assert_eq!(failure.to_string(), "remote_rejected: HTTP 413");
    }
}
