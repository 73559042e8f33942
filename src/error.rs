//! Error types shared by every MDM component.

use crate::model::RecordKey;
use std::time::Duration;
use thiserror::Error;

/// Result type for MDM operations
pub type Result<T> = std::result::Result<T, MdmError>;

/// Errors raised by the MDM core
#[derive(Error, Debug)]
pub enum MdmError {
    /// Startup configuration is unusable (missing matcher, bad values)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Caller lacks the policy needed for the requested write
    #[error("permission denied: {0}")]
    Permission(String),

    /// The relationship graph broke the one-active-master invariant
    #[error("consistency violation on {record}: {detail}")]
    ConsistencyViolation { record: RecordKey, detail: String },

    /// A master is held by an in-flight operation; retry after the hint
    #[error("master {master} is busy, retry after {retry_after:?}")]
    MergeConflict {
        master: RecordKey,
        retry_after: Duration,
    },

    /// Bundle-level objects are only addressable through their entries
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The resolution queue no longer accepts work (shutdown in progress)
    #[error("resolution queue closed")]
    QueueClosed,

    /// A worker queue is at capacity; the record stays unlinked until reconciled
    #[error("resolution queue full")]
    QueueFull,

    /// Failure reported by the matching collaborator
    #[error("matching failed: {0}")]
    Matching(#[from] anyhow::Error),
}

impl MdmError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MdmError::MergeConflict { .. } | MdmError::TimedOut(_) | MdmError::QueueFull
        )
    }
}

impl From<figment::Error> for MdmError {
    fn from(e: figment::Error) -> Self {
        MdmError::Configuration(e.to_string())
    }
}
