//! Error taxonomy shared by the recovery components

use std::io;

/// Failure reported by a [`PersistentStore`](crate::store::PersistentStore) backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("capacity exceeded writing `{key}`: need {needed} bytes, {available} available")]
    CapacityExceeded {
        key: String,
        needed: u64,
        available: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, StoreError::CapacityExceeded { .. })
    }
}

/// A snapshot section could not be written back into the host
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to apply section `{section}`: {message}")]
pub struct ApplyError {
    pub section: String,
    pub message: String,
}

impl ApplyError {
    pub fn new(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            message: message.into(),
        }
    }
}

/// Reasons a snapshot is rejected as malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("snapshot has no state sections")]
    EmptyPayload,

    #[error("snapshot timestamp is missing")]
    MissingTimestamp,

    #[error("snapshot is {size} bytes, above the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Top-level error for recovery operations
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("{operation} rejected: another history operation is in progress")]
    ConcurrencyRejection { operation: &'static str },

    #[error("save point not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(StoreError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state capture failed: {0}")]
    Capture(String),

    #[error("recovery is disabled")]
    Disabled,
}

impl From<StoreError> for RecoveryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CapacityExceeded {
                needed, available, ..
            } => RecoveryError::CapacityExceeded { needed, available },
            other => RecoveryError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
