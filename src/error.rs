//! Error types for fleet sync
//!
//! Errors are classified by recoverability:
//! - Retryable: network failures, timeouts
//! - Integrity: checksum mismatch, retried once then escalated
//! - Fatal: local storage failures, the process exits
//! - RequiresOperator: rejected credentials or requests, bad configuration

use std::time::Duration;

use thiserror::Error;

use crate::db::{DbError, EntityType};

/// Error types for a sync round
#[derive(Debug, Error)]
pub enum SyncError {
    // Retryable errors
    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    // Retried once, then escalated
    #[error("Integrity mismatch on {phase} of {entity}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        entity: EntityType,
        phase: &'static str,
        expected: String,
        actual: String,
    },

    // Fatal for the process
    #[error("Local storage failure: {0}")]
    LocalStorageFatal(#[from] DbError),

    // Requires operator action
    #[error("Remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sync round cancelled")]
    Cancelled,
}

impl SyncError {
    /// Returns true if the same batch may simply be attempted again after a
    /// delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_) | SyncError::Timeout(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, SyncError::IntegrityMismatch { .. })
    }

    /// Returns true if the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::LocalStorageFatal(_))
    }

    /// Returns true if retrying cannot help without someone changing
    /// something.
    pub fn requires_operator(&self) -> bool {
        matches!(self, SyncError::RemoteRejected(_) | SyncError::Configuration(_))
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::TransientNetwork(_) => "Check the kiosk's network connection; sync retries automatically.",
            SyncError::Timeout(_) => "The remote store is slow or unreachable; sync retries automatically.",
            SyncError::IntegrityMismatch { .. } => {
                "A batch did not verify. If this persists, compare the remote store against the kiosk's local store."
            }
            SyncError::LocalStorageFatal(_) => {
                "Check disk space and the local database file, then restart the kiosk."
            }
            SyncError::RemoteRejected(_) => "Check the sync credentials and the remote store's logs.",
            SyncError::Configuration(_) => "Check the sync section of ~/.adkiosk/config.json",
            SyncError::Cancelled => "No action needed.",
        }
    }
}

/// Serializable error representation for status reporting
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorReport {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    Integrity,
    Fatal,
    RequiresOperator,
    Cancelled,
}

impl From<&SyncError> for SyncErrorReport {
    fn from(err: &SyncError) -> Self {
        let error_type = if err.is_fatal() {
            ErrorType::Fatal
        } else if err.requires_operator() {
            ErrorType::RequiresOperator
        } else if err.is_integrity() {
            ErrorType::Integrity
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::Cancelled
        };

        SyncErrorReport {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable() || err.is_integrity(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
