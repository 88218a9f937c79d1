//! Error types for tessel
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! - **Conflict**: retriable. Restart the unit of work from a fresh snapshot.
//! - **Aborted**: not guaranteed retry-safe. Raised by user code, an extension,
//!   or a store/remote failure, with an optional cause.
//! - **Protocol violations** (`InvalidState`, `AlreadyRegistered`,
//!   `NotRegistered`): programming errors, surfaced immediately, never retried.
//!
//! Watcher-count and merge-state contention is never reported here; the engine
//! absorbs it with retry loops and the pending-merge queue.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for tessel operations
pub type TesselResult<T> = std::result::Result<T, TesselError>;

/// Error types for the tessel engine
#[derive(Debug, Clone, Error)]
pub enum TesselError {
    /// A concurrent commit invalidated what this transaction observed
    #[error("Transaction conflict: {reason}")]
    Conflict {
        /// Which policy rejected the commit and why
        reason: String,
    },

    /// Unit of work aborted
    #[error("Transaction aborted: {reason}")]
    Aborted {
        /// Human-readable reason for the abort
        reason: String,
        /// Underlying failure, if any
        #[source]
        cause: Option<Arc<TesselError>>,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Extension was already registered on the branch
    #[error("Extension {0} is already registered")]
    AlreadyRegistered(u64),

    /// Extension is not registered on the branch
    #[error("Extension {0} is not registered")]
    NotRegistered(u64),

    /// Extension run failed; isolated to that extension
    #[error("Extension {id} failed: {message}")]
    Extension {
        /// Failing extension
        id: u64,
        /// Failure description
        message: String,
    },

    /// Invalid configuration value or file
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (configuration files)
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl TesselError {
    /// Conflict with the given reason
    pub fn conflict(reason: impl Into<String>) -> Self {
        TesselError::Conflict {
            reason: reason.into(),
        }
    }

    /// Abort without an underlying cause
    pub fn aborted(reason: impl Into<String>) -> Self {
        TesselError::Aborted {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Abort caused by another error
    pub fn aborted_by(reason: impl Into<String>, cause: TesselError) -> Self {
        TesselError::Aborted {
            reason: reason.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Protocol violation
    pub fn invalid_state(message: impl Into<String>) -> Self {
        TesselError::InvalidState(message.into())
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        TesselError::Config(message.into())
    }

    /// Whether restarting the unit of work from a fresh snapshot can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TesselError::Conflict { .. })
    }

    /// Whether this is a programming error rather than a runtime outcome
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TesselError::InvalidState(_)
                | TesselError::AlreadyRegistered(_)
                | TesselError::NotRegistered(_)
        )
    }
}

impl From<io::Error> for TesselError {
    fn from(e: io::Error) -> Self {
        TesselError::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display_conflict() {
        let err = TesselError::conflict("object 7 written after snapshot");
        let msg = err.to_string();
        assert!(msg.contains("conflict"));
        assert!(msg.contains("object 7"));
    }

    #[test]
    fn test_error_display_aborted() {
        let err = TesselError::aborted("user requested");
        assert!(err.to_string().contains("Transaction aborted"));
        assert!(err.source().is_none());
    }

    #[test]
    fn test_aborted_carries_cause() {
        let cause = TesselError::Extension {
            id: 3,
            message: "visitor failed".to_string(),
        };
        let err = TesselError::aborted_by("unregistered", cause);
        let source = err.source().expect("cause should be exposed as source");
        assert!(source.to_string().contains("visitor failed"));
    }

    #[test]
    fn test_only_conflict_is_retryable() {
        assert!(TesselError::conflict("x").is_retryable());
        assert!(!TesselError::aborted("x").is_retryable());
        assert!(!TesselError::invalid_state("x").is_retryable());
        assert!(!TesselError::config("x").is_retryable());
    }

    #[test]
    fn test_protocol_violations() {
        assert!(TesselError::AlreadyRegistered(1).is_protocol_violation());
        assert!(TesselError::NotRegistered(1).is_protocol_violation());
        assert!(TesselError::invalid_state("committed twice").is_protocol_violation());
        assert!(!TesselError::conflict("x").is_protocol_violation());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: TesselError = io_err.into();
        assert!(matches!(err, TesselError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
