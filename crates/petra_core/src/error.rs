//! Error types for petra core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in petra core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] petra_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A transaction requested a lock it already holds.
    #[error("duplicate lock request: {message}")]
    DuplicateLockRequest {
        /// Description of the duplicate request.
        message: String,
    },

    /// A transaction operated on a lock it does not hold.
    #[error("no lock held: {message}")]
    NoLockHeld {
        /// Description of the missing lock.
        message: String,
    },

    /// A lock operation would violate locking constraints.
    #[error("invalid lock: {message}")]
    InvalidLock {
        /// Description of the violation.
        message: String,
    },

    /// A lock operation was attempted on a readonly context.
    #[error("readonly context: {message}")]
    ReadOnlyContext {
        /// The context that rejected the operation.
        message: String,
    },

    /// The log is corrupted or invalid.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected in a log record.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The transaction is not known to the recovery manager.
    #[error("unknown transaction: {0}")]
    UnknownTransaction(crate::types::TransactionId),
}

impl CoreError {
    /// Creates a duplicate lock request error.
    pub fn duplicate_lock_request(message: impl Into<String>) -> Self {
        Self::DuplicateLockRequest {
            message: message.into(),
        }
    }

    /// Creates a no lock held error.
    pub fn no_lock_held(message: impl Into<String>) -> Self {
        Self::NoLockHeld {
            message: message.into(),
        }
    }

    /// Creates an invalid lock error.
    pub fn invalid_lock(message: impl Into<String>) -> Self {
        Self::InvalidLock {
            message: message.into(),
        }
    }

    /// Creates a readonly context error.
    pub fn readonly_context(message: impl Into<String>) -> Self {
        Self::ReadOnlyContext {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
