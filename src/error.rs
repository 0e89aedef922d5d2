//! Error types for tablecache.

use thiserror::Error;

/// Result type alias for tablecache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations.
///
/// Cloneable so that a failed definition load can be reported to every
/// caller that was blocked on the same slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Table metadata could not be loaded or parsed.
    #[error("Cannot load definition of {table}: {reason}")]
    Decode { table: String, reason: String },

    /// The storage engine failed to open a new handle.
    #[error("Cannot open {table}: {reason}")]
    Open { table: String, reason: String },

    /// Allocation failure reported by a collaborator.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Timed out waiting for a flushed definition to go away.
    #[error("Lock wait timeout exceeded waiting for flush of {0}")]
    LockWaitTimeout(String),

    /// Chosen as deadlock victim while waiting for a flush.
    #[error("Deadlock found when waiting for flush of {0}")]
    Deadlock(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a decode error for the given table.
    pub fn decode<T: ToString, S: Into<String>>(table: T, reason: S) -> Self {
        Error::Decode {
            table: table.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an open error for the given table.
    pub fn open<T: ToString, S: Into<String>>(table: T, reason: S) -> Self {
        Error::Open {
            table: table.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error came out of a lock wait (deadlock or timeout).
    ///
    /// The caller is expected to abort the enclosing statement.
    pub fn is_lock_wait_failure(&self) -> bool {
        matches!(self, Error::LockWaitTimeout(_) | Error::Deadlock(_))
    }

    /// Check if this error means the table cannot be opened.
    pub fn is_table_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Decode { .. } | Error::Open { .. } | Error::OutOfMemory(_)
        )
    }
}
