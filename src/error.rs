//! Crate-level error type.
//!
//! Each subsystem defines its own structured error enum; this module folds
//! them into a single [`DbError`] so callers holding the wired engine can use
//! one `Result` type across lock acquisition, logging, and page I/O.

use thiserror::Error;

use crate::concurrency::LockError;
use crate::recovery::RecoveryError;
use crate::storage::StorageError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Top-level error for the storage engine core.
#[derive(Debug, Error)]
pub enum DbError {
    /// Locking subsystem failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Recovery / logging subsystem failure.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// Disk or buffer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DbError {
    /// Returns true if retrying the operation later may succeed.
    ///
    /// Only bounded lock waits are transient; everything else reflects a
    /// caller error or corrupt state.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Lock(LockError::WaitTimeout { .. }))
    }
}
