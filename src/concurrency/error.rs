//! Locking subsystem errors.

use thiserror::Error;

use super::lock_type::LockType;
use super::resource::ResourceName;
use crate::common::TransactionId;

/// Result type alias for lock operations.
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Errors raised by the lock manager and lock contexts.
///
/// None of these indicate corruption; they are contract violations by the
/// caller, surfaced before any state changes.
#[derive(Debug, Error)]
pub enum LockError {
    /// The transaction already holds a lock on the resource.
    #[error("transaction {trans_num} already holds a {held} lock on '{name}'")]
    DuplicateLockRequest {
        trans_num: TransactionId,
        name: ResourceName,
        held: LockType,
    },

    /// Release or promote with no lock to act on.
    #[error("transaction {trans_num} holds no lock on '{name}'")]
    NoLockHeld {
        trans_num: TransactionId,
        name: ResourceName,
    },

    /// Multigranularity violation: missing parent intention, orphaned
    /// descendants, SIX under SIX, or a non-substitutable promotion.
    #[error("invalid lock request: {reason}")]
    InvalidLock { reason: String },

    /// Mutation attempted on a readonly context.
    #[error("lock context '{name}' is readonly")]
    ReadonlyContext { name: ResourceName },

    /// A bounded wait expired before the lock was granted.
    #[error("transaction {trans_num} timed out waiting for a lock on '{name}'")]
    WaitTimeout {
        trans_num: TransactionId,
        name: ResourceName,
    },
}

impl LockError {
    /// Creates an [`LockError::InvalidLock`] from any displayable reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        LockError::InvalidLock {
            reason: reason.into(),
        }
    }
}
