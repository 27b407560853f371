//! Recovery subsystem errors.
//!
//! Forward-processing errors surface to the caller, which aborts the
//! transaction at its own layer. Errors during restart are fatal: startup
//! halts rather than exposing a partially recovered database.

use thiserror::Error;

use crate::common::{Lsn, TransactionId};
use crate::storage::StorageError;
use crate::transaction::Status;

/// Result type alias for recovery operations.
pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;

/// Errors raised by the log manager and recovery manager.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Operation on a transaction with no transaction table entry.
    #[error("transaction {0} has no transaction table entry")]
    UnknownTransaction(TransactionId),

    /// Status change that the lifecycle state machine rejects.
    #[error("transaction {trans_num} cannot move from {from} to {to}")]
    InvalidTransition {
        trans_num: TransactionId,
        from: Status,
        to: Status,
    },

    /// Rollback target that was never registered.
    #[error("savepoint '{name}' does not exist for transaction {trans_num}")]
    SavepointNotFound {
        trans_num: TransactionId,
        name: String,
    },

    /// The log contradicts its own invariants. Fatal.
    #[error("corrupt log: {0}")]
    CorruptLog(String),

    /// A record's prev-LSN does not precede the record itself.
    #[error("record at LSN {lsn} has prev LSN {prev_lsn}")]
    NonMonotonicPrevLsn { lsn: Lsn, prev_lsn: Lsn },

    /// Page or partition state disagreed with the log during replay or
    /// forward processing.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
