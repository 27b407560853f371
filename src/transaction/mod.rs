// Transaction handle and lifecycle state machine.
//
// The recovery and locking subsystems are coupled only through this type: a
// transaction number identifies lock ownership, and the status drives what
// restart recovery does with the transaction's log chain.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::TransactionId;
use crate::recovery::RecoveryError;

/// Transaction lifecycle status.
///
/// Transitions are forward-only:
///
/// ```text
/// Running -> {Committing, Aborting, RecoveryAborting} -> Complete
/// ```
///
/// `RecoveryAborting` is entered only during restart, for transactions the
/// log shows as uncommitted. Analysis may also complete a `Running`
/// transaction directly when the only surviving record for it is its END.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Running,
    Committing,
    Aborting,
    RecoveryAborting,
    Complete,
}

impl Status {
    /// Returns true if moving from `from` to `to` is a legal lifecycle step.
    pub fn can_transition(from: Status, to: Status) -> bool {
        use Status::*;
        matches!(
            (from, to),
            (Running, Committing)
                | (Running, Aborting)
                | (Running, RecoveryAborting)
                | (Running, Complete)
                | (Committing, Complete)
                | (Aborting, Complete)
                | (RecoveryAborting, Complete)
        )
    }

    /// Returns true if the transaction can still log new work.
    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Running)
    }

    /// Returns true if no further transitions are possible.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Complete)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Running => "RUNNING",
            Status::Committing => "COMMITTING",
            Status::Aborting => "ABORTING",
            Status::RecoveryAborting => "RECOVERY_ABORTING",
            Status::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

/// A transaction handle.
pub struct Transaction {
    trans_num: TransactionId,
    status: RwLock<Status>,
}

impl Transaction {
    /// Creates a new running transaction.
    pub fn new(trans_num: TransactionId) -> Self {
        Self {
            trans_num,
            status: RwLock::new(Status::Running),
        }
    }

    /// The transaction number.
    pub fn trans_num(&self) -> TransactionId {
        self.trans_num
    }

    /// Current status.
    pub fn status(&self) -> Status {
        *self.status.read()
    }

    /// Moves the transaction to `target`, rejecting illegal transitions.
    pub fn set_status(&self, target: Status) -> Result<(), RecoveryError> {
        let mut status = self.status.write();
        if !Status::can_transition(*status, target) {
            return Err(RecoveryError::InvalidTransition {
                trans_num: self.trans_num,
                from: *status,
                to: target,
            });
        }
        *status = target;
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("trans_num", &self.trans_num)
            .field("status", &self.status())
            .finish()
    }
}
