// Log records.
//
// One tagged sum covers every event the engine logs: page updates, partition
// and page allocation, transaction status changes, checkpoints, the master
// record, and the compensation (CLR) variants written during rollback.
// Behavior is keyed on the variant tag: `is_undoable`/`is_redoable` classify
// a record, `undo` builds its CLR, and `redo` applies its effect to disk and
// buffer state.
//
// Records do not know their own LSN; the log manager assigns LSNs on append
// and hands back `(lsn, record)` pairs on scans. `prev_lsn` is stored as a
// plain LSN with 0 meaning "start of chain", which is unambiguous because
// LSN 0 is always the master record and never part of a transaction chain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferManager;
use crate::common::{Lsn, PageNum, PartNum, TransactionId, EFFECTIVE_PAGE_SIZE};
use crate::storage::{DiskSpaceManager, StorageError};
use crate::transaction::Status;

use super::error::{RecoveryError, RecoveryResult};
use super::manager::RecoveryManager;

// Fixed byte widths bounding one end-checkpoint record to a page.
const END_CHECKPOINT_HEADER: usize = 17;
const DPT_ENTRY_SIZE: usize = 16;
const TXN_ENTRY_SIZE: usize = 17;

/// A write-ahead log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Always at LSN 0; points at the last installed checkpoint.
    Master { last_checkpoint_lsn: Lsn },

    /// Physiological page update with both images.
    UpdatePage {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// CLR for [`LogRecord::UpdatePage`]; `after` is the restored image.
    UndoUpdatePage {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        offset: u16,
        after: Vec<u8>,
        undo_next_lsn: Lsn,
    },

    AllocPart {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
    },
    UndoAllocPart {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
        undo_next_lsn: Lsn,
    },
    FreePart {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
    },
    UndoFreePart {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
        undo_next_lsn: Lsn,
    },

    AllocPage {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
    },
    UndoAllocPage {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        undo_next_lsn: Lsn,
    },
    FreePage {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
    },
    UndoFreePage {
        trans_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        undo_next_lsn: Lsn,
    },

    CommitTransaction {
        trans_num: TransactionId,
        prev_lsn: Lsn,
    },
    AbortTransaction {
        trans_num: TransactionId,
        prev_lsn: Lsn,
    },
    EndTransaction {
        trans_num: TransactionId,
        prev_lsn: Lsn,
    },

    BeginCheckpoint,
    /// Snapshot of the dirty page table and transaction table, possibly one
    /// of several if the tables do not fit in a single record.
    EndCheckpoint {
        dirty_page_table: BTreeMap<PageNum, Lsn>,
        transaction_table: BTreeMap<TransactionId, (Status, Lsn)>,
    },
}

impl LogRecord {
    /// Transaction this record belongs to, if any.
    pub fn trans_num(&self) -> Option<TransactionId> {
        use LogRecord::*;
        match self {
            UpdatePage { trans_num, .. }
            | UndoUpdatePage { trans_num, .. }
            | AllocPart { trans_num, .. }
            | UndoAllocPart { trans_num, .. }
            | FreePart { trans_num, .. }
            | UndoFreePart { trans_num, .. }
            | AllocPage { trans_num, .. }
            | UndoAllocPage { trans_num, .. }
            | FreePage { trans_num, .. }
            | UndoFreePage { trans_num, .. }
            | CommitTransaction { trans_num, .. }
            | AbortTransaction { trans_num, .. }
            | EndTransaction { trans_num, .. } => Some(*trans_num),
            Master { .. } | BeginCheckpoint | EndCheckpoint { .. } => None,
        }
    }

    /// Previous LSN in this transaction's chain (0 at the start of the
    /// chain), if the record belongs to a transaction.
    pub fn prev_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            UpdatePage { prev_lsn, .. }
            | UndoUpdatePage { prev_lsn, .. }
            | AllocPart { prev_lsn, .. }
            | UndoAllocPart { prev_lsn, .. }
            | FreePart { prev_lsn, .. }
            | UndoFreePart { prev_lsn, .. }
            | AllocPage { prev_lsn, .. }
            | UndoAllocPage { prev_lsn, .. }
            | FreePage { prev_lsn, .. }
            | UndoFreePage { prev_lsn, .. }
            | CommitTransaction { prev_lsn, .. }
            | AbortTransaction { prev_lsn, .. }
            | EndTransaction { prev_lsn, .. } => Some(*prev_lsn),
            Master { .. } | BeginCheckpoint | EndCheckpoint { .. } => None,
        }
    }

    /// Page this record affects, if any.
    pub fn page_num(&self) -> Option<PageNum> {
        use LogRecord::*;
        match self {
            UpdatePage { page_num, .. }
            | UndoUpdatePage { page_num, .. }
            | AllocPage { page_num, .. }
            | UndoAllocPage { page_num, .. }
            | FreePage { page_num, .. }
            | UndoFreePage { page_num, .. } => Some(*page_num),
            _ => None,
        }
    }

    /// Partition this record affects, if any.
    pub fn part_num(&self) -> Option<PartNum> {
        use LogRecord::*;
        match self {
            AllocPart { part_num, .. }
            | UndoAllocPart { part_num, .. }
            | FreePart { part_num, .. }
            | UndoFreePart { part_num, .. } => Some(*part_num),
            _ => None,
        }
    }

    /// For CLRs, the next LSN of this transaction to undo.
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            UndoUpdatePage { undo_next_lsn, .. }
            | UndoAllocPart { undo_next_lsn, .. }
            | UndoFreePart { undo_next_lsn, .. }
            | UndoAllocPage { undo_next_lsn, .. }
            | UndoFreePage { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    /// True for forward operations that must produce a CLR on rollback.
    pub fn is_undoable(&self) -> bool {
        use LogRecord::*;
        matches!(
            self,
            UpdatePage { .. }
                | AllocPart { .. }
                | FreePart { .. }
                | AllocPage { .. }
                | FreePage { .. }
        )
    }

    /// True for records with a concrete effect on a page or partition.
    pub fn is_redoable(&self) -> bool {
        use LogRecord::*;
        matches!(
            self,
            UpdatePage { .. }
                | UndoUpdatePage { .. }
                | AllocPart { .. }
                | UndoAllocPart { .. }
                | FreePart { .. }
                | UndoFreePart { .. }
                | AllocPage { .. }
                | UndoAllocPage { .. }
                | FreePage { .. }
                | UndoFreePage { .. }
        )
    }

    /// Builds the CLR compensating this record. `last_lsn` is the undoing
    /// transaction's current last LSN and becomes the CLR's prev LSN; the
    /// CLR's undo-next LSN is this record's prev LSN. The undo itself is
    /// performed by redoing the returned CLR.
    pub fn undo(&self, last_lsn: Lsn) -> RecoveryResult<LogRecord> {
        use LogRecord::*;
        match self {
            UpdatePage {
                trans_num,
                prev_lsn,
                page_num,
                offset,
                before,
                ..
            } => Ok(UndoUpdatePage {
                trans_num: *trans_num,
                prev_lsn: last_lsn,
                page_num: *page_num,
                offset: *offset,
                after: before.clone(),
                undo_next_lsn: *prev_lsn,
            }),
            AllocPart {
                trans_num,
                prev_lsn,
                part_num,
            } => Ok(UndoAllocPart {
                trans_num: *trans_num,
                prev_lsn: last_lsn,
                part_num: *part_num,
                undo_next_lsn: *prev_lsn,
            }),
            FreePart {
                trans_num,
                prev_lsn,
                part_num,
            } => Ok(UndoFreePart {
                trans_num: *trans_num,
                prev_lsn: last_lsn,
                part_num: *part_num,
                undo_next_lsn: *prev_lsn,
            }),
            AllocPage {
                trans_num,
                prev_lsn,
                page_num,
            } => Ok(UndoAllocPage {
                trans_num: *trans_num,
                prev_lsn: last_lsn,
                page_num: *page_num,
                undo_next_lsn: *prev_lsn,
            }),
            FreePage {
                trans_num,
                prev_lsn,
                page_num,
            } => Ok(UndoFreePage {
                trans_num: *trans_num,
                prev_lsn: last_lsn,
                page_num: *page_num,
                undo_next_lsn: *prev_lsn,
            }),
            other => Err(RecoveryError::CorruptLog(format!(
                "cannot undo a non-undoable record: {other:?}"
            ))),
        }
    }

    /// Applies this record's effect. `lsn` is the record's own LSN, stamped
    /// onto the page for page writes. Allocation state that the log shows as
    /// already applied is left alone, so replay is idempotent.
    pub fn redo(
        &self,
        lsn: Lsn,
        recovery: &RecoveryManager,
        disk: &DiskSpaceManager,
        buffer: &BufferManager,
    ) -> RecoveryResult<()> {
        use LogRecord::*;
        match self {
            UpdatePage {
                page_num,
                offset,
                after,
                ..
            }
            | UndoUpdatePage {
                page_num,
                offset,
                after,
                ..
            } => {
                let guard = buffer.fetch_page(*page_num)?;
                guard.write(*offset as usize, after, lsn)?;
                Ok(())
            }
            AllocPart { part_num, .. } | UndoFreePart { part_num, .. } => {
                match disk.alloc_part_num(*part_num) {
                    Err(StorageError::PartitionExists(_)) | Ok(()) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            FreePart { part_num, .. } | UndoAllocPart { part_num, .. } => {
                match disk.free_part(*part_num) {
                    Err(StorageError::PartitionNotFound(_)) | Ok(()) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            AllocPage { page_num, .. } | UndoFreePage { page_num, .. } => {
                match disk.alloc_page_num(*page_num) {
                    Err(StorageError::PageExists(_)) | Ok(()) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            FreePage { page_num, .. } | UndoAllocPage { page_num, .. } => {
                recovery.forget_page(*page_num);
                buffer.discard_frame(*page_num);
                match disk.free_page(*page_num) {
                    Err(StorageError::PageNotAllocated(_)) | Ok(()) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            other => Err(RecoveryError::CorruptLog(format!(
                "cannot redo a non-redoable record: {other:?}"
            ))),
        }
    }

    /// Serializes the record for the log store.
    pub fn to_bytes(&self) -> RecoveryResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RecoveryError::CorruptLog(format!("record encode failed: {e}")))
    }

    /// Deserializes a record. An unknown tag is a fatal parse error.
    pub fn from_bytes(bytes: &[u8]) -> RecoveryResult<LogRecord> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RecoveryError::CorruptLog(format!("record decode failed: {e}")))?;
        Ok(record)
    }

    /// True if an end-checkpoint record with the given table sizes still
    /// fits within one page.
    pub fn end_checkpoint_fits(dpt_entries: usize, txn_entries: usize) -> bool {
        END_CHECKPOINT_HEADER + DPT_ENTRY_SIZE * dpt_entries + TXN_ENTRY_SIZE * txn_entries
            <= EFFECTIVE_PAGE_SIZE
    }
}
