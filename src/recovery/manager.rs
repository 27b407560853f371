// ARIES recovery manager.
//
// Forward processing appends a record for every mutation before the mutation
// touches a page, maintains the dirty page table and transaction table, and
// rolls transactions back by logging and redoing CLRs. After a crash,
// `restart` rebuilds both tables from the log (analysis), replays every
// effect that may be missing from disk (redo), rolls back every loser
// transaction (undo), and installs a fresh checkpoint.
//
// The dirty page table and transaction table are concurrent maps; the only
// coarse section is a short metadata latch serializing `start_transaction`
// against `checkpoint` so checkpoints see a consistent table snapshot.
// Ordinary page I/O never takes it.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffer::BufferManager;
use crate::common::{part_num, Lsn, PageNum, PartNum, TransactionId, EFFECTIVE_PAGE_SIZE, LOG_PARTITION};
use crate::storage::DiskSpaceManager;
use crate::transaction::{Status, Transaction};

use super::error::{RecoveryError, RecoveryResult};
use super::log_manager::LogManager;
use super::log_record::LogRecord;

/// Factory producing transaction handles for transaction numbers found in
/// the log during restart.
pub type TransactionFactory = Box<dyn Fn(TransactionId) -> Arc<Transaction> + Send + Sync>;

/// Transaction table entry.
pub struct TransactionTableEntry {
    pub transaction: Arc<Transaction>,
    /// LSN of the last record logged for this transaction.
    pub last_lsn: Lsn,
    /// Named rollback points: savepoint name -> last LSN at creation.
    pub savepoints: HashMap<String, Lsn>,
}

impl TransactionTableEntry {
    fn new(transaction: Arc<Transaction>) -> Self {
        Self {
            transaction,
            last_lsn: 0,
            savepoints: HashMap::new(),
        }
    }
}

/// Counters for recovery activity, cumulative over the manager's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_analyzed: u64,
    pub records_redone: u64,
    pub clrs_emitted: u64,
    pub transactions_rolled_back: u64,
    pub checkpoints_taken: u64,
}

#[derive(Default)]
struct StatCounters {
    records_analyzed: AtomicU64,
    records_redone: AtomicU64,
    clrs_emitted: AtomicU64,
    transactions_rolled_back: AtomicU64,
    checkpoints_taken: AtomicU64,
}

/// ARIES-style recovery manager.
pub struct RecoveryManager {
    log: Arc<LogManager>,
    disk: OnceCell<Arc<DiskSpaceManager>>,
    buffer: OnceCell<Arc<BufferManager>>,
    dirty_page_table: DashMap<PageNum, Lsn>,
    transaction_table: DashMap<TransactionId, TransactionTableEntry>,
    new_transaction: TransactionFactory,
    redo_complete: AtomicBool,
    /// Serializes `start_transaction` and `checkpoint`.
    meta_latch: Mutex<()>,
    stats: StatCounters,
}

impl RecoveryManager {
    /// Creates a bare recovery manager. The disk and buffer managers are
    /// wired afterwards with [`RecoveryManager::set_managers`], which breaks
    /// the construction cycle between the buffer pool and this type.
    pub fn new(log: Arc<LogManager>, new_transaction: TransactionFactory) -> Self {
        Self {
            log,
            disk: OnceCell::new(),
            buffer: OnceCell::new(),
            dirty_page_table: DashMap::new(),
            transaction_table: DashMap::new(),
            new_transaction,
            redo_complete: AtomicBool::new(false),
            meta_latch: Mutex::new(()),
            stats: StatCounters::default(),
        }
    }

    /// Wires the disk and buffer managers and installs the buffer hooks that
    /// uphold the write-ahead rule and dirty page accounting.
    pub fn set_managers(self: &Arc<Self>, disk: Arc<DiskSpaceManager>, buffer: Arc<BufferManager>) {
        let _ = self.disk.set(disk);
        let weak = Arc::downgrade(self);
        {
            let weak = weak.clone();
            buffer.set_page_flush_hook(Box::new(move |page_lsn| {
                if let Some(rm) = weak.upgrade() {
                    rm.page_flush_hook(page_lsn);
                }
            }));
        }
        {
            let weak = weak.clone();
            buffer.set_disk_io_hook(Box::new(move |page| {
                if let Some(rm) = weak.upgrade() {
                    rm.disk_io_hook(page);
                }
            }));
        }
        buffer.set_dirty_hook(Box::new(move |page, lsn| {
            if let Some(rm) = weak.upgrade() {
                rm.dirty_page(page, lsn);
            }
        }));
        let _ = self.buffer.set(buffer);
    }

    fn disk(&self) -> &DiskSpaceManager {
        self.disk.get().expect("recovery manager not wired to a disk manager")
    }

    fn buffer(&self) -> &BufferManager {
        self.buffer
            .get()
            .expect("recovery manager not wired to a buffer manager")
    }

    /// Sets up the log of a fresh database: a master record pointing at an
    /// initial checkpoint.
    pub fn initialize(&self) -> RecoveryResult<()> {
        if !self.log.is_empty() {
            return Err(RecoveryError::CorruptLog(
                "initialize called on a non-empty log".to_string(),
            ));
        }
        self.log.append(&LogRecord::Master {
            last_checkpoint_lsn: 0,
        })?;
        self.checkpoint()?;
        Ok(())
    }

    /// Registers a new running transaction.
    pub fn start_transaction(&self, transaction: Arc<Transaction>) {
        let _guard = self.meta_latch.lock();
        self.transaction_table.insert(
            transaction.trans_num(),
            TransactionTableEntry::new(transaction),
        );
    }

    /// Logs a commit and makes it durable. Returns the commit LSN.
    pub fn commit(&self, trans_num: TransactionId) -> RecoveryResult<Lsn> {
        let lsn = {
            let mut entry = self
                .transaction_table
                .get_mut(&trans_num)
                .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
            entry.transaction.set_status(Status::Committing)?;
            let lsn = self.log.append(&LogRecord::CommitTransaction {
                trans_num,
                prev_lsn: entry.last_lsn,
            })?;
            entry.last_lsn = lsn;
            lsn
        };
        self.log.flush_to(lsn);
        Ok(lsn)
    }

    /// Logs an abort. The rollback itself happens in [`RecoveryManager::end`].
    pub fn abort(&self, trans_num: TransactionId) -> RecoveryResult<Lsn> {
        let mut entry = self
            .transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
        entry.transaction.set_status(Status::Aborting)?;
        let lsn = self.log.append(&LogRecord::AbortTransaction {
            trans_num,
            prev_lsn: entry.last_lsn,
        })?;
        entry.last_lsn = lsn;
        Ok(lsn)
    }

    /// Finishes a transaction: rolls back if it was aborting, logs the END,
    /// and drops it from the transaction table. Returns the end LSN.
    pub fn end(&self, trans_num: TransactionId) -> RecoveryResult<Lsn> {
        let status = self
            .transaction_table
            .get(&trans_num)
            .map(|e| e.transaction.status())
            .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
        if status == Status::Aborting {
            self.rollback_to_lsn(trans_num, 0)?;
            self.stats
                .transactions_rolled_back
                .fetch_add(1, Ordering::Relaxed);
        }
        let lsn = {
            let mut entry = self
                .transaction_table
                .get_mut(&trans_num)
                .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
            let lsn = self.log.append(&LogRecord::EndTransaction {
                trans_num,
                prev_lsn: entry.last_lsn,
            })?;
            entry.last_lsn = lsn;
            entry.transaction.set_status(Status::Complete)?;
            lsn
        };
        self.transaction_table.remove(&trans_num);
        Ok(lsn)
    }

    /// Logs a page update before the page itself is touched. Establishes the
    /// page's recLSN if it was clean.
    pub fn log_page_write(
        &self,
        trans_num: TransactionId,
        page: PageNum,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> RecoveryResult<Lsn> {
        assert_eq!(
            before.len(),
            after.len(),
            "update images must have equal length"
        );
        assert!(
            before.len() <= EFFECTIVE_PAGE_SIZE / 2,
            "update image exceeds half a page"
        );
        assert_ne!(
            part_num(page),
            LOG_PARTITION,
            "data writes never target the log partition"
        );
        let lsn = {
            let mut entry = self
                .transaction_table
                .get_mut(&trans_num)
                .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
            let lsn = self.log.append(&LogRecord::UpdatePage {
                trans_num,
                prev_lsn: entry.last_lsn,
                page_num: page,
                offset,
                before: before.to_vec(),
                after: after.to_vec(),
            })?;
            entry.last_lsn = lsn;
            lsn
        };
        self.dirty_page_table.entry(page).or_insert(lsn);
        Ok(lsn)
    }

    /// Logs a partition allocation. Returns `None` for the log partition,
    /// whose pages are not governed by this manager.
    pub fn log_alloc_part(
        &self,
        trans_num: TransactionId,
        part: PartNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed_op(trans_num, |prev_lsn| LogRecord::AllocPart {
            trans_num,
            prev_lsn,
            part_num: part,
        })
        .map(Some)
    }

    /// Logs a partition free. Returns `None` for the log partition.
    pub fn log_free_part(
        &self,
        trans_num: TransactionId,
        part: PartNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed_op(trans_num, |prev_lsn| LogRecord::FreePart {
            trans_num,
            prev_lsn,
            part_num: part,
        })
        .map(Some)
    }

    /// Logs a page allocation. Returns `None` for pages of the log
    /// partition.
    pub fn log_alloc_page(
        &self,
        trans_num: TransactionId,
        page: PageNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part_num(page) == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed_op(trans_num, |prev_lsn| LogRecord::AllocPage {
            trans_num,
            prev_lsn,
            page_num: page,
        })
        .map(Some)
    }

    /// Logs a page free and drops the page from the dirty page table; the
    /// page ceases to exist, so there is nothing left to flush for it.
    pub fn log_free_page(
        &self,
        trans_num: TransactionId,
        page: PageNum,
    ) -> RecoveryResult<Option<Lsn>> {
        if part_num(page) == LOG_PARTITION {
            return Ok(None);
        }
        let lsn = self.log_flushed_op(trans_num, |prev_lsn| LogRecord::FreePage {
            trans_num,
            prev_lsn,
            page_num: page,
        })?;
        self.dirty_page_table.remove(&page);
        Ok(Some(lsn))
    }

    /// Appends a record whose disk effect becomes visible immediately, so
    /// the log must be flushed through it before the caller proceeds.
    fn log_flushed_op(
        &self,
        trans_num: TransactionId,
        make: impl FnOnce(Lsn) -> LogRecord,
    ) -> RecoveryResult<Lsn> {
        let lsn = {
            let mut entry = self
                .transaction_table
                .get_mut(&trans_num)
                .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
            let lsn = self.log.append(&make(entry.last_lsn))?;
            entry.last_lsn = lsn;
            lsn
        };
        self.log.flush_to(lsn);
        Ok(lsn)
    }

    /// Registers a named rollback point at the transaction's current
    /// position in the log.
    pub fn savepoint(&self, trans_num: TransactionId, name: &str) -> RecoveryResult<()> {
        let mut entry = self
            .transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
        let last_lsn = entry.last_lsn;
        entry.savepoints.insert(name.to_string(), last_lsn);
        Ok(())
    }

    /// Deletes a savepoint.
    pub fn release_savepoint(&self, trans_num: TransactionId, name: &str) -> RecoveryResult<()> {
        let mut entry = self
            .transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
        entry
            .savepoints
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RecoveryError::SavepointNotFound {
                trans_num,
                name: name.to_string(),
            })
    }

    /// Undoes everything the transaction logged after the savepoint.
    pub fn rollback_to_savepoint(
        &self,
        trans_num: TransactionId,
        name: &str,
    ) -> RecoveryResult<()> {
        let target = self
            .transaction_table
            .get(&trans_num)
            .ok_or(RecoveryError::UnknownTransaction(trans_num))?
            .savepoints
            .get(name)
            .copied()
            .ok_or_else(|| RecoveryError::SavepointNotFound {
                trans_num,
                name: name.to_string(),
            })?;
        self.rollback_to_lsn(trans_num, target)
    }

    /// Undoes the transaction's records down to (exclusive) `target_lsn`,
    /// appending and redoing a CLR for every undoable record on the way.
    pub fn rollback_to_lsn(&self, trans_num: TransactionId, target_lsn: Lsn) -> RecoveryResult<()> {
        let mut current_last_lsn = self
            .transaction_table
            .get(&trans_num)
            .map(|e| e.last_lsn)
            .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
        if current_last_lsn == 0 {
            return Ok(());
        }
        let last_record = self.log.fetch(current_last_lsn)?;
        // A CLR means part of this chain is already undone; resume where it
        // points instead of undoing the undo.
        let mut cursor = last_record.undo_next_lsn().unwrap_or(current_last_lsn);

        while cursor > target_lsn {
            let record = self.log.fetch(cursor)?;
            if record.is_undoable() {
                let clr = record.undo(current_last_lsn)?;
                let clr_lsn = self.log.append(&clr)?;
                {
                    let mut entry = self
                        .transaction_table
                        .get_mut(&trans_num)
                        .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
                    entry.last_lsn = clr_lsn;
                }
                current_last_lsn = clr_lsn;
                clr.redo(clr_lsn, self, self.disk(), self.buffer())?;
                self.stats.clrs_emitted.fetch_add(1, Ordering::Relaxed);
            }
            cursor = record.prev_lsn().unwrap_or(0);
        }
        Ok(())
    }

    /// Establishes or tightens a page's recLSN. Insertions may race with
    /// out-of-order writers, so an existing entry is corrected downward.
    pub fn dirty_page(&self, page: PageNum, lsn: Lsn) {
        self.dirty_page_table
            .entry(page)
            .and_modify(|rec_lsn| {
                if lsn < *rec_lsn {
                    *rec_lsn = lsn;
                }
            })
            .or_insert(lsn);
    }

    /// Drops a page from the dirty page table when the page itself goes
    /// away.
    pub(crate) fn forget_page(&self, page: PageNum) {
        self.dirty_page_table.remove(&page);
    }

    /// Write-ahead rule: called by the buffer pool before a dirty page is
    /// written out.
    pub fn page_flush_hook(&self, page_lsn: Lsn) {
        self.log.flush_to(page_lsn);
    }

    /// Called by the buffer pool after a page reached disk. Once redo is
    /// over, the page's effects are durable and it leaves the dirty page
    /// table.
    pub fn disk_io_hook(&self, page: PageNum) {
        if self.redo_complete.load(Ordering::SeqCst) {
            self.dirty_page_table.remove(&page);
        }
    }

    /// Takes a checkpoint: BEGIN, as many END records as the tables need,
    /// a log flush, and the master rewrite that installs it.
    pub fn checkpoint(&self) -> RecoveryResult<Lsn> {
        let _guard = self.meta_latch.lock();
        let begin_lsn = self.log.append(&LogRecord::BeginCheckpoint)?;
        debug!(begin_lsn, "checkpoint started");

        let mut dpt = BTreeMap::new();
        let mut txn = BTreeMap::new();

        // The dirty page table is snapshotted first, then the transaction
        // table. Each entry is added only after making sure it fits, so an
        // overflowing record is emitted without consuming the entry.
        let dpt_snapshot: Vec<(PageNum, Lsn)> = self
            .dirty_page_table
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect();
        for (page, rec_lsn) in dpt_snapshot {
            if !LogRecord::end_checkpoint_fits(dpt.len() + 1, txn.len()) {
                self.log.append(&LogRecord::EndCheckpoint {
                    dirty_page_table: std::mem::take(&mut dpt),
                    transaction_table: std::mem::take(&mut txn),
                })?;
            }
            dpt.insert(page, rec_lsn);
        }

        let txn_snapshot: Vec<(TransactionId, Status, Lsn)> = self
            .transaction_table
            .iter()
            .map(|r| (*r.key(), r.value().transaction.status(), r.value().last_lsn))
            .collect();
        for (trans_num, status, last_lsn) in txn_snapshot {
            if !LogRecord::end_checkpoint_fits(dpt.len(), txn.len() + 1) {
                self.log.append(&LogRecord::EndCheckpoint {
                    dirty_page_table: std::mem::take(&mut dpt),
                    transaction_table: std::mem::take(&mut txn),
                })?;
            }
            txn.insert(trans_num, (status, last_lsn));
        }

        let end_lsn = self.log.append(&LogRecord::EndCheckpoint {
            dirty_page_table: dpt,
            transaction_table: txn,
        })?;
        self.log.flush_to(end_lsn);
        // The master rewrite is the atomic "checkpoint installed" event; a
        // crash before this line falls back to the previous checkpoint.
        self.log.rewrite_master_record(&LogRecord::Master {
            last_checkpoint_lsn: begin_lsn,
        })?;
        self.stats.checkpoints_taken.fetch_add(1, Ordering::Relaxed);
        debug!(begin_lsn, end_lsn, "checkpoint installed");
        Ok(begin_lsn)
    }

    /// Restart recovery: analysis, redo, dirty page table cleanup, undo,
    /// and a final checkpoint. New transactions may start only after this
    /// returns.
    pub fn restart(&self) -> RecoveryResult<()> {
        info!("restart recovery started");
        self.restart_analysis()?;
        self.restart_redo()?;
        self.redo_complete.store(true, Ordering::SeqCst);
        self.clean_dirty_page_table();
        self.restart_undo()?;
        self.checkpoint()?;
        info!("restart recovery finished");
        Ok(())
    }

    /// Analysis: scan forward from the last installed checkpoint, rebuilding
    /// the transaction table and dirty page table.
    fn restart_analysis(&self) -> RecoveryResult<()> {
        let checkpoint_lsn = match self.log.fetch(0)? {
            LogRecord::Master {
                last_checkpoint_lsn,
            } => last_checkpoint_lsn,
            other => {
                return Err(RecoveryError::CorruptLog(format!(
                    "LSN 0 holds {other:?} instead of the master record"
                )))
            }
        };
        debug!(checkpoint_lsn, "analysis scanning from last checkpoint");

        let mut ended: HashSet<TransactionId> = HashSet::new();
        for (lsn, record) in self.log.scan_from(checkpoint_lsn)? {
            self.stats.records_analyzed.fetch_add(1, Ordering::Relaxed);

            if let Some(trans_num) = record.trans_num() {
                self.ensure_table_entry(trans_num);
                if let Some(mut entry) = self.transaction_table.get_mut(&trans_num) {
                    entry.last_lsn = lsn;
                }
            }

            match &record {
                LogRecord::UpdatePage { page_num, .. }
                | LogRecord::UndoUpdatePage { page_num, .. } => {
                    self.dirty_page(*page_num, lsn);
                }
                LogRecord::FreePage { page_num, .. }
                | LogRecord::UndoAllocPage { page_num, .. } => {
                    self.dirty_page_table.remove(page_num);
                }
                LogRecord::CommitTransaction { trans_num, .. } => {
                    self.with_entry(*trans_num, |e| e.transaction.set_status(Status::Committing))??;
                }
                LogRecord::AbortTransaction { trans_num, .. } => {
                    self.with_entry(*trans_num, |e| {
                        e.transaction.set_status(Status::RecoveryAborting)
                    })??;
                }
                LogRecord::EndTransaction { trans_num, .. } => {
                    self.with_entry(*trans_num, |e| e.transaction.set_status(Status::Complete))??;
                    self.transaction_table.remove(trans_num);
                    ended.insert(*trans_num);
                }
                LogRecord::EndCheckpoint {
                    dirty_page_table,
                    transaction_table,
                } => {
                    self.merge_checkpoint(dirty_page_table, transaction_table, &ended)?;
                }
                _ => {}
            }
        }

        // Everything still in the table either finished committing and only
        // lost its END, or never got a verdict and must be rolled back.
        let trans_nums: Vec<TransactionId> =
            self.transaction_table.iter().map(|r| *r.key()).collect();
        for trans_num in trans_nums {
            let status = match self.transaction_table.get(&trans_num) {
                Some(e) => e.transaction.status(),
                None => continue,
            };
            match status {
                Status::Committing => {
                    {
                        let mut entry = self
                            .transaction_table
                            .get_mut(&trans_num)
                            .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
                        let lsn = self.log.append(&LogRecord::EndTransaction {
                            trans_num,
                            prev_lsn: entry.last_lsn,
                        })?;
                        entry.last_lsn = lsn;
                        entry.transaction.set_status(Status::Complete)?;
                    }
                    self.transaction_table.remove(&trans_num);
                }
                Status::Running => {
                    let mut entry = self
                        .transaction_table
                        .get_mut(&trans_num)
                        .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
                    entry.transaction.set_status(Status::RecoveryAborting)?;
                    let lsn = self.log.append(&LogRecord::AbortTransaction {
                        trans_num,
                        prev_lsn: entry.last_lsn,
                    })?;
                    entry.last_lsn = lsn;
                }
                _ => {}
            }
        }
        debug!(
            transactions = self.transaction_table.len(),
            dirty_pages = self.dirty_page_table.len(),
            "analysis finished"
        );
        Ok(())
    }

    /// Folds one end-checkpoint record into the live tables.
    fn merge_checkpoint(
        &self,
        dpt: &BTreeMap<PageNum, Lsn>,
        txn: &BTreeMap<TransactionId, (Status, Lsn)>,
        ended: &HashSet<TransactionId>,
    ) -> RecoveryResult<()> {
        // The checkpoint's recLSN predates anything the scan derived.
        for (&page, &rec_lsn) in dpt {
            self.dirty_page_table.insert(page, rec_lsn);
        }
        for (&trans_num, &(status, ckpt_last_lsn)) in txn {
            if ended.contains(&trans_num) || status == Status::Complete {
                continue;
            }
            self.ensure_table_entry(trans_num);
            let mut entry = self
                .transaction_table
                .get_mut(&trans_num)
                .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
            if ckpt_last_lsn > entry.last_lsn {
                entry.last_lsn = ckpt_last_lsn;
            }
            // An aborting transaction found at restart becomes a recovery
            // abort; other statuses apply as-is when they are a legal
            // promotion of what the scan derived.
            let target = if status == Status::Aborting {
                Status::RecoveryAborting
            } else {
                status
            };
            let current = entry.transaction.status();
            if Status::can_transition(current, target) {
                entry.transaction.set_status(target)?;
            }
        }
        Ok(())
    }

    /// Redo: replay every effect that might not have reached disk, starting
    /// from the earliest recLSN.
    fn restart_redo(&self) -> RecoveryResult<()> {
        let start_lsn = self
            .dirty_page_table
            .iter()
            .map(|r| *r.value())
            .min()
            .unwrap_or(0);
        debug!(start_lsn, "redo scanning forward");

        for (lsn, record) in self.log.scan_from(start_lsn)? {
            if !record.is_redoable() {
                continue;
            }
            let replay = match &record {
                // Partition changes and page allocations are always
                // replayed; their state is idempotent to reapply.
                LogRecord::AllocPart { .. }
                | LogRecord::UndoAllocPart { .. }
                | LogRecord::FreePart { .. }
                | LogRecord::UndoFreePart { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::UndoFreePage { .. } => true,
                // Page modifications replay only onto pages that might be
                // stale: present in the DPT, past their recLSN, and with an
                // on-page LSN older than the record.
                LogRecord::UpdatePage { page_num, .. }
                | LogRecord::UndoUpdatePage { page_num, .. }
                | LogRecord::FreePage { page_num, .. }
                | LogRecord::UndoAllocPage { page_num, .. } => {
                    let rec_lsn = self.dirty_page_table.get(page_num).map(|r| *r.value());
                    match rec_lsn {
                        Some(rec_lsn) if lsn >= rec_lsn => {
                            let guard = self.buffer().fetch_page(*page_num)?;
                            guard.page_lsn() < lsn
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            if replay {
                record.redo(lsn, self, self.disk(), self.buffer())?;
                self.stats.records_redone.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Drops dirty page table entries for pages the buffer pool no longer
    /// considers dirty. Runs once, between redo and undo.
    fn clean_dirty_page_table(&self) {
        let dirty: HashSet<PageNum> = self.buffer().dirty_page_nums().into_iter().collect();
        self.dirty_page_table.retain(|page, _| dirty.contains(page));
    }

    /// Undo: roll back every recovery-aborting transaction, highest LSN
    /// first across all of them.
    fn restart_undo(&self) -> RecoveryResult<()> {
        let mut heap: BinaryHeap<(Lsn, TransactionId)> = self
            .transaction_table
            .iter()
            .filter(|r| r.value().transaction.status() == Status::RecoveryAborting)
            .map(|r| (r.value().last_lsn, *r.key()))
            .collect();
        debug!(losers = heap.len(), "undo rolling back loser transactions");

        while let Some((lsn, trans_num)) = heap.pop() {
            let record = self.log.fetch(lsn)?;
            let next = if record.is_undoable() {
                let last_lsn = self
                    .transaction_table
                    .get(&trans_num)
                    .map(|e| e.last_lsn)
                    .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
                let clr = record.undo(last_lsn)?;
                let undo_next = clr.undo_next_lsn().ok_or_else(|| {
                    RecoveryError::CorruptLog(format!(
                        "CLR for transaction {trans_num} carries no undo-next LSN"
                    ))
                })?;
                let clr_lsn = self.log.append(&clr)?;
                {
                    let mut entry = self
                        .transaction_table
                        .get_mut(&trans_num)
                        .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
                    entry.last_lsn = clr_lsn;
                }
                clr.redo(clr_lsn, self, self.disk(), self.buffer())?;
                self.stats.clrs_emitted.fetch_add(1, Ordering::Relaxed);
                undo_next
            } else {
                match record.undo_next_lsn() {
                    Some(undo_next) => undo_next,
                    None => record.prev_lsn().ok_or_else(|| {
                        RecoveryError::CorruptLog(format!(
                            "record at LSN {lsn} has no prev LSN to follow during undo"
                        ))
                    })?,
                }
            };

            if next == 0 {
                {
                    let mut entry = self
                        .transaction_table
                        .get_mut(&trans_num)
                        .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
                    entry.transaction.set_status(Status::Complete)?;
                    let end_lsn = self.log.append(&LogRecord::EndTransaction {
                        trans_num,
                        prev_lsn: entry.last_lsn,
                    })?;
                    entry.last_lsn = end_lsn;
                }
                self.transaction_table.remove(&trans_num);
                self.stats
                    .transactions_rolled_back
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                heap.push((next, trans_num));
            }
        }
        Ok(())
    }

    /// Snapshot of the dirty page table.
    pub fn dirty_page_table(&self) -> BTreeMap<PageNum, Lsn> {
        self.dirty_page_table
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect()
    }

    /// Snapshot of the transaction table as (status, last LSN) pairs.
    pub fn transaction_table(&self) -> BTreeMap<TransactionId, (Status, Lsn)> {
        self.transaction_table
            .iter()
            .map(|r| (*r.key(), (r.value().transaction.status(), r.value().last_lsn)))
            .collect()
    }

    /// Activity counters.
    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            records_analyzed: self.stats.records_analyzed.load(Ordering::Relaxed),
            records_redone: self.stats.records_redone.load(Ordering::Relaxed),
            clrs_emitted: self.stats.clrs_emitted.load(Ordering::Relaxed),
            transactions_rolled_back: self.stats.transactions_rolled_back.load(Ordering::Relaxed),
            checkpoints_taken: self.stats.checkpoints_taken.load(Ordering::Relaxed),
        }
    }

    fn ensure_table_entry(&self, trans_num: TransactionId) {
        self.transaction_table
            .entry(trans_num)
            .or_insert_with(|| TransactionTableEntry::new((self.new_transaction)(trans_num)));
    }

    fn with_entry<R>(
        &self,
        trans_num: TransactionId,
        f: impl FnOnce(&mut TransactionTableEntry) -> R,
    ) -> RecoveryResult<R> {
        let mut entry = self
            .transaction_table
            .get_mut(&trans_num)
            .ok_or(RecoveryError::UnknownTransaction(trans_num))?;
        Ok(f(&mut entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::common::page_num;

    struct Harness {
        disk: Arc<DiskSpaceManager>,
        buffer: Arc<BufferManager>,
        log: Arc<LogManager>,
        recovery: Arc<RecoveryManager>,
    }

    fn harness() -> Harness {
        let disk = Arc::new(DiskSpaceManager::new());
        let buffer = Arc::new(BufferManager::new(disk.clone(), BufferConfig::default()));
        let log = Arc::new(LogManager::new());
        let recovery = Arc::new(RecoveryManager::new(
            log.clone(),
            Box::new(|n| Arc::new(Transaction::new(n))),
        ));
        recovery.set_managers(disk.clone(), buffer.clone());
        recovery.initialize().unwrap();
        Harness {
            disk,
            buffer,
            log,
            recovery,
        }
    }

    fn begin(h: &Harness, trans_num: TransactionId) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(trans_num));
        h.recovery.start_transaction(txn.clone());
        txn
    }

    /// Logs an update and applies it to the buffered page, the way forward
    /// processing does.
    fn write(h: &Harness, trans_num: TransactionId, page: PageNum, offset: u16, before: &[u8], after: &[u8]) -> Lsn {
        let lsn = h
            .recovery
            .log_page_write(trans_num, page, offset, before, after)
            .unwrap();
        let guard = h.buffer.fetch_page(page).unwrap();
        guard.write(offset as usize, after, lsn).unwrap();
        lsn
    }

    fn alloc_page(h: &Harness, trans_num: TransactionId, part: PartNum, index: u32) -> PageNum {
        let page = page_num(part, index);
        h.recovery.log_alloc_page(trans_num, page).unwrap();
        h.disk.alloc_page_num(page).unwrap();
        page
    }

    fn alloc_part(h: &Harness, trans_num: TransactionId, part: PartNum) {
        h.recovery.log_alloc_part(trans_num, part).unwrap();
        h.disk.alloc_part_num(part).unwrap();
    }

    #[test]
    fn test_initialize_installs_first_checkpoint() {
        let h = harness();
        assert_eq!(
            h.log.fetch(0).unwrap(),
            LogRecord::Master {
                last_checkpoint_lsn: 1
            }
        );
        assert_eq!(h.log.fetch(1).unwrap(), LogRecord::BeginCheckpoint);
        assert!(matches!(
            h.log.fetch(2).unwrap(),
            LogRecord::EndCheckpoint { .. }
        ));
        assert_eq!(h.log.flushed_lsn(), 2);
    }

    #[test]
    fn test_commit_flushes_abort_does_not() {
        let h = harness();
        begin(&h, 1);
        alloc_part(&h, 1, 1);
        let page = alloc_page(&h, 1, 1, 0);
        write(&h, 1, page, 0, b"aa", b"bb");
        let flushed_before = h.log.flushed_lsn();
        let commit_lsn = h.recovery.commit(1).unwrap();
        assert!(commit_lsn > flushed_before);
        assert_eq!(h.log.flushed_lsn(), commit_lsn);

        begin(&h, 2);
        let lsn = write(&h, 2, page, 10, b"cc", b"dd");
        let abort_lsn = h.recovery.abort(2).unwrap();
        assert_eq!(abort_lsn, lsn + 1);
        assert!(h.log.flushed_lsn() < abort_lsn);
    }

    #[test]
    fn test_update_tracks_dpt_and_last_lsn() {
        let h = harness();
        begin(&h, 1);
        alloc_part(&h, 1, 1);
        let page = alloc_page(&h, 1, 1, 0);
        let lsn1 = write(&h, 1, page, 0, b"xx", b"yy");
        let lsn2 = write(&h, 1, page, 4, b"xx", b"zz");
        // recLSN stays at the first update.
        assert_eq!(h.recovery.dirty_page_table().get(&page), Some(&lsn1));
        assert_eq!(h.recovery.transaction_table().get(&1).unwrap().1, lsn2);
    }

    #[test]
    fn test_free_page_drops_dpt_entry_and_flushes() {
        let h = harness();
        begin(&h, 1);
        alloc_part(&h, 1, 1);
        let page = alloc_page(&h, 1, 1, 0);
        write(&h, 1, page, 0, b"aa", b"bb");
        assert!(h.recovery.dirty_page_table().contains_key(&page));

        h.buffer.discard_frame(page);
        let lsn = h.recovery.log_free_page(1, page).unwrap().unwrap();
        h.disk.free_page(page).unwrap();
        assert!(!h.recovery.dirty_page_table().contains_key(&page));
        assert_eq!(h.log.flushed_lsn(), lsn);
    }

    #[test]
    fn test_log_partition_operations_are_sentinel() {
        let h = harness();
        begin(&h, 1);
        assert_eq!(h.recovery.log_alloc_part(1, LOG_PARTITION).unwrap(), None);
        assert_eq!(
            h.recovery.log_alloc_page(1, page_num(LOG_PARTITION, 3)).unwrap(),
            None
        );
        assert_eq!(
            h.recovery.log_free_page(1, page_num(LOG_PARTITION, 3)).unwrap(),
            None
        );
        // Nothing was logged for any of them.
        assert_eq!(h.recovery.transaction_table().get(&1).unwrap().1, 0);
    }

    #[test]
    fn test_unknown_transaction_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.recovery.commit(99),
            Err(RecoveryError::UnknownTransaction(99))
        ));
        assert!(matches!(
            h.recovery.log_page_write(99, page_num(1, 0), 0, b"a", b"b"),
            Err(RecoveryError::UnknownTransaction(99))
        ));
    }

    #[test]
    fn test_dirty_page_min_corrects_races() {
        let h = harness();
        h.recovery.dirty_page(7, 100);
        h.recovery.dirty_page(7, 90);
        h.recovery.dirty_page(7, 95);
        assert_eq!(h.recovery.dirty_page_table().get(&7), Some(&90));
    }

    #[test]
    fn test_rollback_to_savepoint_undoes_suffix() {
        let h = harness();
        let txn = begin(&h, 4);
        alloc_part(&h, 4, 1);
        let page = alloc_page(&h, 4, 1, 0);

        let lsn1 = write(&h, 4, page, 0, b"A1", b"B1");
        h.recovery.savepoint(4, "sp").unwrap();
        write(&h, 4, page, 10, b"A2", b"B2");
        write(&h, 4, page, 20, b"A3", b"B3");
        let log_len = h.log.len();

        h.recovery.rollback_to_savepoint(4, "sp").unwrap();

        // Two CLRs, newest first, and nothing else.
        assert_eq!(h.log.len(), log_len + 2);
        let clr1 = h.log.fetch(log_len as Lsn).unwrap();
        let clr2 = h.log.fetch(log_len as Lsn + 1).unwrap();
        assert!(matches!(clr1, LogRecord::UndoUpdatePage { offset: 20, .. }));
        assert!(matches!(clr2, LogRecord::UndoUpdatePage { offset: 10, .. }));
        assert_eq!(clr2.undo_next_lsn(), Some(lsn1));

        // The transaction keeps running, with last LSN on the newest CLR.
        assert_eq!(txn.status(), Status::Running);
        assert_eq!(
            h.recovery.transaction_table().get(&4).unwrap().1,
            log_len as Lsn + 1
        );

        // The page shows the before-images of the undone writes and the
        // surviving first write.
        let guard = h.buffer.fetch_page(page).unwrap();
        let mut buf = [0u8; 2];
        guard.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"B1");
        guard.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"A2");
        guard.read(20, &mut buf).unwrap();
        assert_eq!(&buf, b"A3");
    }

    #[test]
    fn test_release_savepoint() {
        let h = harness();
        begin(&h, 1);
        h.recovery.savepoint(1, "sp").unwrap();
        h.recovery.release_savepoint(1, "sp").unwrap();
        assert!(matches!(
            h.recovery.rollback_to_savepoint(1, "sp"),
            Err(RecoveryError::SavepointNotFound { .. })
        ));
    }

    #[test]
    fn test_abort_then_end_restores_all_images() {
        let h = harness();
        let txn = begin(&h, 2);
        alloc_part(&h, 2, 1);
        let page = alloc_page(&h, 2, 1, 0);
        write(&h, 2, page, 0, b"\0\0", b"vv");
        write(&h, 2, page, 4, b"\0\0", b"ww");

        h.recovery.abort(2).unwrap();
        h.recovery.end(2).unwrap();

        assert_eq!(txn.status(), Status::Complete);
        assert!(h.recovery.transaction_table().get(&2).is_none());
        let guard = h.buffer.fetch_page(page).unwrap();
        let mut buf = [0u8; 2];
        guard.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0");
        guard.read(4, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0");
        // Chain ends with the END record.
        let end = h.log.fetch(h.log.len() as Lsn - 1).unwrap();
        assert!(matches!(end, LogRecord::EndTransaction { trans_num: 2, .. }));
    }

    #[test]
    fn test_checkpoint_splits_oversized_tables() {
        let h = harness();
        for page in 0..300u64 {
            h.recovery.dirty_page(page_num(1, page as u32), page + 10);
        }
        let begin_lsn = h.recovery.checkpoint().unwrap();
        let records = h.log.scan_from(begin_lsn).unwrap();
        assert!(matches!(records[0].1, LogRecord::BeginCheckpoint));

        let mut seen = BTreeMap::new();
        let mut end_records = 0;
        for (_, record) in &records[1..] {
            if let LogRecord::EndCheckpoint {
                dirty_page_table, ..
            } = record
            {
                end_records += 1;
                for (&page, &rec_lsn) in dirty_page_table {
                    seen.insert(page, rec_lsn);
                }
            }
        }
        // 300 entries cannot fit one record, and none may be lost.
        assert!(end_records >= 2, "expected a split checkpoint");
        assert_eq!(seen.len(), 300);
        assert_eq!(
            h.log.fetch(0).unwrap(),
            LogRecord::Master {
                last_checkpoint_lsn: begin_lsn
            }
        );
    }
}
