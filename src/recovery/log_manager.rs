// Log manager.
//
// A thin append-only record store. Records are held serialized; LSNs are
// dense indexes into the store, so the record appended at position n has
// LSN n and the master record always sits at LSN 0. Appends are serialized
// internally, which is what makes LSNs monotonic without any caller-side
// locking.
//
// Durability is modeled with a flush watermark: `flush_to(lsn)` marks the
// prefix through `lsn` durable, and `discard_unflushed` (crash simulation)
// drops everything past the watermark.

use parking_lot::Mutex;

use crate::common::Lsn;

use super::error::{RecoveryError, RecoveryResult};
use super::log_record::LogRecord;

#[derive(Default)]
struct LogState {
    /// Serialized records, indexed by LSN.
    records: Vec<Vec<u8>>,
    /// Number of records known durable (a prefix length).
    flushed: usize,
}

/// Append-only record store with a flush watermark.
pub struct LogManager {
    state: Mutex<LogState>,
}

impl LogManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
        }
    }

    /// Appends a record and returns its LSN.
    pub fn append(&self, record: &LogRecord) -> RecoveryResult<Lsn> {
        let bytes = record.to_bytes()?;
        let mut state = self.state.lock();
        let lsn = state.records.len() as Lsn;
        if let Some(prev_lsn) = record.prev_lsn() {
            if prev_lsn >= lsn && lsn > 0 {
                return Err(RecoveryError::NonMonotonicPrevLsn { lsn, prev_lsn });
            }
        }
        state.records.push(bytes);
        Ok(lsn)
    }

    /// Marks the log durable through `lsn`.
    pub fn flush_to(&self, lsn: Lsn) {
        let mut state = self.state.lock();
        let count = (lsn as usize + 1).min(state.records.len());
        if count > state.flushed {
            state.flushed = count;
        }
    }

    /// Highest LSN known durable (0 for an empty log).
    pub fn flushed_lsn(&self) -> Lsn {
        let state = self.state.lock();
        state.flushed.saturating_sub(1) as Lsn
    }

    /// Fetches the record at `lsn`.
    pub fn fetch(&self, lsn: Lsn) -> RecoveryResult<LogRecord> {
        let state = self.state.lock();
        let bytes = state
            .records
            .get(lsn as usize)
            .ok_or_else(|| RecoveryError::CorruptLog(format!("no record at LSN {lsn}")))?;
        LogRecord::from_bytes(bytes)
    }

    /// All records from `lsn` onward, paired with their LSNs.
    pub fn scan_from(&self, lsn: Lsn) -> RecoveryResult<Vec<(Lsn, LogRecord)>> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (i, bytes) in state.records.iter().enumerate().skip(lsn as usize) {
            out.push((i as Lsn, LogRecord::from_bytes(bytes)?));
        }
        Ok(out)
    }

    /// Replaces the master record at LSN 0 in place.
    pub fn rewrite_master_record(&self, record: &LogRecord) -> RecoveryResult<()> {
        if !matches!(record, LogRecord::Master { .. }) {
            return Err(RecoveryError::CorruptLog(
                "LSN 0 only holds master records".to_string(),
            ));
        }
        let bytes = record.to_bytes()?;
        let mut state = self.state.lock();
        if state.records.is_empty() {
            state.records.push(bytes);
            state.flushed = 1;
        } else {
            state.records[0] = bytes;
        }
        Ok(())
    }

    /// Number of records in the log.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every record past the flush watermark, simulating the loss of
    /// buffered log pages in a crash.
    pub fn discard_unflushed(&self) {
        let mut state = self.state.lock();
        let flushed = state.flushed;
        state.records.truncate(flushed);
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}
