// Durability and atomicity: write-ahead logging and ARIES restart recovery.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`log_record`] | tagged record variants and their undo/redo behavior |
// | [`log_manager`] | append-only record store with a flush watermark |
// | [`manager`] | forward-processing logging, rollback, checkpoints, restart |

pub mod error;
pub mod log_manager;
pub mod log_record;
pub mod manager;

pub use error::{RecoveryError, RecoveryResult};
pub use log_manager::LogManager;
pub use log_record::LogRecord;
pub use manager::{RecoveryManager, RecoveryStats, TransactionFactory};
