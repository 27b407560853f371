// FerroDB engine core.
//
// The recoverable, concurrency-controlled heart of a small relational
// storage engine: an ARIES-style recovery manager (write-ahead logging,
// checkpoints, analysis/redo/undo restart) and a hierarchical
// multigranularity lock manager, coupled only through the transaction
// abstraction. The SQL surface, catalog, and B+ trees live elsewhere; the
// disk and buffer layers here are the minimal collaborators the core needs.
//
// # Wiring
//
// The buffer pool and recovery manager reference each other, so the
// recovery manager is built bare and wired afterwards:
//
// ```rust
// use std::sync::Arc;
// use ferrodb::buffer::{BufferConfig, BufferManager};
// use ferrodb::recovery::{LogManager, RecoveryManager};
// use ferrodb::storage::DiskSpaceManager;
// use ferrodb::transaction::Transaction;
//
// let disk = Arc::new(DiskSpaceManager::new());
// let buffer = Arc::new(BufferManager::new(disk.clone(), BufferConfig::default()));
// let log = Arc::new(LogManager::new());
// let recovery = Arc::new(RecoveryManager::new(
//     log.clone(),
//     Box::new(|n| Arc::new(Transaction::new(n))),
// ));
// recovery.set_managers(disk.clone(), buffer.clone());
// recovery.initialize().expect("fresh database");
// ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod error;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use error::{DbError, Result};
