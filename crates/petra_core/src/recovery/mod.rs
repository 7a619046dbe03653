//! Write-ahead logging and crash recovery.
//!
//! The log is the source of truth: every change is described by a
//! [`LogRecord`] appended through the [`LogManager`] before it may reach
//! disk. The [`RecoveryManager`] maintains the transaction table and the
//! dirty page table during normal forward processing, takes fuzzy
//! checkpoints, and rebuilds a consistent state after a crash with the
//! classic three passes: analysis, redo, undo.
//!
//! Undo never rewrites history. Rolling back a change appends a
//! *compensation record* describing the reversal, whose `undo_next_lsn`
//! points past the compensated record, so a rollback interrupted by
//! another crash resumes exactly where it stopped.

mod log;
mod manager;
mod record;

pub use self::log::{LogManager, LogScan};
pub use manager::{RecoveryManager, TransactionFactory};
pub use record::{compute_crc32, LogRecord, LogRecordKind, MAX_PAYLOAD_SIZE};
