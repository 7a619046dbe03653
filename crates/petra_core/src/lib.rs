//! # Petra Core
//!
//! The transactional core of petra, a teaching database engine.
//!
//! Two subsystems do the heavy lifting:
//!
//! - [`concurrency`] - multi-granularity hierarchical locking: a flat
//!   per-resource lock table with FIFO waiter queues, a context tree
//!   enforcing intent-lock discipline (with promotion and escalation),
//!   and a declarative [`ensure_lock_held`] facade
//! - [`recovery`] - ARIES-style crash recovery: write-ahead logging,
//!   per-transaction log chains, dirty page tracking, fuzzy checkpoints,
//!   and a three-phase restart (analysis, redo, undo) with compensation
//!   records
//!
//! [`Database`] owns both plus the storage collaborators, and is the
//! entry point for embedding.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod concurrency;
mod config;
mod database;
mod error;
pub mod recovery;
mod transaction;
mod types;

pub use concurrency::{ensure_lock_held, Lock, LockContext, LockMode, LockTable, ResourceName};
pub use config::Config;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use recovery::{LogManager, LogRecord, LogRecordKind, RecoveryManager};
pub use transaction::{Transaction, TransactionStatus};
pub use types::{Lsn, TransactionId};
