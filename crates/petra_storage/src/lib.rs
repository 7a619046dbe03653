//! # Petra Storage
//!
//! Page storage layer for petra.
//!
//! This crate provides:
//! - Opaque byte-store backends (in-memory and file-based)
//! - Disk space management (partitions and fixed-size pages)
//! - A buffer manager with pinned page guards and write-back hooks
//!
//! The storage layer does not understand log records or transactions.
//! Higher layers own all format interpretation; this crate only moves
//! bytes and tracks which pages are allocated, cached, and dirty.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod buffer;
mod disk;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use buffer::{BufferManager, FlushHooks, Page, EFFECTIVE_PAGE_SIZE};
pub use disk::{page_index, page_num, part_num, DiskSpaceManager, LOG_PARTITION, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
