//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to write beyond the end of storage.
    #[error("write beyond end of storage: offset {offset}, len {len}, size {size}")]
    WritePastEnd {
        /// The requested write offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The partition is already allocated.
    #[error("partition {0} is already allocated")]
    PartitionExists(u32),

    /// The partition is not allocated.
    #[error("partition {0} is not allocated")]
    PartitionMissing(u32),

    /// The page is already allocated.
    #[error("page {0:#x} is already allocated")]
    PageExists(u64),

    /// The page is not allocated.
    #[error("page {0:#x} is not allocated")]
    PageMissing(u64),

    /// A page access fell outside the page bounds.
    #[error("page access out of bounds: offset {offset}, len {len}, page size {page_size}")]
    OutOfBounds {
        /// The requested offset within the page.
        offset: usize,
        /// The requested length.
        len: usize,
        /// The usable page size.
        page_size: usize,
    },

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
