//! Log record types, serialization, and redo/undo semantics.

use crate::error::{CoreError, CoreResult};
use crate::transaction::TransactionStatus;
use crate::types::{Lsn, TransactionId};
use petra_storage::{BufferManager, DiskSpaceManager, StorageError, EFFECTIVE_PAGE_SIZE};

/// Maximum payload size of a single log record.
///
/// Update records carry a before and an after image, so bounding the
/// payload at half the usable page size bounds both images by it too.
pub const MAX_PAYLOAD_SIZE: usize = EFFECTIVE_PAGE_SIZE / 2;

/// Type tag of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordKind {
    /// The master record at LSN 0.
    Master = 1,
    /// Start of a fuzzy checkpoint.
    BeginCheckpoint = 2,
    /// Checkpoint payload: dirty page table and transaction table entries.
    EndCheckpoint = 3,
    /// A transaction started committing.
    Commit = 4,
    /// A transaction started aborting.
    Abort = 5,
    /// A transaction finished.
    End = 6,
    /// Bytes on a page changed.
    UpdatePage = 7,
    /// Compensation for an update.
    UndoUpdatePage = 8,
    /// A page was allocated.
    AllocPage = 9,
    /// Compensation for a page allocation.
    UndoAllocPage = 10,
    /// A page was freed.
    FreePage = 11,
    /// Compensation for a page free.
    UndoFreePage = 12,
    /// A partition was allocated.
    AllocPart = 13,
    /// Compensation for a partition allocation.
    UndoAllocPart = 14,
    /// A partition was freed.
    FreePart = 15,
    /// Compensation for a partition free.
    UndoFreePart = 16,
}

impl LogRecordKind {
    /// Converts a byte to a record kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Master),
            2 => Some(Self::BeginCheckpoint),
            3 => Some(Self::EndCheckpoint),
            4 => Some(Self::Commit),
            5 => Some(Self::Abort),
            6 => Some(Self::End),
            7 => Some(Self::UpdatePage),
            8 => Some(Self::UndoUpdatePage),
            9 => Some(Self::AllocPage),
            10 => Some(Self::UndoAllocPage),
            11 => Some(Self::FreePage),
            12 => Some(Self::UndoFreePage),
            13 => Some(Self::AllocPart),
            14 => Some(Self::UndoAllocPart),
            15 => Some(Self::FreePart),
            16 => Some(Self::UndoFreePart),
            _ => None,
        }
    }

    /// Converts the record kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A log record.
///
/// Records of one transaction are threaded through `prev_lsn`; compensation
/// records additionally carry `undo_next_lsn`, pointing at the next record
/// to undo (the `prev_lsn` of the record they compensate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// The master record: where analysis starts reading.
    Master {
        /// LSN of the begin record of the last completed checkpoint.
        last_checkpoint_lsn: Lsn,
    },

    /// Start of a fuzzy checkpoint.
    BeginCheckpoint,

    /// One chunk of checkpointed state.
    EndCheckpoint {
        /// Dirty page table entries: `(page_num, rec_lsn)`.
        dirty_pages: Vec<(u64, Lsn)>,
        /// Transaction table entries: `(transaction, status, last_lsn)`.
        transactions: Vec<(TransactionId, TransactionStatus, Lsn)>,
    },

    /// A transaction started committing.
    Commit {
        /// The committing transaction.
        trans_num: TransactionId,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
    },

    /// A transaction started aborting.
    Abort {
        /// The aborting transaction.
        trans_num: TransactionId,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
    },

    /// A transaction finished.
    End {
        /// The finished transaction.
        trans_num: TransactionId,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
    },

    /// Bytes on a page changed.
    UpdatePage {
        /// The writing transaction.
        trans_num: TransactionId,
        /// The written page.
        page_num: u64,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
        /// Offset of the write within the page's usable region.
        offset: u16,
        /// Bytes at `offset` before the write.
        before: Vec<u8>,
        /// Bytes at `offset` after the write.
        after: Vec<u8>,
    },

    /// Compensation for an update: writes the original bytes back.
    UndoUpdatePage {
        /// The rolling-back transaction.
        trans_num: TransactionId,
        /// The page being restored.
        page_num: u64,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
        /// Next record to undo.
        undo_next_lsn: Lsn,
        /// Offset of the restored bytes.
        offset: u16,
        /// The bytes to restore.
        after: Vec<u8>,
    },

    /// A page was allocated.
    AllocPage {
        /// The allocating transaction.
        trans_num: TransactionId,
        /// The new page.
        page_num: u64,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
    },

    /// Compensation for a page allocation: frees the page.
    UndoAllocPage {
        /// The rolling-back transaction.
        trans_num: TransactionId,
        /// The page being freed again.
        page_num: u64,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
        /// Next record to undo.
        undo_next_lsn: Lsn,
    },

    /// A page was freed.
    FreePage {
        /// The freeing transaction.
        trans_num: TransactionId,
        /// The freed page.
        page_num: u64,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
    },

    /// Compensation for a page free: re-allocates the page.
    UndoFreePage {
        /// The rolling-back transaction.
        trans_num: TransactionId,
        /// The page being re-allocated.
        page_num: u64,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
        /// Next record to undo.
        undo_next_lsn: Lsn,
    },

    /// A partition was allocated.
    AllocPart {
        /// The allocating transaction.
        trans_num: TransactionId,
        /// The new partition.
        part_num: u32,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
    },

    /// Compensation for a partition allocation: frees the partition.
    UndoAllocPart {
        /// The rolling-back transaction.
        trans_num: TransactionId,
        /// The partition being freed again.
        part_num: u32,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
        /// Next record to undo.
        undo_next_lsn: Lsn,
    },

    /// A partition was freed.
    FreePart {
        /// The freeing transaction.
        trans_num: TransactionId,
        /// The freed partition.
        part_num: u32,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
    },

    /// Compensation for a partition free: re-allocates the partition.
    UndoFreePart {
        /// The rolling-back transaction.
        trans_num: TransactionId,
        /// The partition being re-allocated.
        part_num: u32,
        /// Previous record of this transaction.
        prev_lsn: Lsn,
        /// Next record to undo.
        undo_next_lsn: Lsn,
    },
}

impl LogRecord {
    /// Returns the record kind.
    #[must_use]
    pub fn kind(&self) -> LogRecordKind {
        match self {
            Self::Master { .. } => LogRecordKind::Master,
            Self::BeginCheckpoint => LogRecordKind::BeginCheckpoint,
            Self::EndCheckpoint { .. } => LogRecordKind::EndCheckpoint,
            Self::Commit { .. } => LogRecordKind::Commit,
            Self::Abort { .. } => LogRecordKind::Abort,
            Self::End { .. } => LogRecordKind::End,
            Self::UpdatePage { .. } => LogRecordKind::UpdatePage,
            Self::UndoUpdatePage { .. } => LogRecordKind::UndoUpdatePage,
            Self::AllocPage { .. } => LogRecordKind::AllocPage,
            Self::UndoAllocPage { .. } => LogRecordKind::UndoAllocPage,
            Self::FreePage { .. } => LogRecordKind::FreePage,
            Self::UndoFreePage { .. } => LogRecordKind::UndoFreePage,
            Self::AllocPart { .. } => LogRecordKind::AllocPart,
            Self::UndoAllocPart { .. } => LogRecordKind::UndoAllocPart,
            Self::FreePart { .. } => LogRecordKind::FreePart,
            Self::UndoFreePart { .. } => LogRecordKind::UndoFreePart,
        }
    }

    /// The transaction this record belongs to, if any.
    #[must_use]
    pub fn trans_num(&self) -> Option<TransactionId> {
        match self {
            Self::Commit { trans_num, .. }
            | Self::Abort { trans_num, .. }
            | Self::End { trans_num, .. }
            | Self::UpdatePage { trans_num, .. }
            | Self::UndoUpdatePage { trans_num, .. }
            | Self::AllocPage { trans_num, .. }
            | Self::UndoAllocPage { trans_num, .. }
            | Self::FreePage { trans_num, .. }
            | Self::UndoFreePage { trans_num, .. }
            | Self::AllocPart { trans_num, .. }
            | Self::UndoAllocPart { trans_num, .. }
            | Self::FreePart { trans_num, .. }
            | Self::UndoFreePart { trans_num, .. } => Some(*trans_num),
            Self::Master { .. } | Self::BeginCheckpoint | Self::EndCheckpoint { .. } => None,
        }
    }

    /// The page this record concerns, if any.
    #[must_use]
    pub fn page_num(&self) -> Option<u64> {
        match self {
            Self::UpdatePage { page_num, .. }
            | Self::UndoUpdatePage { page_num, .. }
            | Self::AllocPage { page_num, .. }
            | Self::UndoAllocPage { page_num, .. }
            | Self::FreePage { page_num, .. }
            | Self::UndoFreePage { page_num, .. } => Some(*page_num),
            _ => None,
        }
    }

    /// The partition this record concerns, if any.
    #[must_use]
    pub fn part_num(&self) -> Option<u32> {
        match self {
            Self::AllocPart { part_num, .. }
            | Self::UndoAllocPart { part_num, .. }
            | Self::FreePart { part_num, .. }
            | Self::UndoFreePart { part_num, .. } => Some(*part_num),
            _ => None,
        }
    }

    /// The previous record of the same transaction, if any.
    #[must_use]
    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            Self::Commit { prev_lsn, .. }
            | Self::Abort { prev_lsn, .. }
            | Self::End { prev_lsn, .. }
            | Self::UpdatePage { prev_lsn, .. }
            | Self::UndoUpdatePage { prev_lsn, .. }
            | Self::AllocPage { prev_lsn, .. }
            | Self::UndoAllocPage { prev_lsn, .. }
            | Self::FreePage { prev_lsn, .. }
            | Self::UndoFreePage { prev_lsn, .. }
            | Self::AllocPart { prev_lsn, .. }
            | Self::UndoAllocPart { prev_lsn, .. }
            | Self::FreePart { prev_lsn, .. }
            | Self::UndoFreePart { prev_lsn, .. } => Some(*prev_lsn),
            Self::Master { .. } | Self::BeginCheckpoint | Self::EndCheckpoint { .. } => None,
        }
    }

    /// For compensation records, the next record to undo.
    #[must_use]
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match self {
            Self::UndoUpdatePage { undo_next_lsn, .. }
            | Self::UndoAllocPage { undo_next_lsn, .. }
            | Self::UndoFreePage { undo_next_lsn, .. }
            | Self::UndoAllocPart { undo_next_lsn, .. }
            | Self::UndoFreePart { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    /// Whether this record's effect can be reapplied during recovery.
    #[must_use]
    pub fn is_redoable(&self) -> bool {
        !matches!(
            self,
            Self::Master { .. }
                | Self::BeginCheckpoint
                | Self::EndCheckpoint { .. }
                | Self::Commit { .. }
                | Self::Abort { .. }
                | Self::End { .. }
        )
    }

    /// Whether this record's effect can be undone.
    ///
    /// Compensation records are redoable but never undoable: undo never
    /// undoes an undo.
    #[must_use]
    pub fn is_undoable(&self) -> bool {
        matches!(
            self,
            Self::UpdatePage { .. }
                | Self::AllocPage { .. }
                | Self::FreePage { .. }
                | Self::AllocPart { .. }
                | Self::FreePart { .. }
        )
    }

    /// Builds the compensation record undoing this record.
    ///
    /// `last_lsn` is the transaction's current last LSN and becomes the
    /// CLR's `prev_lsn`; the CLR's `undo_next_lsn` is this record's
    /// `prev_lsn`. Returns `None` for records that are not undoable.
    /// Building the CLR does not apply the undo: redo the CLR for that.
    #[must_use]
    pub fn undo(&self, last_lsn: Lsn) -> Option<LogRecord> {
        match self {
            Self::UpdatePage {
                trans_num,
                page_num,
                prev_lsn,
                offset,
                before,
                ..
            } => Some(Self::UndoUpdatePage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
                offset: *offset,
                after: before.clone(),
            }),
            Self::AllocPage {
                trans_num,
                page_num,
                prev_lsn,
            } => Some(Self::UndoAllocPage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            Self::FreePage {
                trans_num,
                page_num,
                prev_lsn,
            } => Some(Self::UndoFreePage {
                trans_num: *trans_num,
                page_num: *page_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            Self::AllocPart {
                trans_num,
                part_num,
                prev_lsn,
            } => Some(Self::UndoAllocPart {
                trans_num: *trans_num,
                part_num: *part_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            Self::FreePart {
                trans_num,
                part_num,
                prev_lsn,
            } => Some(Self::UndoFreePart {
                trans_num: *trans_num,
                part_num: *part_num,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            _ => None,
        }
    }

    /// Applies this record's effect.
    ///
    /// `lsn` is the record's own LSN, stamped onto modified pages.
    ///
    /// Allocations of already-present pages/partitions and frees of
    /// already-absent ones are no-ops, which is what makes redo idempotent
    /// across repeated restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not redoable or the storage
    /// operation fails.
    pub fn redo(
        &self,
        lsn: Lsn,
        disk: &DiskSpaceManager,
        buffer: &BufferManager,
    ) -> CoreResult<()> {
        match self {
            Self::UpdatePage {
                page_num,
                offset,
                after,
                ..
            }
            | Self::UndoUpdatePage {
                page_num,
                offset,
                after,
                ..
            } => {
                let page = buffer.fetch_page(*page_num)?;
                page.write(usize::from(*offset), after)?;
                page.set_page_lsn(lsn.as_u64());
                Ok(())
            }
            Self::AllocPage { page_num, .. } | Self::UndoFreePage { page_num, .. } => {
                tolerate_present(disk.alloc_page_at(*page_num))
            }
            Self::FreePage { page_num, .. } | Self::UndoAllocPage { page_num, .. } => {
                buffer.discard(*page_num);
                tolerate_absent(disk.free_page(*page_num))
            }
            Self::AllocPart { part_num, .. } | Self::UndoFreePart { part_num, .. } => {
                tolerate_present(disk.alloc_part_at(*part_num))
            }
            Self::FreePart { part_num, .. } | Self::UndoAllocPart { part_num, .. } => {
                tolerate_absent(disk.free_part(*part_num))
            }
            Self::Master { .. }
            | Self::BeginCheckpoint
            | Self::EndCheckpoint { .. }
            | Self::Commit { .. }
            | Self::Abort { .. }
            | Self::End { .. } => Err(CoreError::invalid_operation(format!(
                "{:?} records cannot be redone",
                self.kind()
            ))),
        }
    }

    /// Whether an end-checkpoint record with the given entry counts fits in
    /// a single record payload.
    ///
    /// The checkpoint writer consults this before adding each entry, and
    /// emits the current record when the next entry would overflow.
    #[must_use]
    pub fn fits_in_one_record(dpt_entries: usize, txn_entries: usize) -> bool {
        // counts (4 + 4) + 16 bytes per DPT entry + 17 per txn entry
        let payload = 8 + dpt_entries * 16 + txn_entries * 17;
        payload <= MAX_PAYLOAD_SIZE
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error on malformed update images (before/after length
    /// mismatch or oversized images).
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Master {
                last_checkpoint_lsn,
            } => {
                buf.extend_from_slice(&last_checkpoint_lsn.as_u64().to_le_bytes());
            }

            Self::BeginCheckpoint => {}

            Self::EndCheckpoint {
                dirty_pages,
                transactions,
            } => {
                buf.extend_from_slice(&(dirty_pages.len() as u32).to_le_bytes());
                for (page_num, rec_lsn) in dirty_pages {
                    buf.extend_from_slice(&page_num.to_le_bytes());
                    buf.extend_from_slice(&rec_lsn.as_u64().to_le_bytes());
                }
                buf.extend_from_slice(&(transactions.len() as u32).to_le_bytes());
                for (trans_num, status, last_lsn) in transactions {
                    buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                    buf.push(status.as_byte());
                    buf.extend_from_slice(&last_lsn.as_u64().to_le_bytes());
                }
            }

            Self::Commit {
                trans_num,
                prev_lsn,
            }
            | Self::Abort {
                trans_num,
                prev_lsn,
            }
            | Self::End {
                trans_num,
                prev_lsn,
            } => {
                buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                buf.extend_from_slice(&prev_lsn.as_u64().to_le_bytes());
            }

            Self::UpdatePage {
                trans_num,
                page_num,
                prev_lsn,
                offset,
                before,
                after,
            } => {
                if before.len() != after.len() {
                    return Err(CoreError::invalid_operation(format!(
                        "update images differ in length: {} vs {}",
                        before.len(),
                        after.len()
                    )));
                }
                if before.len() > MAX_PAYLOAD_SIZE {
                    return Err(CoreError::invalid_operation(format!(
                        "update image of {} bytes exceeds the {} byte maximum",
                        before.len(),
                        MAX_PAYLOAD_SIZE
                    )));
                }
                buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                buf.extend_from_slice(&page_num.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&(before.len() as u16).to_le_bytes());
                buf.extend_from_slice(before);
                buf.extend_from_slice(after);
            }

            Self::UndoUpdatePage {
                trans_num,
                page_num,
                prev_lsn,
                undo_next_lsn,
                offset,
                after,
            } => {
                if after.len() > MAX_PAYLOAD_SIZE {
                    return Err(CoreError::invalid_operation(format!(
                        "update image of {} bytes exceeds the {} byte maximum",
                        after.len(),
                        MAX_PAYLOAD_SIZE
                    )));
                }
                buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                buf.extend_from_slice(&page_num.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&undo_next_lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&(after.len() as u16).to_le_bytes());
                buf.extend_from_slice(after);
            }

            Self::AllocPage {
                trans_num,
                page_num,
                prev_lsn,
            }
            | Self::FreePage {
                trans_num,
                page_num,
                prev_lsn,
            } => {
                buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                buf.extend_from_slice(&page_num.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.as_u64().to_le_bytes());
            }

            Self::UndoAllocPage {
                trans_num,
                page_num,
                prev_lsn,
                undo_next_lsn,
            }
            | Self::UndoFreePage {
                trans_num,
                page_num,
                prev_lsn,
                undo_next_lsn,
            } => {
                buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                buf.extend_from_slice(&page_num.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&undo_next_lsn.as_u64().to_le_bytes());
            }

            Self::AllocPart {
                trans_num,
                part_num,
                prev_lsn,
            }
            | Self::FreePart {
                trans_num,
                part_num,
                prev_lsn,
            } => {
                buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                buf.extend_from_slice(&part_num.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.as_u64().to_le_bytes());
            }

            Self::UndoAllocPart {
                trans_num,
                part_num,
                prev_lsn,
                undo_next_lsn,
            }
            | Self::UndoFreePart {
                trans_num,
                part_num,
                prev_lsn,
                undo_next_lsn,
            } => {
                buf.extend_from_slice(&trans_num.as_u64().to_le_bytes());
                buf.extend_from_slice(&part_num.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&undo_next_lsn.as_u64().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its kind and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] on truncated or trailing bytes.
    pub fn decode_payload(kind: LogRecordKind, payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = Cursor::new(payload);

        let record = match kind {
            LogRecordKind::Master => Self::Master {
                last_checkpoint_lsn: Lsn::new(cursor.read_u64()?),
            },

            LogRecordKind::BeginCheckpoint => Self::BeginCheckpoint,

            LogRecordKind::EndCheckpoint => {
                let dpt_count = cursor.read_u32()? as usize;
                let mut dirty_pages = Vec::with_capacity(dpt_count);
                for _ in 0..dpt_count {
                    let page_num = cursor.read_u64()?;
                    let rec_lsn = Lsn::new(cursor.read_u64()?);
                    dirty_pages.push((page_num, rec_lsn));
                }
                let txn_count = cursor.read_u32()? as usize;
                let mut transactions = Vec::with_capacity(txn_count);
                for _ in 0..txn_count {
                    let trans_num = TransactionId::new(cursor.read_u64()?);
                    let status_byte = cursor.read_u8()?;
                    let status = TransactionStatus::from_byte(status_byte).ok_or_else(|| {
                        CoreError::log_corruption(format!(
                            "unknown transaction status {status_byte}"
                        ))
                    })?;
                    let last_lsn = Lsn::new(cursor.read_u64()?);
                    transactions.push((trans_num, status, last_lsn));
                }
                Self::EndCheckpoint {
                    dirty_pages,
                    transactions,
                }
            }

            LogRecordKind::Commit => Self::Commit {
                trans_num: TransactionId::new(cursor.read_u64()?),
                prev_lsn: Lsn::new(cursor.read_u64()?),
            },
            LogRecordKind::Abort => Self::Abort {
                trans_num: TransactionId::new(cursor.read_u64()?),
                prev_lsn: Lsn::new(cursor.read_u64()?),
            },
            LogRecordKind::End => Self::End {
                trans_num: TransactionId::new(cursor.read_u64()?),
                prev_lsn: Lsn::new(cursor.read_u64()?),
            },

            LogRecordKind::UpdatePage => {
                let trans_num = TransactionId::new(cursor.read_u64()?);
                let page_num = cursor.read_u64()?;
                let prev_lsn = Lsn::new(cursor.read_u64()?);
                let offset = cursor.read_u16()?;
                let len = cursor.read_u16()? as usize;
                let before = cursor.read_bytes(len)?;
                let after = cursor.read_bytes(len)?;
                Self::UpdatePage {
                    trans_num,
                    page_num,
                    prev_lsn,
                    offset,
                    before,
                    after,
                }
            }

            LogRecordKind::UndoUpdatePage => {
                let trans_num = TransactionId::new(cursor.read_u64()?);
                let page_num = cursor.read_u64()?;
                let prev_lsn = Lsn::new(cursor.read_u64()?);
                let undo_next_lsn = Lsn::new(cursor.read_u64()?);
                let offset = cursor.read_u16()?;
                let len = cursor.read_u16()? as usize;
                let after = cursor.read_bytes(len)?;
                Self::UndoUpdatePage {
                    trans_num,
                    page_num,
                    prev_lsn,
                    undo_next_lsn,
                    offset,
                    after,
                }
            }

            LogRecordKind::AllocPage | LogRecordKind::FreePage => {
                let trans_num = TransactionId::new(cursor.read_u64()?);
                let page_num = cursor.read_u64()?;
                let prev_lsn = Lsn::new(cursor.read_u64()?);
                if kind == LogRecordKind::AllocPage {
                    Self::AllocPage {
                        trans_num,
                        page_num,
                        prev_lsn,
                    }
                } else {
                    Self::FreePage {
                        trans_num,
                        page_num,
                        prev_lsn,
                    }
                }
            }

            LogRecordKind::UndoAllocPage | LogRecordKind::UndoFreePage => {
                let trans_num = TransactionId::new(cursor.read_u64()?);
                let page_num = cursor.read_u64()?;
                let prev_lsn = Lsn::new(cursor.read_u64()?);
                let undo_next_lsn = Lsn::new(cursor.read_u64()?);
                if kind == LogRecordKind::UndoAllocPage {
                    Self::UndoAllocPage {
                        trans_num,
                        page_num,
                        prev_lsn,
                        undo_next_lsn,
                    }
                } else {
                    Self::UndoFreePage {
                        trans_num,
                        page_num,
                        prev_lsn,
                        undo_next_lsn,
                    }
                }
            }

            LogRecordKind::AllocPart | LogRecordKind::FreePart => {
                let trans_num = TransactionId::new(cursor.read_u64()?);
                let part_num = cursor.read_u32()?;
                let prev_lsn = Lsn::new(cursor.read_u64()?);
                if kind == LogRecordKind::AllocPart {
                    Self::AllocPart {
                        trans_num,
                        part_num,
                        prev_lsn,
                    }
                } else {
                    Self::FreePart {
                        trans_num,
                        part_num,
                        prev_lsn,
                    }
                }
            }

            LogRecordKind::UndoAllocPart | LogRecordKind::UndoFreePart => {
                let trans_num = TransactionId::new(cursor.read_u64()?);
                let part_num = cursor.read_u32()?;
                let prev_lsn = Lsn::new(cursor.read_u64()?);
                let undo_next_lsn = Lsn::new(cursor.read_u64()?);
                if kind == LogRecordKind::UndoAllocPart {
                    Self::UndoAllocPart {
                        trans_num,
                        part_num,
                        prev_lsn,
                        undo_next_lsn,
                    }
                } else {
                    Self::UndoFreePart {
                        trans_num,
                        part_num,
                        prev_lsn,
                        undo_next_lsn,
                    }
                }
            }
        };

        cursor.finish()?;
        Ok(record)
    }
}

/// Treats an "already allocated" error as success.
fn tolerate_present(result: Result<(), StorageError>) -> CoreResult<()> {
    match result {
        Ok(()) | Err(StorageError::PageExists(_) | StorageError::PartitionExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Treats an "already freed" error as success.
fn tolerate_absent(result: Result<(), StorageError>) -> CoreResult<()> {
    match result {
        Ok(())
        | Err(
            StorageError::PageMissing(_)
            | StorageError::PartitionMissing(_),
        ) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Bounds-checked little-endian payload reader.
struct Cursor<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, pos: 0 }
    }

    fn read_u8(&mut self) -> CoreResult<u8> {
        let bytes = self.take(1)?;
        Ok(bytes[0])
    }

    fn read_u16(&mut self) -> CoreResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> CoreResult<u32> {
        let bytes = self.take(4)?;
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| CoreError::log_corruption("invalid u32"))?;
        Ok(u32::from_le_bytes(arr))
    }

    fn read_u64(&mut self) -> CoreResult<u64> {
        let bytes = self.take(8)?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::log_corruption("invalid u64"))?;
        Ok(u64::from_le_bytes(arr))
    }

    fn read_bytes(&mut self, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.pos + len > self.payload.len() {
            return Err(CoreError::log_corruption("unexpected end of payload"));
        }
        let bytes = &self.payload[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn finish(self) -> CoreResult<()> {
        if self.pos != self.payload.len() {
            return Err(CoreError::log_corruption(format!(
                "trailing bytes in record: expected {} bytes, got {}",
                self.pos,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// Computes the CRC32 checksum for data (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(record: &LogRecord) {
        let payload = record.encode_payload().unwrap();
        let decoded = LogRecord::decode_payload(record.kind(), &payload).unwrap();
        assert_eq!(&decoded, record);
    }

    #[test]
    fn kind_byte_round_trip() {
        for byte in 1..=16 {
            let kind = LogRecordKind::from_byte(byte).unwrap();
            assert_eq!(kind.as_byte(), byte);
        }
        assert_eq!(LogRecordKind::from_byte(0), None);
        assert_eq!(LogRecordKind::from_byte(17), None);
    }

    #[test]
    fn master_round_trip() {
        round_trip(&LogRecord::Master {
            last_checkpoint_lsn: Lsn::new(1234),
        });
    }

    #[test]
    fn checkpoint_round_trip() {
        round_trip(&LogRecord::BeginCheckpoint);
        round_trip(&LogRecord::EndCheckpoint {
            dirty_pages: vec![(5, Lsn::new(100)), (9, Lsn::new(140))],
            transactions: vec![
                (
                    TransactionId::new(1),
                    TransactionStatus::Running,
                    Lsn::new(160),
                ),
                (
                    TransactionId::new(2),
                    TransactionStatus::Committing,
                    Lsn::new(180),
                ),
            ],
        });
    }

    #[test]
    fn status_records_round_trip() {
        let t = TransactionId::new(7);
        round_trip(&LogRecord::Commit {
            trans_num: t,
            prev_lsn: Lsn::new(30),
        });
        round_trip(&LogRecord::Abort {
            trans_num: t,
            prev_lsn: Lsn::new(30),
        });
        round_trip(&LogRecord::End {
            trans_num: t,
            prev_lsn: Lsn::new(30),
        });
    }

    #[test]
    fn update_round_trip() {
        round_trip(&LogRecord::UpdatePage {
            trans_num: TransactionId::new(1),
            page_num: 42,
            prev_lsn: Lsn::new(17),
            offset: 100,
            before: vec![1, 2, 3],
            after: vec![4, 5, 6],
        });
        round_trip(&LogRecord::UndoUpdatePage {
            trans_num: TransactionId::new(1),
            page_num: 42,
            prev_lsn: Lsn::new(90),
            undo_next_lsn: Lsn::new(17),
            offset: 100,
            after: vec![1, 2, 3],
        });
    }

    #[test]
    fn alloc_free_round_trip() {
        let t = TransactionId::new(3);
        round_trip(&LogRecord::AllocPage {
            trans_num: t,
            page_num: 77,
            prev_lsn: Lsn::new(10),
        });
        round_trip(&LogRecord::UndoAllocPage {
            trans_num: t,
            page_num: 77,
            prev_lsn: Lsn::new(20),
            undo_next_lsn: Lsn::new(5),
        });
        round_trip(&LogRecord::FreePart {
            trans_num: t,
            part_num: 4,
            prev_lsn: Lsn::new(10),
        });
        round_trip(&LogRecord::UndoFreePart {
            trans_num: t,
            part_num: 4,
            prev_lsn: Lsn::new(20),
            undo_next_lsn: Lsn::new(5),
        });
    }

    #[test]
    fn mismatched_update_images_rejected() {
        let record = LogRecord::UpdatePage {
            trans_num: TransactionId::new(1),
            page_num: 1,
            prev_lsn: Lsn::new(0),
            offset: 0,
            before: vec![1, 2],
            after: vec![3],
        };
        assert!(record.encode_payload().is_err());
    }

    #[test]
    fn oversized_update_images_rejected() {
        let record = LogRecord::UpdatePage {
            trans_num: TransactionId::new(1),
            page_num: 1,
            prev_lsn: Lsn::new(0),
            offset: 0,
            before: vec![0; MAX_PAYLOAD_SIZE + 1],
            after: vec![0; MAX_PAYLOAD_SIZE + 1],
        };
        assert!(record.encode_payload().is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let record = LogRecord::Commit {
            trans_num: TransactionId::new(1),
            prev_lsn: Lsn::new(0),
        };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0xFF);
        assert!(matches!(
            LogRecord::decode_payload(LogRecordKind::Commit, &payload),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let record = LogRecord::UpdatePage {
            trans_num: TransactionId::new(1),
            page_num: 1,
            prev_lsn: Lsn::new(0),
            offset: 0,
            before: vec![1, 2, 3],
            after: vec![4, 5, 6],
        };
        let payload = record.encode_payload().unwrap();
        assert!(matches!(
            LogRecord::decode_payload(LogRecordKind::UpdatePage, &payload[..payload.len() - 2]),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn redoable_and_undoable_classification() {
        let t = TransactionId::new(1);
        let update = LogRecord::UpdatePage {
            trans_num: t,
            page_num: 1,
            prev_lsn: Lsn::new(0),
            offset: 0,
            before: vec![1],
            after: vec![2],
        };
        let clr = update.undo(Lsn::new(50)).unwrap();
        let commit = LogRecord::Commit {
            trans_num: t,
            prev_lsn: Lsn::new(0),
        };

        assert!(update.is_redoable() && update.is_undoable());
        assert!(clr.is_redoable() && !clr.is_undoable());
        assert!(!commit.is_redoable() && !commit.is_undoable());
        assert!(!LogRecord::BeginCheckpoint.is_redoable());
        assert!(!LogRecord::Master {
            last_checkpoint_lsn: Lsn::new(0)
        }
        .is_redoable());
    }

    #[test]
    fn clr_links_past_the_compensated_record() {
        let update = LogRecord::UpdatePage {
            trans_num: TransactionId::new(1),
            page_num: 9,
            prev_lsn: Lsn::new(40),
            offset: 8,
            before: vec![1, 1],
            after: vec![2, 2],
        };

        let clr = update.undo(Lsn::new(120)).unwrap();
        match &clr {
            LogRecord::UndoUpdatePage {
                prev_lsn,
                undo_next_lsn,
                after,
                ..
            } => {
                assert_eq!(*prev_lsn, Lsn::new(120));
                assert_eq!(*undo_next_lsn, Lsn::new(40));
                // The CLR restores the before image.
                assert_eq!(after, &vec![1, 1]);
            }
            other => panic!("expected UndoUpdatePage, got {other:?}"),
        }
    }

    #[test]
    fn status_records_are_not_undoable() {
        let commit = LogRecord::Commit {
            trans_num: TransactionId::new(1),
            prev_lsn: Lsn::new(0),
        };
        assert!(commit.undo(Lsn::new(10)).is_none());
    }

    #[test]
    fn fits_in_one_record_boundaries() {
        assert!(LogRecord::fits_in_one_record(0, 0));
        // Exact capacity for DPT-only records.
        let dpt_max = (MAX_PAYLOAD_SIZE - 8) / 16;
        assert!(LogRecord::fits_in_one_record(dpt_max, 0));
        assert!(!LogRecord::fits_in_one_record(dpt_max + 1, 0));
        // The declared capacity actually encodes within bounds.
        let record = LogRecord::EndCheckpoint {
            dirty_pages: (0..dpt_max as u64).map(|i| (i, Lsn::new(i))).collect(),
            transactions: Vec::new(),
        };
        assert!(record.encode_payload().unwrap().len() <= MAX_PAYLOAD_SIZE);
    }

    proptest! {
        #[test]
        fn update_page_round_trips(
            page_num in 0u64..1 << 40,
            offset in 0u16..2000,
            bytes in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let record = LogRecord::UpdatePage {
                trans_num: TransactionId::new(1),
                page_num,
                prev_lsn: Lsn::new(7),
                offset,
                before: bytes.clone(),
                after: bytes.iter().map(|b| b.wrapping_add(1)).collect(),
            };
            let payload = record.encode_payload().unwrap();
            let decoded = LogRecord::decode_payload(LogRecordKind::UpdatePage, &payload).unwrap();
            prop_assert_eq!(decoded, record);
        }
    }
}
