//! The append-only log.
//!
//! Records are stored back to back in a dedicated byte store:
//!
//! ```text
//! | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! A record's LSN is its byte offset in the store, so LSNs are strictly
//! increasing and a record can be fetched directly by LSN. Offset 0 holds
//! the fixed-width master record, which is the only record ever rewritten
//! in place.
//!
//! A torn record at the tail (crash mid-append before a flush) is treated
//! as the end of the log. A checksum mismatch or unknown record kind
//! anywhere is corruption and fails the operation; recovery does not
//! guess its way past damaged records.

use crate::error::{CoreError, CoreResult};
use crate::recovery::record::{compute_crc32, LogRecord, LogRecordKind, MAX_PAYLOAD_SIZE};
use crate::types::Lsn;
use parking_lot::Mutex;
use petra_storage::StorageBackend;

/// Envelope overhead: kind (1) + length (4).
const HEADER_SIZE: usize = 5;

/// CRC size.
const CRC_SIZE: usize = 4;

/// Encoded size of the master record (8-byte payload).
const MASTER_RECORD_SIZE: usize = HEADER_SIZE + 8 + CRC_SIZE;

/// The append-only log manager.
pub struct LogManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    /// Offset up to which the log is known durable (exclusive).
    flushed_lsn: Mutex<u64>,
    sync_on_flush: bool,
}

impl LogManager {
    /// Creates a log manager over the given backing store.
    #[must_use]
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_flush: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            flushed_lsn: Mutex::new(0),
            sync_on_flush,
        }
    }

    /// Appends a record and returns its LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the record payload exceeds the maximum record
    /// size or the write fails.
    pub fn append(&self, record: &LogRecord) -> CoreResult<Lsn> {
        let data = Self::encode(record)?;
        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        Ok(Lsn::new(offset))
    }

    /// Ensures all records with LSN `<= lsn` are durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush_to_lsn(&self, lsn: Lsn) -> CoreResult<()> {
        let mut flushed = self.flushed_lsn.lock();
        if lsn.as_u64() < *flushed {
            return Ok(());
        }
        let mut backend = self.backend.lock();
        backend.flush()?;
        if self.sync_on_flush {
            backend.sync()?;
        }
        *flushed = backend.size()?;
        Ok(())
    }

    /// The LSN below which every record is known durable.
    #[must_use]
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn::new(*self.flushed_lsn.lock())
    }

    /// Fetches the record at `lsn`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] if no intact record starts at
    /// `lsn`.
    pub fn fetch(&self, lsn: Lsn) -> CoreResult<LogRecord> {
        let backend = self.backend.lock();
        match Self::read_record(backend.as_ref(), lsn.as_u64())? {
            Some((record, _)) => Ok(record),
            None => Err(CoreError::log_corruption(format!(
                "no record at {lsn}"
            ))),
        }
    }

    /// Returns a forward iterator over records starting at `lsn`.
    ///
    /// The iterator locks the store per record rather than for its whole
    /// lifetime, so records may be appended (and the log flushed) while a
    /// scan is in progress.
    #[must_use]
    pub fn scan_from(&self, lsn: Lsn) -> LogScan<'_> {
        LogScan {
            log: self,
            offset: lsn.as_u64(),
            finished: false,
        }
    }

    /// Rewrites the master record in place and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if `record` is not a master record, the log has no
    /// master record yet, or the write fails.
    pub fn rewrite_master(&self, record: &LogRecord) -> CoreResult<()> {
        if record.kind() != LogRecordKind::Master {
            return Err(CoreError::invalid_operation(format!(
                "cannot rewrite the master record with a {:?} record",
                record.kind()
            )));
        }
        let data = Self::encode(record)?;
        {
            let mut backend = self.backend.lock();
            if backend.size()? < MASTER_RECORD_SIZE as u64 {
                return Err(CoreError::log_corruption("log has no master record"));
            }
            backend.write_at(0, &data)?;
        }
        self.flush_to_lsn(Lsn::MASTER)
    }

    /// The offset one past the last appended byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store size cannot be read.
    pub fn end_lsn(&self) -> CoreResult<Lsn> {
        Ok(Lsn::new(self.backend.lock().size()?))
    }

    fn encode(record: &LogRecord) -> CoreResult<Vec<u8>> {
        let payload = record.encode_payload()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CoreError::invalid_operation(format!(
                "record payload of {} bytes exceeds the {} byte maximum",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.push(record.kind().as_byte());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Reads the record starting at `offset`.
    ///
    /// Returns `Ok(None)` for a clean end of log (at or past the size, or
    /// a torn record at the tail), the record and its encoded length
    /// otherwise.
    fn read_record(
        backend: &dyn StorageBackend,
        offset: u64,
    ) -> CoreResult<Option<(LogRecord, u64)>> {
        let size = backend.size()?;
        if offset.saturating_add(HEADER_SIZE as u64) > size {
            return Ok(None);
        }

        let header = backend.read_at(offset, HEADER_SIZE)?;
        let kind_byte = header[0];
        let kind = LogRecordKind::from_byte(kind_byte).ok_or_else(|| {
            CoreError::log_corruption(format!(
                "unknown record kind {kind_byte} at offset {offset}"
            ))
        })?;
        let payload_len =
            u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let total_len = (HEADER_SIZE + payload_len + CRC_SIZE) as u64;
        if offset + total_len > size {
            // Torn tail record.
            return Ok(None);
        }

        let body = backend.read_at(offset + HEADER_SIZE as u64, payload_len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(payload_len);
        let stored_crc = u32::from_le_bytes([
            crc_bytes[0],
            crc_bytes[1],
            crc_bytes[2],
            crc_bytes[3],
        ]);
        let mut checked = header;
        checked.extend_from_slice(payload);
        let computed_crc = compute_crc32(&checked);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = LogRecord::decode_payload(kind, payload)?;
        Ok(Some((record, total_len)))
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("flushed_lsn", &self.flushed_lsn())
            .finish_non_exhaustive()
    }
}

/// A forward iterator over log records.
pub struct LogScan<'a> {
    log: &'a LogManager,
    offset: u64,
    finished: bool,
}

impl Iterator for LogScan<'_> {
    type Item = CoreResult<(Lsn, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let backend = self.log.backend.lock();
        match LogManager::read_record(backend.as_ref(), self.offset) {
            Ok(Some((record, len))) => {
                let lsn = Lsn::new(self.offset);
                self.offset += len;
                Some(Ok((lsn, record)))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
