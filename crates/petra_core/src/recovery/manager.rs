//! ARIES-style recovery: write-ahead logging, fuzzy checkpoints, and the
//! three-phase restart.

use crate::error::{CoreError, CoreResult};
use crate::recovery::log::LogManager;
use crate::recovery::record::{LogRecord, LogRecordKind, MAX_PAYLOAD_SIZE};
use crate::transaction::{Transaction, TransactionStatus};
use crate::types::{Lsn, TransactionId};
use parking_lot::Mutex;
use petra_storage::{part_num, BufferManager, DiskSpaceManager, FlushHooks, LOG_PARTITION};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Factory used during restart analysis to materialize transactions found
/// in the log.
pub type TransactionFactory = Box<dyn Fn(TransactionId) -> Arc<Transaction> + Send + Sync>;

/// One transaction table entry.
struct TableEntry {
    transaction: Arc<Transaction>,
    last_lsn: Lsn,
    savepoints: HashMap<String, Lsn>,
}

impl TableEntry {
    fn new(transaction: Arc<Transaction>) -> Self {
        Self {
            transaction,
            last_lsn: Lsn::new(0),
            savepoints: HashMap::new(),
        }
    }
}

/// The recovery manager.
///
/// Forward processing keeps the write-ahead log, the transaction table,
/// and the dirty page table (DPT) current; [`RecoveryManager::restart`]
/// rebuilds that state after a crash and rolls back the losers.
///
/// `checkpoint`, `start_transaction`, and `restart` are mutually
/// exclusive. The per-transaction entry points assume each transaction is
/// driven by one thread at a time; the shared tables are individually
/// locked.
pub struct RecoveryManager {
    disk: Arc<DiskSpaceManager>,
    buffer: Arc<BufferManager>,
    log: Arc<LogManager>,
    /// page number -> recLSN: the LSN that first dirtied the page since it
    /// was last clean on disk.
    dirty_page_table: Mutex<HashMap<u64, Lsn>>,
    transaction_table: Mutex<HashMap<TransactionId, TableEntry>>,
    /// Set once restart's redo phase has finished; before that, disk
    /// writes must not prune the DPT.
    redo_complete: AtomicBool,
    new_transaction: TransactionFactory,
    /// Serializes checkpoint, start_transaction, and restart.
    op_lock: Mutex<()>,
}

impl RecoveryManager {
    /// Creates a recovery manager over the given storage and log.
    #[must_use]
    pub fn new(
        disk: Arc<DiskSpaceManager>,
        buffer: Arc<BufferManager>,
        log: Arc<LogManager>,
        new_transaction: TransactionFactory,
    ) -> Self {
        Self {
            disk,
            buffer,
            log,
            dirty_page_table: Mutex::new(HashMap::new()),
            transaction_table: Mutex::new(HashMap::new()),
            redo_complete: AtomicBool::new(false),
            new_transaction,
            op_lock: Mutex::new(()),
        }
    }

    /// Sets up the log of a brand-new database: writes the master record
    /// and takes the first checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is not empty.
    pub fn initialize(&self) -> CoreResult<()> {
        let _guard = self.op_lock.lock();
        if self.log.end_lsn()? != Lsn::new(0) {
            return Err(CoreError::invalid_operation(
                "cannot initialize a non-empty log",
            ));
        }
        self.log.append(&LogRecord::Master {
            last_checkpoint_lsn: Lsn::new(0),
        })?;
        self.checkpoint_inner()
    }

    // Forward processing /////////////////////////////////////////////////

    /// Registers a newly started transaction.
    pub fn start_transaction(&self, transaction: Arc<Transaction>) {
        let _guard = self.op_lock.lock();
        self.transaction_table
            .lock()
            .insert(transaction.trans_num(), TableEntry::new(transaction));
    }

    /// Logs a commit record, flushes the log through it (commit
    /// durability), and moves the transaction to `Committing`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn commit(&self, trans_num: TransactionId) -> CoreResult<Lsn> {
        let mut table = self.transaction_table.lock();
        let entry = table
            .get_mut(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?;

        let lsn = self.log.append(&LogRecord::Commit {
            trans_num,
            prev_lsn: entry.last_lsn,
        })?;
        self.log.flush_to_lsn(lsn)?;
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Committing);
        Ok(lsn)
    }

    /// Logs an abort record and moves the transaction to `Aborting`.
    ///
    /// No rollback happens here; the changes are undone at
    /// [`RecoveryManager::end`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn abort(&self, trans_num: TransactionId) -> CoreResult<Lsn> {
        let mut table = self.transaction_table.lock();
        let entry = table
            .get_mut(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?;

        let lsn = self.log.append(&LogRecord::Abort {
            trans_num,
            prev_lsn: entry.last_lsn,
        })?;
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Aborting);
        Ok(lsn)
    }

    /// Finishes a transaction: rolls back its changes if it is aborting,
    /// removes it from the table, and logs an end record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn end(&self, trans_num: TransactionId) -> CoreResult<Lsn> {
        let mut table = self.transaction_table.lock();
        let status = table
            .get(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?
            .transaction
            .status();

        if status == TransactionStatus::Aborting {
            self.rollback_to_lsn(&mut table, trans_num, Lsn::new(0))?;
        }

        let Some(entry) = table.remove(&trans_num) else {
            return Err(CoreError::UnknownTransaction(trans_num));
        };
        let lsn = self.log.append(&LogRecord::End {
            trans_num,
            prev_lsn: entry.last_lsn,
        })?;
        entry.transaction.set_status(TransactionStatus::Complete);
        Ok(lsn)
    }

    /// Logs a page write.
    ///
    /// `before` and `after` are the bytes at `offset` before and after the
    /// write; they must be the same length, at most half the usable page
    /// size. The page enters the DPT if it is not already there.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table, or [`CoreError::InvalidOperation`] on bad images.
    pub fn log_page_write(
        &self,
        trans_num: TransactionId,
        page_num: u64,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> CoreResult<Lsn> {
        if before.len() != after.len() {
            return Err(CoreError::invalid_operation(format!(
                "update images differ in length: {} vs {}",
                before.len(),
                after.len()
            )));
        }
        if before.len() > MAX_PAYLOAD_SIZE {
            return Err(CoreError::invalid_operation(format!(
                "update image of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte maximum",
                before.len()
            )));
        }

        let mut table = self.transaction_table.lock();
        let entry = table
            .get_mut(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?;

        let lsn = self.log.append(&LogRecord::UpdatePage {
            trans_num,
            page_num,
            prev_lsn: entry.last_lsn,
            offset,
            before: before.to_vec(),
            after: after.to_vec(),
        })?;
        entry.last_lsn = lsn;
        self.dirty_page_table.lock().entry(page_num).or_insert(lsn);
        Ok(lsn)
    }

    /// Logs a partition allocation and flushes (the allocation is visible
    /// on disk as soon as this returns).
    ///
    /// Returns `None` for the log partition: the log does not describe its
    /// own storage.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn log_alloc_part(
        &self,
        trans_num: TransactionId,
        part: u32,
    ) -> CoreResult<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed(trans_num, |prev_lsn| LogRecord::AllocPart {
            trans_num,
            part_num: part,
            prev_lsn,
        })
        .map(Some)
    }

    /// Logs a partition free and flushes.
    ///
    /// Returns `None` for the log partition.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn log_free_part(
        &self,
        trans_num: TransactionId,
        part: u32,
    ) -> CoreResult<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed(trans_num, |prev_lsn| LogRecord::FreePart {
            trans_num,
            part_num: part,
            prev_lsn,
        })
        .map(Some)
    }

    /// Logs a page allocation and flushes.
    ///
    /// Returns `None` for pages in the log partition.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn log_alloc_page(
        &self,
        trans_num: TransactionId,
        page_num: u64,
    ) -> CoreResult<Option<Lsn>> {
        if part_num(page_num) == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed(trans_num, |prev_lsn| LogRecord::AllocPage {
            trans_num,
            page_num,
            prev_lsn,
        })
        .map(Some)
    }

    /// Logs a page free and flushes. The page leaves the DPT: freeing it
    /// reached disk, so it is no longer dirty relative to disk.
    ///
    /// Returns `None` for pages in the log partition.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn log_free_page(
        &self,
        trans_num: TransactionId,
        page_num: u64,
    ) -> CoreResult<Option<Lsn>> {
        if part_num(page_num) == LOG_PARTITION {
            return Ok(None);
        }
        self.dirty_page_table.lock().remove(&page_num);
        self.log_flushed(trans_num, |prev_lsn| LogRecord::FreePage {
            trans_num,
            page_num,
            prev_lsn,
        })
        .map(Some)
    }

    /// Records a savepoint at the transaction's current last LSN,
    /// replacing any savepoint of the same name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn savepoint(&self, trans_num: TransactionId, name: &str) -> CoreResult<()> {
        let mut table = self.transaction_table.lock();
        let entry = table
            .get_mut(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?;
        let lsn = entry.last_lsn;
        entry.savepoints.insert(name.to_string(), lsn);
        Ok(())
    }

    /// Deletes a savepoint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table.
    pub fn release_savepoint(&self, trans_num: TransactionId, name: &str) -> CoreResult<()> {
        let mut table = self.transaction_table.lock();
        let entry = table
            .get_mut(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?;
        entry.savepoints.remove(name);
        Ok(())
    }

    /// Undoes everything the transaction did after the savepoint, logging
    /// a compensation record for each undone change. The transaction keeps
    /// running afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTransaction`] if the transaction is not
    /// in the table, or [`CoreError::InvalidOperation`] for an unknown
    /// savepoint.
    pub fn rollback_to_savepoint(&self, trans_num: TransactionId, name: &str) -> CoreResult<()> {
        let mut table = self.transaction_table.lock();
        let target = table
            .get(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?
            .savepoints
            .get(name)
            .copied()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "{trans_num} has no savepoint named {name:?}"
                ))
            })?;
        self.rollback_to_lsn(&mut table, trans_num, target)
    }

    /// Lowers (never raises) the recLSN recorded for a page.
    ///
    /// Appends race against DPT insertion, so a later log record can reach
    /// the DPT first; taking the minimum keeps the recLSN at the earliest
    /// dirtying record.
    pub fn dirty_page(&self, page_num: u64, lsn: Lsn) {
        let mut dpt = self.dirty_page_table.lock();
        let entry = dpt.entry(page_num).or_insert(lsn);
        *entry = (*entry).min(lsn);
    }

    /// Write-ahead rule: called before a page goes to disk, flushes the
    /// log through that page's LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the log flush fails.
    pub fn page_flush_hook(&self, page_lsn: Lsn) -> CoreResult<()> {
        self.log.flush_to_lsn(page_lsn)
    }

    /// Called after a page reached disk: the page is clean, so it leaves
    /// the DPT. Suppressed while restart's redo phase is running, which
    /// needs the DPT intact.
    pub fn disk_io_hook(&self, page_num: u64) {
        if self.redo_complete.load(Ordering::SeqCst) {
            self.dirty_page_table.lock().remove(&page_num);
        }
    }

    /// Takes a fuzzy checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if a log write fails.
    pub fn checkpoint(&self) -> CoreResult<()> {
        let _guard = self.op_lock.lock();
        self.checkpoint_inner()
    }

    /// Takes a final checkpoint and flushes the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails.
    pub fn close(&self) -> CoreResult<()> {
        self.checkpoint()?;
        self.log.flush_to_lsn(self.log.end_lsn()?)
    }

    // Restart /////////////////////////////////////////////////////////////

    /// Performs restart recovery: analysis, redo, DPT cleanup, undo, and a
    /// terminal checkpoint. Assumes no concurrent activity.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal to startup: a corrupt log record or a
    /// missing master record leaves the database unopened.
    pub fn restart(&self) -> CoreResult<()> {
        let _guard = self.op_lock.lock();

        info!("restart: analysis");
        self.restart_analysis()?;
        info!("restart: redo");
        self.restart_redo()?;
        self.redo_complete.store(true, Ordering::SeqCst);
        self.clean_dpt();
        info!("restart: undo");
        self.restart_undo()?;
        self.checkpoint_inner()?;
        info!("restart: complete");
        Ok(())
    }

    /// The current dirty page table, for inspection.
    #[must_use]
    pub fn dirty_pages(&self) -> HashMap<u64, Lsn> {
        self.dirty_page_table.lock().clone()
    }

    /// Transactions currently in the transaction table.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.transaction_table.lock().keys().copied().collect()
    }

    /// The last LSN recorded for a transaction, if it is in the table.
    #[must_use]
    pub fn last_lsn(&self, trans_num: TransactionId) -> Option<Lsn> {
        self.transaction_table
            .lock()
            .get(&trans_num)
            .map(|e| e.last_lsn)
    }

    // Helpers /////////////////////////////////////////////////////////////

    /// Appends a record built from the transaction's last LSN, advances
    /// the last LSN, and flushes the log through the new record.
    fn log_flushed(
        &self,
        trans_num: TransactionId,
        build: impl FnOnce(Lsn) -> LogRecord,
    ) -> CoreResult<Lsn> {
        let mut table = self.transaction_table.lock();
        let entry = table
            .get_mut(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?;

        let lsn = self.log.append(&build(entry.last_lsn))?;
        entry.last_lsn = lsn;
        self.log.flush_to_lsn(lsn)?;
        Ok(lsn)
    }

    /// Undoes the transaction's records down to (but not including)
    /// `target`, emitting and applying a CLR for each undoable record.
    fn rollback_to_lsn(
        &self,
        table: &mut HashMap<TransactionId, TableEntry>,
        trans_num: TransactionId,
        target: Lsn,
    ) -> CoreResult<()> {
        let entry = table
            .get_mut(&trans_num)
            .ok_or(CoreError::UnknownTransaction(trans_num))?;

        let last_record = self.log.fetch(entry.last_lsn)?;
        // If the last record is already a CLR, resume past what it undid.
        let mut current = last_record.undo_next_lsn().unwrap_or(entry.last_lsn);

        while current > target {
            let record = self.log.fetch(current)?;
            if let Some(clr) = record.undo(entry.last_lsn) {
                let clr_lsn = self.log.append(&clr)?;
                entry.last_lsn = clr_lsn;
                clr.redo(clr_lsn, &self.disk, &self.buffer)?;
            }
            current = record.prev_lsn().unwrap_or(Lsn::new(0));
        }
        Ok(())
    }

    fn checkpoint_inner(&self) -> CoreResult<()> {
        let begin_lsn = self.log.append(&LogRecord::BeginCheckpoint)?;
        debug!(begin_lsn = begin_lsn.as_u64(), "checkpoint");

        let dpt_snapshot: Vec<(u64, Lsn)> = {
            let dpt = self.dirty_page_table.lock();
            dpt.iter().map(|(&p, &l)| (p, l)).collect()
        };
        let txn_snapshot: Vec<(TransactionId, TransactionStatus, Lsn)> = {
            let table = self.transaction_table.lock();
            table
                .iter()
                .map(|(&t, e)| (t, e.transaction.status(), e.last_lsn))
                .collect()
        };

        // Pack DPT entries first, then transaction entries; emit a record
        // whenever the next entry would overflow it.
        let mut dirty_pages = Vec::new();
        let mut transactions = Vec::new();

        for (page_num, rec_lsn) in dpt_snapshot {
            if !LogRecord::fits_in_one_record(dirty_pages.len() + 1, 0) {
                self.log.append(&LogRecord::EndCheckpoint {
                    dirty_pages: std::mem::take(&mut dirty_pages),
                    transactions: Vec::new(),
                })?;
            }
            dirty_pages.push((page_num, rec_lsn));
        }

        for entry in txn_snapshot {
            if !LogRecord::fits_in_one_record(dirty_pages.len(), transactions.len() + 1) {
                self.log.append(&LogRecord::EndCheckpoint {
                    dirty_pages: std::mem::take(&mut dirty_pages),
                    transactions: std::mem::take(&mut transactions),
                })?;
            }
            transactions.push(entry);
        }

        let end_lsn = self.log.append(&LogRecord::EndCheckpoint {
            dirty_pages,
            transactions,
        })?;
        self.log.flush_to_lsn(end_lsn)?;

        self.log.rewrite_master(&LogRecord::Master {
            last_checkpoint_lsn: begin_lsn,
        })
    }

    /// Analysis: rebuild the transaction table and DPT from the log,
    /// starting at the last completed checkpoint.
    fn restart_analysis(&self) -> CoreResult<()> {
        let master = self.log.fetch(Lsn::MASTER)?;
        let LogRecord::Master {
            last_checkpoint_lsn,
        } = master
        else {
            return Err(CoreError::log_corruption("missing master record"));
        };

        let mut ended: HashSet<TransactionId> = HashSet::new();

        let mut scan = self.log.scan_from(last_checkpoint_lsn);
        while let Some(item) = scan.next() {
            let (lsn, record) = item?;

            // Transaction records advance that transaction's last LSN.
            if let Some(trans_num) = record.trans_num() {
                let mut table = self.transaction_table.lock();
                let entry = table
                    .entry(trans_num)
                    .or_insert_with(|| TableEntry::new((self.new_transaction)(trans_num)));
                entry.last_lsn = lsn;
            }

            // Page records maintain the DPT.
            if let Some(page_num) = record.page_num() {
                match record.kind() {
                    LogRecordKind::UpdatePage | LogRecordKind::UndoUpdatePage => {
                        self.dirty_page_table.lock().entry(page_num).or_insert(lsn);
                    }
                    LogRecordKind::FreePage | LogRecordKind::UndoAllocPage => {
                        // The free reaches disk immediately; the page is
                        // clean relative to disk from here on.
                        self.log.flush_to_lsn(lsn)?;
                        self.dirty_page_table.lock().remove(&page_num);
                    }
                    _ => {}
                }
            }

            // Status transitions.
            if let Some(trans_num) = record.trans_num() {
                match record.kind() {
                    LogRecordKind::Commit => {
                        if let Some(entry) = self.transaction_table.lock().get(&trans_num) {
                            entry
                                .transaction
                                .set_status(TransactionStatus::Committing);
                        }
                    }
                    LogRecordKind::Abort => {
                        if let Some(entry) = self.transaction_table.lock().get(&trans_num) {
                            entry
                                .transaction
                                .set_status(TransactionStatus::RecoveryAborting);
                        }
                    }
                    LogRecordKind::End => {
                        self.end_transaction(trans_num);
                        ended.insert(trans_num);
                    }
                    _ => {}
                }
            }

            // Checkpoint state merges into what the scan has built so far.
            if let LogRecord::EndCheckpoint {
                dirty_pages,
                transactions,
            } = &record
            {
                {
                    let mut dpt = self.dirty_page_table.lock();
                    for &(page_num, rec_lsn) in dirty_pages {
                        dpt.insert(page_num, rec_lsn);
                    }
                }

                let mut table = self.transaction_table.lock();
                for &(trans_num, chkpt_status, chkpt_lsn) in transactions {
                    if ended.contains(&trans_num) {
                        continue;
                    }
                    let entry = table
                        .entry(trans_num)
                        .or_insert_with(|| TableEntry::new((self.new_transaction)(trans_num)));
                    entry.last_lsn = entry.last_lsn.max(chkpt_lsn);

                    // Statuses move forward only, never back.
                    let current = entry.transaction.status();
                    match chkpt_status {
                        TransactionStatus::Complete => {
                            entry.transaction.set_status(TransactionStatus::Complete);
                        }
                        TransactionStatus::Committing
                            if current == TransactionStatus::Running =>
                        {
                            entry
                                .transaction
                                .set_status(TransactionStatus::Committing);
                        }
                        TransactionStatus::Aborting | TransactionStatus::RecoveryAborting
                            if current == TransactionStatus::Running =>
                        {
                            entry
                                .transaction
                                .set_status(TransactionStatus::RecoveryAborting);
                        }
                        _ => {}
                    }
                }
            }
        }
        drop(scan);

        // Settle the survivors: committers finish, runners become losers.
        let trans_nums: Vec<TransactionId> =
            self.transaction_table.lock().keys().copied().collect();
        for trans_num in trans_nums {
            let status = match self.transaction_table.lock().get(&trans_num) {
                Some(entry) => entry.transaction.status(),
                None => continue,
            };
            match status {
                TransactionStatus::Committing => {
                    self.end_with_record(trans_num)?;
                }
                TransactionStatus::Running => {
                    let mut table = self.transaction_table.lock();
                    if let Some(entry) = table.get_mut(&trans_num) {
                        entry
                            .transaction
                            .set_status(TransactionStatus::RecoveryAborting);
                        let lsn = self.log.append(&LogRecord::Abort {
                            trans_num,
                            prev_lsn: entry.last_lsn,
                        })?;
                        entry.last_lsn = lsn;
                    }
                }
                _ => {}
            }
        }

        debug!(
            transactions = self.transaction_table.lock().len(),
            dirty_pages = self.dirty_page_table.lock().len(),
            "analysis done"
        );
        Ok(())
    }

    /// Redo: replay history from the earliest recLSN in the DPT.
    fn restart_redo(&self) -> CoreResult<()> {
        let start = {
            let dpt = self.dirty_page_table.lock();
            dpt.values().min().copied()
        };
        let Some(start) = start else {
            return Ok(());
        };

        let mut scan = self.log.scan_from(start);
        while let Some(item) = scan.next() {
            let (lsn, record) = item?;
            if !record.is_redoable() {
                continue;
            }

            if record.part_num().is_some() {
                // Partition changes are unconditional: they have no page
                // LSN to compare against.
                record.redo(lsn, &self.disk, &self.buffer)?;
                continue;
            }

            match record.kind() {
                LogRecordKind::AllocPage | LogRecordKind::UndoFreePage => {
                    record.redo(lsn, &self.disk, &self.buffer)?;
                }
                LogRecordKind::UpdatePage
                | LogRecordKind::UndoUpdatePage
                | LogRecordKind::FreePage
                | LogRecordKind::UndoAllocPage => {
                    let Some(page_num) = record.page_num() else {
                        continue;
                    };
                    let rec_lsn = {
                        let dpt = self.dirty_page_table.lock();
                        dpt.get(&page_num).copied()
                    };
                    let Some(rec_lsn) = rec_lsn else {
                        continue;
                    };
                    if lsn < rec_lsn {
                        continue;
                    }
                    match self.buffer.fetch_page(page_num) {
                        Ok(page) => {
                            if lsn.as_u64() > page.page_lsn() {
                                record.redo(lsn, &self.disk, &self.buffer)?;
                            }
                        }
                        Err(
                            petra_storage::StorageError::PageMissing(_)
                            | petra_storage::StorageError::PartitionMissing(_),
                        ) => {
                            // The page is already gone from disk; the free
                            // this record describes has happened.
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Drops DPT entries for pages the buffer manager no longer holds
    /// dirty: they made it to disk.
    fn clean_dpt(&self) {
        let mut actually_dirty = HashSet::new();
        self.buffer.iter_page_nums(|page_num, dirty| {
            if dirty {
                actually_dirty.insert(page_num);
            }
        });
        self.dirty_page_table
            .lock()
            .retain(|page_num, _| actually_dirty.contains(page_num));
    }

    /// Undo: roll back every loser, always working on the loser record
    /// with the largest LSN.
    fn restart_undo(&self) -> CoreResult<()> {
        let mut heap: BinaryHeap<(Lsn, TransactionId)> = {
            let table = self.transaction_table.lock();
            table
                .iter()
                .filter(|(_, e)| {
                    e.transaction.status() == TransactionStatus::RecoveryAborting
                })
                .map(|(&t, e)| (e.last_lsn, t))
                .collect()
        };

        while let Some((lsn, trans_num)) = heap.pop() {
            let record = self.log.fetch(lsn)?;

            if record.is_undoable() {
                let mut table = self.transaction_table.lock();
                if let Some(entry) = table.get_mut(&trans_num) {
                    if let Some(clr) = record.undo(entry.last_lsn) {
                        let clr_lsn = self.log.append(&clr)?;
                        entry.last_lsn = clr_lsn;
                        clr.redo(clr_lsn, &self.disk, &self.buffer)?;
                    }
                }
            }

            let next = record
                .undo_next_lsn()
                .or_else(|| record.prev_lsn())
                .unwrap_or(Lsn::new(0));
            if next == Lsn::new(0) {
                self.end_with_record(trans_num)?;
            } else {
                heap.push((next, trans_num));
            }
        }
        Ok(())
    }

    /// Cleans up a transaction and removes it from the table.
    fn end_transaction(&self, trans_num: TransactionId) {
        let entry = self.transaction_table.lock().remove(&trans_num);
        if let Some(entry) = entry {
            entry.transaction.cleanup();
            entry.transaction.set_status(TransactionStatus::Complete);
        }
    }

    /// Cleans up a transaction and logs its end record.
    fn end_with_record(&self, trans_num: TransactionId) -> CoreResult<()> {
        let entry = self.transaction_table.lock().remove(&trans_num);
        if let Some(entry) = entry {
            entry.transaction.cleanup();
            entry.transaction.set_status(TransactionStatus::Complete);
            self.log.append(&LogRecord::End {
                trans_num,
                prev_lsn: entry.last_lsn,
            })?;
        }
        Ok(())
    }
}

impl FlushHooks for RecoveryManager {
    fn before_flush(&self, page_lsn: u64) -> Result<(), petra_storage::StorageError> {
        self.page_flush_hook(Lsn::new(page_lsn)).map_err(|e| match e {
            CoreError::Storage(inner) => inner,
            CoreError::Io(inner) => petra_storage::StorageError::Io(inner),
            other => petra_storage::StorageError::Corrupted(other.to_string()),
        })
    }

    fn on_disk_io(&self, page_num: u64) {
        self.disk_io_hook(page_num);
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("transactions", &self.transaction_table.lock().len())
            .field("dirty_pages", &self.dirty_page_table.lock().len())
            .finish_non_exhaustive()
    }
}
