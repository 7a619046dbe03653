//! Database facade: owns every subsystem and wires them together.

use crate::concurrency::{ensure_lock_held, LockContext, LockMode, LockTable};
use crate::config::Config;
use crate::error::CoreResult;
use crate::recovery::{LogManager, RecoveryManager};
use crate::transaction::Transaction;
use crate::types::{Lsn, TransactionId};
use petra_storage::{
    page_index, part_num, BufferManager, DiskSpaceManager, FileBackend, FlushHooks,
    InMemoryBackend, StorageBackend,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// The main database handle.
///
/// `Database` owns the disk space manager, the buffer manager, the lock
/// table with its context hierarchy, and the recovery manager; there are
/// no process-level globals. Opening an existing database runs restart
/// recovery before the handle is returned.
///
/// # Example
///
/// ```rust,ignore
/// use petra_core::Database;
///
/// let db = Database::open_in_memory()?;
/// let txn = db.begin();
/// let part = db.alloc_part(&txn)?;
/// let page = db.alloc_page(&txn, part)?;
/// db.page_write(&txn, page, 0, b"hello")?;
/// db.commit(&txn)?;
/// ```
pub struct Database {
    disk: Arc<DiskSpaceManager>,
    buffer: Arc<BufferManager>,
    lock_table: Arc<LockTable>,
    db_context: Arc<LockContext>,
    recovery: Arc<RecoveryManager>,
    next_trans_num: AtomicU64,
}

impl Database {
    /// Opens an ephemeral in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn open_in_memory() -> CoreResult<Self> {
        let disk = Arc::new(DiskSpaceManager::in_memory());
        let log_backend: Box<dyn StorageBackend> = Box::new(InMemoryBackend::new());
        Self::bootstrap(disk, log_backend, false)
    }

    /// Opens or creates a database in a directory.
    ///
    /// A fresh directory gets an initialized log; an existing one goes
    /// through restart recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be used, the database does
    /// not exist with `create_if_missing` disabled, or recovery fails.
    pub fn open(path: &Path, config: Config) -> CoreResult<Self> {
        let log_path = path.join("log");
        if !config.create_if_missing && !log_path.exists() {
            return Err(crate::error::CoreError::invalid_operation(format!(
                "database at {} does not exist",
                path.display()
            )));
        }

        let disk = Arc::new(DiskSpaceManager::on_disk(path.join("data"))?);
        let log_backend: Box<dyn StorageBackend> =
            Box::new(FileBackend::open_with_create_dirs(&log_path)?);
        Self::bootstrap(disk, log_backend, config.sync_on_flush)
    }

    fn bootstrap(
        disk: Arc<DiskSpaceManager>,
        log_backend: Box<dyn StorageBackend>,
        sync_on_flush: bool,
    ) -> CoreResult<Self> {
        let buffer = Arc::new(BufferManager::new(Arc::clone(&disk)));
        let log = Arc::new(LogManager::new(log_backend, sync_on_flush));
        let lock_table = Arc::new(LockTable::new());
        let db_context = LockContext::root(Arc::clone(&lock_table), "database");

        let is_new = log.end_lsn()? == Lsn::new(0);
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&disk),
            Arc::clone(&buffer),
            Arc::clone(&log),
            Box::new(|num| Arc::new(Transaction::new(num))),
        ));
        buffer.set_flush_hooks(Arc::clone(&recovery) as Arc<dyn FlushHooks>);

        if is_new {
            info!("initializing fresh database");
            recovery.initialize()?;
        }
        // Restart runs on every open; on a fresh log it only replays the
        // initial checkpoint and arms the disk-write hooks.
        recovery.restart()?;

        // Transaction numbers continue after everything the log has seen.
        let mut max_seen = 0;
        for item in log.scan_from(Lsn::new(0)) {
            let (_, record) = item?;
            if let Some(trans_num) = record.trans_num() {
                max_seen = max_seen.max(trans_num.as_u64());
            }
        }

        Ok(Self {
            disk,
            buffer,
            lock_table,
            db_context,
            recovery,
            next_trans_num: AtomicU64::new(max_seen + 1),
        })
    }

    /// Starts a new transaction.
    #[must_use]
    pub fn begin(&self) -> Arc<Transaction> {
        let trans_num = TransactionId::new(self.next_trans_num.fetch_add(1, Ordering::SeqCst));
        let transaction = Arc::new(Transaction::new(trans_num));

        let weak = Arc::downgrade(&transaction);
        let table = Arc::clone(&self.lock_table);
        let root = Arc::clone(&self.db_context);
        transaction.set_cleanup(move || {
            if let Some(transaction) = weak.upgrade() {
                release_all_locks(&root, &table, &transaction);
            }
        });

        self.recovery.start_transaction(Arc::clone(&transaction));
        transaction
    }

    /// Commits a transaction: the commit record is durable before this
    /// returns, and all of the transaction's locks are released.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is unknown or a log write
    /// fails.
    pub fn commit(&self, transaction: &Arc<Transaction>) -> CoreResult<()> {
        let trans_num = transaction.trans_num();
        self.recovery.commit(trans_num)?;
        self.recovery.end(trans_num)?;
        transaction.cleanup();
        Ok(())
    }

    /// Aborts a transaction: every change is rolled back (with
    /// compensation records in the log) and its locks are released.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is unknown or the rollback
    /// fails.
    pub fn abort(&self, transaction: &Arc<Transaction>) -> CoreResult<()> {
        let trans_num = transaction.trans_num();
        self.recovery.abort(trans_num)?;
        self.recovery.end(trans_num)?;
        transaction.cleanup();
        Ok(())
    }

    /// Allocates a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or logging fails.
    pub fn alloc_part(&self, transaction: &Arc<Transaction>) -> CoreResult<u32> {
        let part = self.disk.alloc_part()?;
        self.recovery
            .log_alloc_part(transaction.trans_num(), part)?;
        Ok(part)
    }

    /// Allocates a page in `part`.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or logging fails.
    pub fn alloc_page(&self, transaction: &Arc<Transaction>, part: u32) -> CoreResult<u64> {
        ensure_lock_held(transaction, &self.part_context(part), LockMode::X)?;
        let page_num = self.disk.alloc_page(part)?;
        self.recovery
            .log_alloc_page(transaction.trans_num(), page_num)?;
        Ok(page_num)
    }

    /// Frees a page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not allocated or logging fails.
    pub fn free_page(&self, transaction: &Arc<Transaction>, page_num: u64) -> CoreResult<()> {
        ensure_lock_held(transaction, &self.page_context(page_num), LockMode::X)?;
        self.recovery
            .log_free_page(transaction.trans_num(), page_num)?;
        self.buffer.discard(page_num);
        self.disk.free_page(page_num)?;
        Ok(())
    }

    /// Reads `len` bytes at `offset` of a page under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns an error if locking or the read fails.
    pub fn page_read(
        &self,
        transaction: &Arc<Transaction>,
        page_num: u64,
        offset: u16,
        len: usize,
    ) -> CoreResult<Vec<u8>> {
        ensure_lock_held(transaction, &self.page_context(page_num), LockMode::S)?;
        let page = self.buffer.fetch_page(page_num)?;
        Ok(page.read(usize::from(offset), len)?)
    }

    /// Writes `after` at `offset` of a page under an exclusive lock,
    /// write-ahead logging the change.
    ///
    /// # Errors
    ///
    /// Returns an error if locking, logging, or the write fails.
    pub fn page_write(
        &self,
        transaction: &Arc<Transaction>,
        page_num: u64,
        offset: u16,
        after: &[u8],
    ) -> CoreResult<Lsn> {
        ensure_lock_held(transaction, &self.page_context(page_num), LockMode::X)?;
        let page = self.buffer.fetch_page(page_num)?;
        let before = page.read(usize::from(offset), after.len())?;

        let lsn = self.recovery.log_page_write(
            transaction.trans_num(),
            page_num,
            offset,
            &before,
            after,
        )?;
        page.write(usize::from(offset), after)?;
        page.set_page_lsn(lsn.as_u64());
        Ok(lsn)
    }

    /// Records a savepoint for later partial rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is unknown.
    pub fn savepoint(&self, transaction: &Arc<Transaction>, name: &str) -> CoreResult<()> {
        self.recovery.savepoint(transaction.trans_num(), name)
    }

    /// Rolls the transaction back to a savepoint; it keeps running.
    ///
    /// # Errors
    ///
    /// Returns an error if the savepoint is unknown or the rollback fails.
    pub fn rollback_to_savepoint(
        &self,
        transaction: &Arc<Transaction>,
        name: &str,
    ) -> CoreResult<()> {
        self.recovery
            .rollback_to_savepoint(transaction.trans_num(), name)
    }

    /// Takes a fuzzy checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if a log write fails.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.recovery.checkpoint()
    }

    /// Flushes all buffered pages and takes a final checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing or the checkpoint fails.
    pub fn close(&self) -> CoreResult<()> {
        self.buffer.flush_all()?;
        self.disk.sync()?;
        self.recovery.close()
    }

    /// The root of the lock hierarchy.
    #[must_use]
    pub fn lock_context(&self) -> Arc<LockContext> {
        Arc::clone(&self.db_context)
    }

    /// The lock context of a partition.
    #[must_use]
    pub fn part_context(&self, part: u32) -> Arc<LockContext> {
        self.db_context.child(format!("part{part}"))
    }

    /// The lock context of a page.
    #[must_use]
    pub fn page_context(&self, page_num: u64) -> Arc<LockContext> {
        self.part_context(part_num(page_num))
            .child(format!("page{}", page_index(page_num)))
    }

    /// The recovery manager, for direct driving in tests and tools.
    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// The buffer manager.
    #[must_use]
    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    /// The lock table.
    #[must_use]
    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.lock_table
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

/// Releases every lock a transaction holds, children before parents.
fn release_all_locks(
    root: &Arc<LockContext>,
    table: &Arc<LockTable>,
    transaction: &Arc<Transaction>,
) {
    let mut locks = table.locks_of(transaction.trans_num());
    // Deepest first, so no lock is released while child locks remain.
    locks.sort_by_key(|l| std::cmp::Reverse(l.name.segments().len()));
    for lock in locks {
        let released = LockContext::from_resource_name(root, &lock.name)
            .and_then(|context| context.release(transaction));
        if released.is_err() {
            // Fall back to the flat table so cleanup always completes.
            let _ = table.release(transaction, &lock.name);
        }
    }
}
