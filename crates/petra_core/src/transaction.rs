//! Transaction handles, status lattice, and the blocking token.

use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle status of a transaction.
///
/// Statuses only ever advance:
///
/// ```text
/// Running ── commit ──▶ Committing ── end ──▶ Complete
///    │                                           ▲
///    ├── abort ──▶ Aborting ── end (rollback) ───┘
///    │
///    └── crash, restart analysis ──▶ RecoveryAborting ── undo ──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// The transaction is running normally.
    Running,
    /// A commit record has been written; the transaction is finishing.
    Committing,
    /// An abort record has been written; rollback happens at end.
    Aborting,
    /// Restart analysis found the transaction unfinished; the undo phase
    /// will roll it back.
    RecoveryAborting,
    /// The transaction has ended.
    Complete,
}

impl TransactionStatus {
    /// Encodes the status as a single byte for checkpoint records.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Running => 1,
            Self::Committing => 2,
            Self::Aborting => 3,
            Self::RecoveryAborting => 4,
            Self::Complete => 5,
        }
    }

    /// Decodes a status byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Running),
            2 => Some(Self::Committing),
            3 => Some(Self::Aborting),
            4 => Some(Self::RecoveryAborting),
            5 => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Committing => "committing",
            Self::Aborting => "aborting",
            Self::RecoveryAborting => "recovery-aborting",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// A binary-semaphore park token.
///
/// `unblock` deposits a permit; `block` waits for one and consumes it.
/// A permit deposited before the waiter parks is absorbed by the next
/// `block`, which closes the race between a waking grant and the
/// about-to-park requester.
#[derive(Default)]
struct BlockToken {
    permit: Mutex<bool>,
    available: Condvar,
}

impl BlockToken {
    fn wait(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.available.wait(&mut permit);
        }
        *permit = false;
    }

    fn signal(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.available.notify_one();
    }
}

type CleanupHook = Box<dyn FnOnce() + Send>;

/// A transaction handle.
///
/// One thread owns a transaction at a time. The lock table parks that
/// thread through `prepare_block`/`block`/`unblock`: `prepare_block` is
/// called inside the lock table's critical section, the section is left,
/// and only then does the thread park in `block`.
pub struct Transaction {
    num: TransactionId,
    status: Mutex<TransactionStatus>,
    blocked: AtomicBool,
    token: BlockToken,
    cleanup: Mutex<Option<CleanupHook>>,
}

impl Transaction {
    /// Creates a running transaction with the given number.
    #[must_use]
    pub fn new(num: TransactionId) -> Self {
        Self {
            num,
            status: Mutex::new(TransactionStatus::Running),
            blocked: AtomicBool::new(false),
            token: BlockToken::default(),
            cleanup: Mutex::new(None),
        }
    }

    /// The transaction number.
    #[must_use]
    pub fn trans_num(&self) -> TransactionId {
        self.num
    }

    /// The current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    /// Sets the status.
    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    /// Marks the transaction as about to block.
    ///
    /// Must be called while still inside the lock table's critical section,
    /// so that a grant racing with the park sees the transaction as blocked
    /// and its wakeup is preserved.
    pub fn prepare_block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    /// Parks the calling thread until the transaction is unblocked.
    ///
    /// Must be called outside the lock table's critical section. A wakeup
    /// that already arrived is consumed without parking.
    pub fn block(&self) {
        self.token.wait();
        self.blocked.store(false, Ordering::SeqCst);
    }

    /// Wakes the transaction's parked thread (or pre-arms the next park).
    pub fn unblock(&self) {
        self.token.signal();
    }

    /// Whether the transaction is blocked or about to block.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Installs a hook run once by [`Transaction::cleanup`].
    ///
    /// The database uses this to release the transaction's locks when it
    /// finishes or is rolled back during recovery.
    pub fn set_cleanup(&self, hook: impl FnOnce() + Send + 'static) {
        *self.cleanup.lock() = Some(Box::new(hook));
    }

    /// Releases the transaction's resources. Idempotent.
    pub fn cleanup(&self) {
        let hook = self.cleanup.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("num", &self.num)
            .field("status", &self.status())
            .field("blocked", &self.is_blocked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn status_byte_round_trip() {
        for status in [
            TransactionStatus::Running,
            TransactionStatus::Committing,
            TransactionStatus::Aborting,
            TransactionStatus::RecoveryAborting,
            TransactionStatus::Complete,
        ] {
            assert_eq!(TransactionStatus::from_byte(status.as_byte()), Some(status));
        }
        assert_eq!(TransactionStatus::from_byte(0), None);
    }

    #[test]
    fn unblock_before_block_is_absorbed() {
        let txn = Transaction::new(TransactionId::new(1));
        txn.prepare_block();
        txn.unblock();
        // Does not park: the permit was deposited before the park.
        txn.block();
        assert!(!txn.is_blocked());
    }

    #[test]
    fn block_parks_until_unblocked() {
        let txn = Arc::new(Transaction::new(TransactionId::new(1)));
        txn.prepare_block();

        let waiter = {
            let txn = Arc::clone(&txn);
            std::thread::spawn(move || {
                txn.block();
            })
        };

        // Give the waiter time to park, then wake it.
        std::thread::sleep(Duration::from_millis(50));
        assert!(txn.is_blocked());
        txn.unblock();
        waiter.join().unwrap();
        assert!(!txn.is_blocked());
    }

    #[test]
    fn cleanup_runs_once() {
        let txn = Transaction::new(TransactionId::new(1));
        let count = Arc::new(std::sync::atomic::AtomicU64::new(0));
        {
            let count = Arc::clone(&count);
            txn.set_cleanup(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        txn.cleanup();
        txn.cleanup();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
