//! The flat per-resource lock table.
//!
//! The lock table tracks which transactions hold which locks on which
//! resources and queues requests that cannot be granted. It knows nothing
//! about granularity; the hierarchy lives in
//! [`LockContext`](super::LockContext), which should be used instead of
//! calling the table directly.
//!
//! Each resource has a FIFO queue of waiting requests. The queue is
//! processed on every release, front to back, stopping at the first request
//! that cannot be granted: with a queue of `S X S`, only the first `S` is
//! drained when the holder releases.

use crate::concurrency::{LockMode, ResourceName};
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// The locked resource.
    pub name: ResourceName,
    /// The held mode.
    pub mode: LockMode,
    /// The holding transaction.
    pub trans_num: TransactionId,
}

/// A queued request: the lock to grant, and the locks to release once it
/// has been granted.
struct LockRequest {
    transaction: Arc<Transaction>,
    lock: Lock,
    release_locks: Vec<Lock>,
}

#[derive(Default)]
struct ResourceEntry {
    /// Granted locks, in grant order.
    granted: Vec<Lock>,
    /// Requests waiting for the resource, front is next in line.
    waiters: VecDeque<LockRequest>,
}

#[derive(Default)]
struct TableState {
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Locks held by each transaction, in acquisition order.
    by_transaction: HashMap<TransactionId, Vec<Lock>>,
}

/// The flat lock table.
///
/// All operations run under a single table-wide critical section. A request
/// that must wait is prepared for blocking inside the section and parks
/// only after leaving it, so a wakeup racing with the park is never lost.
/// Blocked transactions wait indefinitely; avoiding deadlock is the
/// caller's responsibility (locks are acquired top-down in the hierarchy).
pub struct LockTable {
    state: Mutex<TableState>,
}

impl LockTable {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState::default()),
        }
    }

    /// Acquires a `mode` lock on `name` for `transaction`.
    ///
    /// Blocks if the lock conflicts with another transaction's lock or if
    /// other requests are already queued on the resource; the request then
    /// waits at the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateLockRequest`] if the transaction
    /// already holds a lock on `name`.
    pub fn acquire(
        &self,
        transaction: &Arc<Transaction>,
        name: &ResourceName,
        mode: LockMode,
    ) -> CoreResult<()> {
        let trans_num = transaction.trans_num();
        let mut should_block = false;
        {
            let mut state = self.state.lock();

            let held = Self::mode_in(&state, trans_num, name);
            if held != LockMode::NL {
                return Err(CoreError::duplicate_lock_request(format!(
                    "{trans_num} requested a {mode} lock on {name}, but already holds {held}"
                )));
            }

            let lock = Lock {
                name: name.clone(),
                mode,
                trans_num,
            };
            let entry = state.resources.entry(name.clone()).or_default();
            if Self::check_compatible(entry, mode, trans_num) && entry.waiters.is_empty() {
                Self::grant_or_update(&mut state, lock);
            } else {
                transaction.prepare_block();
                should_block = true;
                entry.waiters.push_back(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    release_locks: Vec::new(),
                });
            }
        }

        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Acquires a `mode` lock on `name` and releases the locks on
    /// `release_names`, as one atomic step.
    ///
    /// Other transactions observe either the state before the call or the
    /// state after it, never an intermediate. If the new lock conflicts,
    /// the combined request waits at the *front* of the queue and the
    /// releases happen when it is eventually granted.
    ///
    /// Re-acquiring `name` (when it appears in `release_names`) keeps the
    /// lock's position in the grant order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateLockRequest`] if a lock on `name` is
    /// held and not being released, or [`CoreError::NoLockHeld`] if any
    /// name in `release_names` is not held.
    pub fn acquire_and_release(
        &self,
        transaction: &Arc<Transaction>,
        name: &ResourceName,
        mode: LockMode,
        release_names: &[ResourceName],
    ) -> CoreResult<()> {
        let trans_num = transaction.trans_num();
        let mut should_block = false;
        {
            let mut state = self.state.lock();

            let held = Self::mode_in(&state, trans_num, name);
            if held != LockMode::NL && !release_names.contains(name) {
                return Err(CoreError::duplicate_lock_request(format!(
                    "{trans_num} requested a {mode} lock on {name}, but already holds {held}"
                )));
            }
            for release_name in release_names {
                if Self::mode_in(&state, trans_num, release_name) == LockMode::NL {
                    return Err(CoreError::no_lock_held(format!(
                        "{trans_num} does not hold a lock on {release_name}"
                    )));
                }
            }

            // Everything the transaction holds on the release set, except
            // the target itself (that lock is replaced, not released).
            let release_locks: Vec<Lock> = state
                .by_transaction
                .get(&trans_num)
                .map(|locks| {
                    locks
                        .iter()
                        .filter(|l| l.name != *name && release_names.contains(&l.name))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let lock = Lock {
                name: name.clone(),
                mode,
                trans_num,
            };
            let entry = state.resources.entry(name.clone()).or_default();
            if Self::check_compatible(entry, mode, trans_num) {
                Self::grant_or_update(&mut state, lock);
                for release in release_locks {
                    Self::release_lock(&mut state, &release);
                }
            } else {
                transaction.prepare_block();
                should_block = true;
                entry.waiters.push_front(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    release_locks,
                });
            }
        }

        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Releases `transaction`'s lock on `name` and processes the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoLockHeld`] if no lock on `name` is held.
    pub fn release(&self, transaction: &Arc<Transaction>, name: &ResourceName) -> CoreResult<()> {
        let trans_num = transaction.trans_num();
        let mut state = self.state.lock();

        let mode = Self::mode_in(&state, trans_num, name);
        if mode == LockMode::NL {
            return Err(CoreError::no_lock_held(format!(
                "{trans_num} does not hold a lock on {name}"
            )));
        }
        let lock = Lock {
            name: name.clone(),
            mode,
            trans_num,
        };
        Self::release_lock(&mut state, &lock);
        Ok(())
    }

    /// Promotes `transaction`'s lock on `name` to `new_mode`.
    ///
    /// Promotion keeps the lock's position in the grant order. If the new
    /// mode conflicts with another transaction's lock, the request waits at
    /// the *front* of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateLockRequest`] if `new_mode` is already
    /// held, [`CoreError::NoLockHeld`] if no lock is held, or
    /// [`CoreError::InvalidLock`] if `new_mode` is not substitutable for
    /// the held mode.
    pub fn promote(
        &self,
        transaction: &Arc<Transaction>,
        name: &ResourceName,
        new_mode: LockMode,
    ) -> CoreResult<()> {
        let trans_num = transaction.trans_num();
        let mut should_block = false;
        {
            let mut state = self.state.lock();
            Self::validate_promotion(&state, trans_num, name, new_mode)?;

            let lock = Lock {
                name: name.clone(),
                mode: new_mode,
                trans_num,
            };
            let entry = state.resources.entry(name.clone()).or_default();
            if Self::check_compatible(entry, new_mode, trans_num) {
                Self::grant_or_update(&mut state, lock);
            } else {
                transaction.prepare_block();
                should_block = true;
                entry.waiters.push_front(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    release_locks: Vec::new(),
                });
            }
        }

        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// The mode `trans_num` holds on `name`, or `NL`.
    #[must_use]
    pub fn mode_held(&self, trans_num: TransactionId, name: &ResourceName) -> LockMode {
        Self::mode_in(&self.state.lock(), trans_num, name)
    }

    /// The locks held on `name`, in grant order.
    #[must_use]
    pub fn locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|e| e.granted.clone())
            .unwrap_or_default()
    }

    /// The locks held by `trans_num`, in acquisition order.
    #[must_use]
    pub fn locks_of(&self, trans_num: TransactionId) -> Vec<Lock> {
        self.state
            .lock()
            .by_transaction
            .get(&trans_num)
            .cloned()
            .unwrap_or_default()
    }

    /// The number of requests waiting on `name`.
    #[cfg(test)]
    pub(crate) fn queue_len(&self, name: &ResourceName) -> usize {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|e| e.waiters.len())
            .unwrap_or(0)
    }

    /// Validates a promotion without performing it. Used by the hierarchy
    /// layer before a promotion that goes through `acquire_and_release`.
    pub(crate) fn check_promotion(
        &self,
        trans_num: TransactionId,
        name: &ResourceName,
        new_mode: LockMode,
    ) -> CoreResult<()> {
        Self::validate_promotion(&self.state.lock(), trans_num, name, new_mode)
    }

    fn validate_promotion(
        state: &TableState,
        trans_num: TransactionId,
        name: &ResourceName,
        new_mode: LockMode,
    ) -> CoreResult<()> {
        let held = Self::mode_in(state, trans_num, name);
        if held == new_mode {
            return Err(CoreError::duplicate_lock_request(format!(
                "{trans_num} requested promotion to {new_mode} on {name}, but already holds it"
            )));
        }
        if held == LockMode::NL {
            return Err(CoreError::no_lock_held(format!(
                "{trans_num} does not hold a lock on {name}"
            )));
        }
        if !new_mode.substitutable(held) {
            return Err(CoreError::invalid_lock(format!(
                "{trans_num} holds {held} on {name}; {new_mode} is not substitutable for {held}"
            )));
        }
        Ok(())
    }

    fn mode_in(state: &TableState, trans_num: TransactionId, name: &ResourceName) -> LockMode {
        state
            .resources
            .get(name)
            .and_then(|entry| {
                entry
                    .granted
                    .iter()
                    .find(|l| l.trans_num == trans_num)
                    .map(|l| l.mode)
            })
            .unwrap_or(LockMode::NL)
    }

    /// Whether `mode` is compatible with every granted lock on the entry,
    /// ignoring locks held by `except` (a transaction replacing its own
    /// lock does not conflict with itself).
    fn check_compatible(entry: &ResourceEntry, mode: LockMode, except: TransactionId) -> bool {
        entry
            .granted
            .iter()
            .filter(|l| l.trans_num != except)
            .all(|l| l.mode.compatible(mode))
    }

    /// Grants `lock`, or updates the transaction's existing lock on the
    /// resource in place, preserving its position in the grant order.
    fn grant_or_update(state: &mut TableState, lock: Lock) {
        let entry = state.resources.entry(lock.name.clone()).or_default();
        if let Some(existing) = entry
            .granted
            .iter_mut()
            .find(|l| l.trans_num == lock.trans_num)
        {
            existing.mode = lock.mode;
            if let Some(held) = state
                .by_transaction
                .get_mut(&lock.trans_num)
                .and_then(|locks| locks.iter_mut().find(|l| l.name == lock.name))
            {
                held.mode = lock.mode;
            }
            return;
        }

        entry.granted.push(lock.clone());
        state
            .by_transaction
            .entry(lock.trans_num)
            .or_default()
            .push(lock);
    }

    /// Removes `lock` and drains the resource's queue.
    fn release_lock(state: &mut TableState, lock: &Lock) {
        if let Some(entry) = state.resources.get_mut(&lock.name) {
            entry
                .granted
                .retain(|l| !(l.trans_num == lock.trans_num && l.name == lock.name));
        }
        if let Some(locks) = state.by_transaction.get_mut(&lock.trans_num) {
            locks.retain(|l| l.name != lock.name);
        }
        Self::process_queue(state, &lock.name);
    }

    /// Grants queued requests front to back, stopping at the first request
    /// that cannot be granted. A granted request performs its releases
    /// (draining those queues in turn) and wakes its transaction.
    fn process_queue(state: &mut TableState, name: &ResourceName) {
        loop {
            let request = {
                let Some(entry) = state.resources.get_mut(name) else {
                    return;
                };
                let Some(front) = entry.waiters.front() else {
                    return;
                };
                if !Self::check_compatible(entry, front.lock.mode, front.lock.trans_num) {
                    return;
                }
                let Some(request) = entry.waiters.pop_front() else {
                    return;
                };
                request
            };

            Self::grant_or_update(state, request.lock);
            for release in &request.release_locks {
                Self::release_lock(state, release);
            }
            request.transaction.unblock();
        }
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockTable")
            .field("resources", &state.resources.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::LockMode::*;
    use std::time::{Duration, Instant};

    fn txn(num: u64) -> Arc<Transaction> {
        Arc::new(Transaction::new(TransactionId::new(num)))
    }

    fn res(name: &str) -> ResourceName {
        ResourceName::root(name)
    }

    /// Spins until the transaction reports blocked, so tests can observe a
    /// parked waiter deterministically.
    fn wait_until_blocked(t: &Arc<Transaction>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !t.is_blocked() {
            assert!(Instant::now() < deadline, "transaction never blocked");
            std::thread::yield_now();
        }
    }

    #[test]
    fn acquire_grants_compatible_locks() {
        let table = LockTable::new();
        let (t1, t2) = (txn(1), txn(2));
        let a = res("a");

        table.acquire(&t1, &a, S).unwrap();
        table.acquire(&t2, &a, S).unwrap();

        assert_eq!(table.mode_held(t1.trans_num(), &a), S);
        assert_eq!(table.mode_held(t2.trans_num(), &a), S);
        assert_eq!(table.locks_on(&a).len(), 2);
    }

    #[test]
    fn duplicate_acquire_rejected() {
        let table = LockTable::new();
        let t1 = txn(1);
        let a = res("a");

        table.acquire(&t1, &a, S).unwrap();
        let err = table.acquire(&t1, &a, X).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateLockRequest { .. }));
        // Validation happens before mutation.
        assert_eq!(table.mode_held(t1.trans_num(), &a), S);
        assert_eq!(table.queue_len(&a), 0);
    }

    #[test]
    fn release_without_lock_rejected() {
        let table = LockTable::new();
        let t1 = txn(1);
        let err = table.release(&t1, &res("a")).unwrap_err();
        assert!(matches!(err, CoreError::NoLockHeld { .. }));
    }

    #[test]
    fn conflicting_acquire_blocks_until_release() {
        let table = Arc::new(LockTable::new());
        let (t1, t2) = (txn(1), txn(2));
        let a = res("a");

        table.acquire(&t1, &a, X).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            let t2 = Arc::clone(&t2);
            let a = a.clone();
            std::thread::spawn(move || {
                table.acquire(&t2, &a, S).unwrap();
            })
        };

        wait_until_blocked(&t2);
        assert_eq!(table.mode_held(t2.trans_num(), &a), NL);
        assert_eq!(table.queue_len(&a), 1);

        table.release(&t1, &a).unwrap();
        waiter.join().unwrap();
        assert_eq!(table.mode_held(t2.trans_num(), &a), S);
    }

    #[test]
    fn acquire_behind_nonempty_queue_blocks_even_if_compatible() {
        let table = Arc::new(LockTable::new());
        let (t1, t2, t3) = (txn(1), txn(2), txn(3));
        let a = res("a");

        table.acquire(&t1, &a, S).unwrap();

        // t2 requests X: conflicts, queues.
        let w2 = {
            let (table, t2, a) = (Arc::clone(&table), Arc::clone(&t2), a.clone());
            std::thread::spawn(move || table.acquire(&t2, &a, X).unwrap())
        };
        wait_until_blocked(&t2);

        // t3 requests S: compatible with the granted S, but the queue is
        // non-empty, so it must wait behind t2.
        let w3 = {
            let (table, t3, a) = (Arc::clone(&table), Arc::clone(&t3), a.clone());
            std::thread::spawn(move || table.acquire(&t3, &a, S).unwrap())
        };
        wait_until_blocked(&t3);
        assert_eq!(table.queue_len(&a), 2);

        table.release(&t1, &a).unwrap();
        w2.join().unwrap();
        assert_eq!(table.mode_held(t2.trans_num(), &a), X);
        // t3 still waits behind t2's X.
        assert!(t3.is_blocked());

        table.release(&t2, &a).unwrap();
        w3.join().unwrap();
        assert_eq!(table.mode_held(t3.trans_num(), &a), S);
    }

    #[test]
    fn strict_fifo_head_of_line() {
        // queue: S(t2) X(t3) S(t4); releasing the X holder grants only the
        // first S, because the X behind it blocks further drainage.
        let table = Arc::new(LockTable::new());
        let (t1, t2, t3, t4) = (txn(1), txn(2), txn(3), txn(4));
        let a = res("a");

        table.acquire(&t1, &a, X).unwrap();

        let mut waiters = Vec::new();
        for (t, mode) in [(&t2, S), (&t3, X), (&t4, S)] {
            let (table, t, a) = (Arc::clone(&table), Arc::clone(t), a.clone());
            let t_wait = Arc::clone(&t);
            waiters.push(std::thread::spawn(move || table.acquire(&t, &a, mode).unwrap()));
            wait_until_blocked(&t_wait);
        }
        assert_eq!(table.queue_len(&a), 3);

        table.release(&t1, &a).unwrap();
        waiters.remove(0).join().unwrap();

        assert_eq!(table.mode_held(t2.trans_num(), &a), S);
        assert_eq!(table.mode_held(t3.trans_num(), &a), NL);
        assert_eq!(table.mode_held(t4.trans_num(), &a), NL);
        assert_eq!(table.queue_len(&a), 2);

        // Clean up the remaining waiters.
        table.release(&t2, &a).unwrap();
        waiters.remove(0).join().unwrap();
        table.release(&t3, &a).unwrap();
        waiters.remove(0).join().unwrap();
    }

    #[test]
    fn promote_replaces_in_place() {
        let table = LockTable::new();
        let (t1, t2) = (txn(1), txn(2));
        let a = res("a");

        table.acquire(&t1, &a, IS).unwrap();
        table.acquire(&t2, &a, IS).unwrap();
        table.promote(&t1, &a, IX).unwrap();

        let locks = table.locks_on(&a);
        assert_eq!(locks[0].trans_num, t1.trans_num());
        assert_eq!(locks[0].mode, IX);
        assert_eq!(locks[1].trans_num, t2.trans_num());
    }

    #[test]
    fn promote_validations() {
        let table = LockTable::new();
        let t1 = txn(1);
        let a = res("a");

        assert!(matches!(
            table.promote(&t1, &a, X).unwrap_err(),
            CoreError::NoLockHeld { .. }
        ));

        table.acquire(&t1, &a, S).unwrap();
        assert!(matches!(
            table.promote(&t1, &a, S).unwrap_err(),
            CoreError::DuplicateLockRequest { .. }
        ));
        // S -> IS is a downgrade, not a promotion.
        assert!(matches!(
            table.promote(&t1, &a, IS).unwrap_err(),
            CoreError::InvalidLock { .. }
        ));
        assert_eq!(table.mode_held(t1.trans_num(), &a), S);
    }

    #[test]
    fn conflicting_promote_waits_at_front() {
        let table = Arc::new(LockTable::new());
        let (t1, t2, t3) = (txn(1), txn(2), txn(3));
        let a = res("a");

        table.acquire(&t1, &a, S).unwrap();
        table.acquire(&t2, &a, S).unwrap();

        // t3 queues an S acquire behind nothing... first make the queue
        // non-empty with a conflicting request so ordering is observable.
        let w3 = {
            let (table, t3, a) = (Arc::clone(&table), Arc::clone(&t3), a.clone());
            std::thread::spawn(move || table.acquire(&t3, &a, X).unwrap())
        };
        wait_until_blocked(&t3);

        // t1's promotion to X conflicts with t2's S and goes to the FRONT,
        // ahead of t3.
        let w1 = {
            let (table, t1, a) = (Arc::clone(&table), Arc::clone(&t1), a.clone());
            std::thread::spawn(move || table.promote(&t1, &a, X).unwrap())
        };
        wait_until_blocked(&t1);
        assert_eq!(table.queue_len(&a), 2);

        table.release(&t2, &a).unwrap();
        w1.join().unwrap();
        assert_eq!(table.mode_held(t1.trans_num(), &a), X);
        assert!(t3.is_blocked());

        table.release(&t1, &a).unwrap();
        w3.join().unwrap();
    }

    #[test]
    fn acquire_and_release_swaps_atomically() {
        let table = LockTable::new();
        let t1 = txn(1);
        let a = res("a");
        let b = res("b");

        table.acquire(&t1, &a, S).unwrap();
        table.acquire(&t1, &b, S).unwrap();

        // Upgrade a to X while dropping b.
        table
            .acquire_and_release(&t1, &a, X, &[a.clone(), b.clone()])
            .unwrap();
        assert_eq!(table.mode_held(t1.trans_num(), &a), X);
        assert_eq!(table.mode_held(t1.trans_num(), &b), NL);
    }

    #[test]
    fn acquire_and_release_keeps_grant_order() {
        let table = LockTable::new();
        let t1 = txn(1);
        let a = res("a");
        let b = res("b");

        table.acquire(&t1, &a, S).unwrap();
        table.acquire(&t1, &b, X).unwrap();
        table.acquire_and_release(&t1, &a, X, &[a.clone()]).unwrap();

        // The lock on a kept its original acquisition position.
        let locks = table.locks_of(t1.trans_num());
        assert_eq!(locks[0].name, a);
        assert_eq!(locks[0].mode, X);
        assert_eq!(locks[1].name, b);
    }

    #[test]
    fn acquire_and_release_validates_release_set() {
        let table = LockTable::new();
        let t1 = txn(1);
        let a = res("a");
        let b = res("b");

        table.acquire(&t1, &a, S).unwrap();
        let err = table
            .acquire_and_release(&t1, &a, X, &[a.clone(), b.clone()])
            .unwrap_err();
        assert!(matches!(err, CoreError::NoLockHeld { .. }));
        // No partial mutation.
        assert_eq!(table.mode_held(t1.trans_num(), &a), S);

        let err = table.acquire_and_release(&t1, &a, X, &[]).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn release_in_queue_drain_cascades() {
        // A queued acquire-and-release, once granted, performs its releases,
        // which drain other resources' queues in turn.
        let table = Arc::new(LockTable::new());
        let (t1, t2, t3) = (txn(1), txn(2), txn(3));
        let a = res("a");
        let b = res("b");

        table.acquire(&t1, &a, X).unwrap();
        table.acquire(&t2, &b, X).unwrap();

        // t2 wants to trade X(b) for X(a); conflicts with t1's X(a).
        let w2 = {
            let (table, t2) = (Arc::clone(&table), Arc::clone(&t2));
            let (a, b) = (a.clone(), b.clone());
            std::thread::spawn(move || {
                table.acquire_and_release(&t2, &a, X, &[b]).unwrap();
            })
        };
        wait_until_blocked(&t2);

        // t3 waits on b, held by t2.
        let w3 = {
            let (table, t3, b) = (Arc::clone(&table), Arc::clone(&t3), b.clone());
            std::thread::spawn(move || table.acquire(&t3, &b, S).unwrap())
        };
        wait_until_blocked(&t3);

        // Releasing a grants t2's swap, whose release of b unblocks t3.
        table.release(&t1, &a).unwrap();
        w2.join().unwrap();
        w3.join().unwrap();

        assert_eq!(table.mode_held(t2.trans_num(), &a), X);
        assert_eq!(table.mode_held(t2.trans_num(), &b), NL);
        assert_eq!(table.mode_held(t3.trans_num(), &b), S);
    }

    #[test]
    fn drained_waiters_satisfy_compatibility() {
        // After any release, every waiter that got granted must be
        // compatible with all other granted locks at that moment.
        let table = Arc::new(LockTable::new());
        let (t1, t2, t3) = (txn(1), txn(2), txn(3));
        let a = res("a");

        table.acquire(&t1, &a, X).unwrap();
        let mut waiters = Vec::new();
        for t in [&t2, &t3] {
            let (table, t, a) = (Arc::clone(&table), Arc::clone(t), a.clone());
            let t_wait = Arc::clone(&t);
            waiters.push(std::thread::spawn(move || table.acquire(&t, &a, S).unwrap()));
            wait_until_blocked(&t_wait);
        }

        // Both S requests drain together.
        table.release(&t1, &a).unwrap();
        for w in waiters {
            w.join().unwrap();
        }

        let locks = table.locks_on(&a);
        assert_eq!(locks.len(), 2);
        for l in &locks {
            for m in &locks {
                if l.trans_num != m.trans_num {
                    assert!(l.mode.compatible(m.mode));
                }
            }
        }
    }

    #[test]
    fn locks_of_is_in_acquisition_order() {
        let table = LockTable::new();
        let t1 = txn(1);
        let (a, b, c) = (res("a"), res("b"), res("c"));

        table.acquire(&t1, &b, S).unwrap();
        table.acquire(&t1, &a, S).unwrap();
        table.acquire(&t1, &c, S).unwrap();

        let names: Vec<_> = table
            .locks_of(t1.trans_num())
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec![b, a, c]);
    }
}
