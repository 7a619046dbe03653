//! The lock context tree: multi-granularity discipline over the flat table.
//!
//! A [`LockContext`] represents one node of the lock hierarchy (the
//! database, a table, a page). Lock acquisition should go through contexts
//! (or the [`ensure_lock_held`](super::ensure_lock_held) facade), which
//! enforce the intent-lock discipline the flat table knows nothing about:
//! a lock may only be granted under a parent whose mode permits it, and a
//! lock cannot be released while locks are held below it.

use crate::concurrency::table::LockTable;
use crate::concurrency::{LockMode, ResourceName};
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A node in the lock hierarchy.
///
/// Contexts form a tree: children are created lazily through
/// [`LockContext::child`] and cached, and each child keeps a non-owning
/// back-reference to its parent. The root is owned by whoever owns the
/// lock table (the database), which keeps every reachable parent alive.
pub struct LockContext {
    table: Arc<LockTable>,
    /// Non-owning handle to this context's own `Arc`, for minting child
    /// back-references.
    this: Weak<LockContext>,
    parent: Option<Weak<LockContext>>,
    name: ResourceName,
    /// Readonly contexts reject all mutating operations.
    readonly: bool,
    /// When set, children created afterwards are readonly.
    child_locks_disabled: AtomicBool,
    /// Per-transaction count of locks held on *direct children* of this
    /// context.
    num_child_locks: Mutex<HashMap<TransactionId, usize>>,
    children: Mutex<HashMap<String, Arc<LockContext>>>,
}

impl LockContext {
    /// Creates the root context of a hierarchy.
    #[must_use]
    pub fn root(table: Arc<LockTable>, name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            table,
            this: this.clone(),
            parent: None,
            name: ResourceName::root(name),
            readonly: false,
            child_locks_disabled: AtomicBool::new(false),
            num_child_locks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the child context for `segment`, creating and caching it if
    /// needed. Children born after [`LockContext::disable_child_locks`]
    /// are readonly.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Arc<LockContext> {
        let segment = segment.into();
        let mut children = self.children.lock();
        if let Some(existing) = children.get(&segment) {
            return Arc::clone(existing);
        }
        let readonly = self.readonly || self.child_locks_disabled.load(Ordering::SeqCst);
        let context = Arc::new_cyclic(|this| Self {
            table: Arc::clone(&self.table),
            this: this.clone(),
            parent: Some(self.this.clone()),
            name: self.name.child(segment.clone()),
            readonly,
            child_locks_disabled: AtomicBool::new(readonly),
            num_child_locks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        });
        children.insert(segment, Arc::clone(&context));
        context
    }

    /// Resolves `name` to a context, walking down from `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `name` does not lie at or
    /// below `root`.
    pub fn from_resource_name(
        root: &Arc<LockContext>,
        name: &ResourceName,
    ) -> CoreResult<Arc<LockContext>> {
        if name == &root.name {
            return Ok(Arc::clone(root));
        }
        if !name.is_descendant_of(&root.name) {
            return Err(CoreError::invalid_operation(format!(
                "{name} is not under {}",
                root.name
            )));
        }
        let mut context = Arc::clone(root);
        for segment in &name.segments()[root.name.segments().len()..] {
            context = context.child(segment.clone());
        }
        Ok(context)
    }

    /// The resource name this context locks.
    #[must_use]
    pub fn resource_name(&self) -> &ResourceName {
        &self.name
    }

    /// The parent context, if this is not a root.
    #[must_use]
    pub fn parent_context(&self) -> Option<Arc<LockContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Acquires a `mode` lock at this level for `transaction`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReadOnlyContext`] if the context is readonly
    /// - [`CoreError::InvalidLock`] if the parent's mode does not permit
    ///   `mode` here, or an ancestor holds `SIX` and `mode` is `S`/`IS`
    ///   (redundant under `SIX`)
    /// - [`CoreError::DuplicateLockRequest`] if a lock is already held
    pub fn acquire(&self, transaction: &Arc<Transaction>, mode: LockMode) -> CoreResult<()> {
        self.check_writable()?;
        let trans_num = transaction.trans_num();
        self.check_parent_permits(trans_num, mode)?;
        if (mode == LockMode::S || mode == LockMode::IS) && self.has_six_ancestor(trans_num) {
            return Err(CoreError::invalid_lock(format!(
                "{trans_num} requested {mode} on {} under an ancestor SIX lock",
                self.name
            )));
        }

        self.table.acquire(transaction, &self.name, mode)?;
        if let Some(parent) = self.parent_context() {
            parent.adjust_child_count(trans_num, 1);
        }
        Ok(())
    }

    /// Releases `transaction`'s lock at this level.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReadOnlyContext`] if the context is readonly
    /// - [`CoreError::InvalidLock`] if the transaction still holds locks on
    ///   children of this context
    /// - [`CoreError::NoLockHeld`] if no lock is held here
    pub fn release(&self, transaction: &Arc<Transaction>) -> CoreResult<()> {
        self.check_writable()?;
        let trans_num = transaction.trans_num();
        if self.num_children(trans_num) != 0 {
            return Err(CoreError::invalid_lock(format!(
                "{trans_num} cannot release {} while holding child locks",
                self.name
            )));
        }

        self.table.release(transaction, &self.name)?;
        if let Some(parent) = self.parent_context() {
            parent.adjust_child_count(trans_num, -1);
        }
        Ok(())
    }

    /// Promotes `transaction`'s lock at this level to `new_mode`.
    ///
    /// Promoting to `SIX` (from `IS`/`IX`/`S`) additionally releases every
    /// `S` and `IS` lock the transaction holds below this context, in the
    /// same atomic step: those locks are redundant under `SIX`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReadOnlyContext`] if the context is readonly
    /// - [`CoreError::DuplicateLockRequest`] if `new_mode` is already held
    /// - [`CoreError::NoLockHeld`] if no lock is held here
    /// - [`CoreError::InvalidLock`] if the promotion is invalid, the parent
    ///   cannot grant `new_mode`, or an ancestor already holds `SIX`
    pub fn promote(&self, transaction: &Arc<Transaction>, new_mode: LockMode) -> CoreResult<()> {
        self.check_writable()?;
        let trans_num = transaction.trans_num();
        self.check_parent_permits(trans_num, new_mode)?;
        self.table.check_promotion(trans_num, &self.name, new_mode)?;

        if new_mode != LockMode::SIX {
            return self.table.promote(transaction, &self.name, new_mode);
        }

        if self.has_six_ancestor(trans_num) {
            return Err(CoreError::invalid_lock(format!(
                "{trans_num} requested promotion to SIX on {} under an ancestor SIX lock",
                self.name
            )));
        }

        // Release the now-redundant shared locks below, atomically with the
        // promotion.
        let sis = self.sis_descendants(trans_num);
        let mut release_names = sis.clone();
        release_names.push(self.name.clone());
        self.table
            .acquire_and_release(transaction, &self.name, LockMode::SIX, &release_names)?;

        for name in &sis {
            let context = self.descendant_context(name)?;
            if let Some(parent) = context.parent_context() {
                parent.adjust_child_count(trans_num, -1);
            }
        }
        Ok(())
    }

    /// Collapses `transaction`'s locks below this context into a single
    /// lock at this level.
    ///
    /// The replacement is `X` if any descendant lock is `X`/`IX`/`SIX`
    /// (something below was writable), otherwise `S`. Every descendant lock
    /// and this context's lock are exchanged for the replacement in one
    /// atomic step. A no-op when the held mode is already `S` or `X`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReadOnlyContext`] if the context is readonly
    /// - [`CoreError::NoLockHeld`] if no lock is held at this level
    pub fn escalate(&self, transaction: &Arc<Transaction>) -> CoreResult<()> {
        self.check_writable()?;
        let trans_num = transaction.trans_num();
        let held = self.explicit_mode(trans_num);
        if held == LockMode::NL {
            return Err(CoreError::no_lock_held(format!(
                "{trans_num} does not hold a lock on {}",
                self.name
            )));
        }
        if held == LockMode::S || held == LockMode::X {
            return Ok(());
        }

        let descendants: Vec<_> = self
            .table
            .locks_of(trans_num)
            .into_iter()
            .filter(|l| l.name.is_descendant_of(&self.name))
            .collect();
        let target = if descendants
            .iter()
            .any(|l| matches!(l.mode, LockMode::X | LockMode::IX | LockMode::SIX))
        {
            LockMode::X
        } else {
            LockMode::S
        };

        let mut release_names: Vec<ResourceName> =
            descendants.into_iter().map(|l| l.name).collect();
        let descendant_names = release_names.clone();
        release_names.push(self.name.clone());
        self.table
            .acquire_and_release(transaction, &self.name, target, &release_names)?;

        for name in &descendant_names {
            let context = self.descendant_context(name)?;
            if let Some(parent) = context.parent_context() {
                parent.adjust_child_count(trans_num, -1);
            }
        }
        Ok(())
    }

    /// The mode `trans_num` holds at exactly this level, or `NL`.
    #[must_use]
    pub fn explicit_mode(&self, trans_num: TransactionId) -> LockMode {
        self.table.mode_held(trans_num, &self.name)
    }

    /// The mode `trans_num` effectively holds at this level, explicitly or
    /// through an ancestor.
    ///
    /// An `S` or `SIX` ancestor grants `S` here; an `X` ancestor grants
    /// `X`. Intent modes at ancestors grant nothing at this level.
    #[must_use]
    pub fn effective_mode(&self, trans_num: TransactionId) -> LockMode {
        let explicit = self.explicit_mode(trans_num);
        if explicit != LockMode::NL {
            return explicit;
        }

        let mut current = self.parent_context();
        while let Some(context) = current {
            match context.explicit_mode(trans_num) {
                LockMode::NL => current = context.parent_context(),
                LockMode::S | LockMode::SIX => return LockMode::S,
                LockMode::X => return LockMode::X,
                LockMode::IS | LockMode::IX => return LockMode::NL,
            }
        }
        LockMode::NL
    }

    /// Disables locking below this context: children created after this
    /// call are readonly. Used for structures locked only as a whole, such
    /// as indices and temporary tables.
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, Ordering::SeqCst);
    }

    /// Whether this context rejects mutating operations.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// The number of locks `trans_num` holds on direct children of this
    /// context.
    #[must_use]
    pub fn num_children(&self, trans_num: TransactionId) -> usize {
        self.num_child_locks
            .lock()
            .get(&trans_num)
            .copied()
            .unwrap_or(0)
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.readonly {
            return Err(CoreError::readonly_context(self.name.to_string()));
        }
        Ok(())
    }

    fn check_parent_permits(&self, trans_num: TransactionId, mode: LockMode) -> CoreResult<()> {
        if let Some(parent) = self.parent_context() {
            let parent_mode = parent.explicit_mode(trans_num);
            if !LockMode::can_be_parent(parent_mode, mode) {
                return Err(CoreError::invalid_lock(format!(
                    "{trans_num} requested {mode} on {} but parent holds {parent_mode}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn has_six_ancestor(&self, trans_num: TransactionId) -> bool {
        let mut current = self.parent_context();
        while let Some(context) = current {
            if context.explicit_mode(trans_num) == LockMode::SIX {
                return true;
            }
            current = context.parent_context();
        }
        false
    }

    /// Names of descendants where `trans_num` holds an `S` or `IS` lock.
    fn sis_descendants(&self, trans_num: TransactionId) -> Vec<ResourceName> {
        self.table
            .locks_of(trans_num)
            .into_iter()
            .filter(|l| {
                l.name.is_descendant_of(&self.name)
                    && matches!(l.mode, LockMode::S | LockMode::IS)
            })
            .map(|l| l.name)
            .collect()
    }

    fn descendant_context(&self, name: &ResourceName) -> CoreResult<Arc<LockContext>> {
        let this = self.this.upgrade().ok_or_else(|| {
            CoreError::invalid_operation(format!("context {} is detached", self.name))
        })?;
        Self::from_resource_name(&this, name)
    }

    fn adjust_child_count(&self, trans_num: TransactionId, delta: i64) {
        let mut counts = self.num_child_locks.lock();
        let entry = counts.entry(trans_num).or_insert(0);
        *entry = (*entry as i64 + delta).max(0) as usize;
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name.to_string())
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::LockMode::*;

    fn setup() -> (Arc<LockTable>, Arc<LockContext>) {
        let table = Arc::new(LockTable::new());
        let db = LockContext::root(Arc::clone(&table), "database");
        (table, db)
    }

    fn txn(num: u64) -> Arc<Transaction> {
        Arc::new(Transaction::new(TransactionId::new(num)))
    }

    #[test]
    fn acquire_requires_parent_intent() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");

        // No lock on the database yet.
        let err = table_ctx.acquire(&t1, S).unwrap_err();
        assert!(matches!(err, CoreError::InvalidLock { .. }));

        db.acquire(&t1, IS).unwrap();
        table_ctx.acquire(&t1, S).unwrap();
        assert_eq!(table_ctx.explicit_mode(t1.trans_num()), S);
        assert_eq!(db.num_children(t1.trans_num()), 1);
    }

    #[test]
    fn intent_mode_must_match_child_strength() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");

        db.acquire(&t1, IS).unwrap();
        // X under IS is not permitted.
        let err = table_ctx.acquire(&t1, X).unwrap_err();
        assert!(matches!(err, CoreError::InvalidLock { .. }));
    }

    #[test]
    fn redundant_shared_lock_under_six_rejected() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");
        let page = table_ctx.child("page1");

        db.acquire(&t1, IX).unwrap();
        table_ctx.acquire(&t1, SIX).unwrap();

        for mode in [S, IS] {
            let err = page.acquire(&t1, mode).unwrap_err();
            assert!(matches!(err, CoreError::InvalidLock { .. }), "{mode}");
        }
        // IX below SIX is fine (for X locks further down).
        page.acquire(&t1, IX).unwrap();
    }

    #[test]
    fn release_with_child_locks_rejected() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");

        db.acquire(&t1, IS).unwrap();
        table_ctx.acquire(&t1, S).unwrap();

        let err = db.release(&t1).unwrap_err();
        assert!(matches!(err, CoreError::InvalidLock { .. }));

        table_ctx.release(&t1).unwrap();
        db.release(&t1).unwrap();
        assert_eq!(db.explicit_mode(t1.trans_num()), NL);
    }

    #[test]
    fn promote_to_six_releases_sis_descendants() {
        let (table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");
        let page1 = table_ctx.child("page1");
        let page2 = table_ctx.child("page2");

        db.acquire(&t1, IX).unwrap();
        table_ctx.acquire(&t1, IS).unwrap();
        page1.acquire(&t1, S).unwrap();
        page2.acquire(&t1, IS).unwrap();

        let db_children_before = db.num_children(t1.trans_num());
        assert_eq!(table_ctx.num_children(t1.trans_num()), 2);

        table_ctx.promote(&t1, SIX).unwrap();

        assert_eq!(table_ctx.explicit_mode(t1.trans_num()), SIX);
        assert_eq!(page1.explicit_mode(t1.trans_num()), NL);
        assert_eq!(page2.explicit_mode(t1.trans_num()), NL);
        assert_eq!(table_ctx.num_children(t1.trans_num()), 0);
        assert_eq!(db.num_children(t1.trans_num()), db_children_before);
        // Only the two remaining locks.
        assert_eq!(table.locks_of(t1.trans_num()).len(), 2);
    }

    #[test]
    fn promote_to_six_under_six_ancestor_rejected() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");
        let page = table_ctx.child("page1");

        db.acquire(&t1, IX).unwrap();
        table_ctx.acquire(&t1, SIX).unwrap();
        page.acquire(&t1, IX).unwrap();

        let err = page.promote(&t1, SIX).unwrap_err();
        assert!(matches!(err, CoreError::InvalidLock { .. }));
    }

    #[test]
    fn escalate_picks_x_for_write_descendants() {
        let (table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");
        let (p1, p2, p3) = (
            table_ctx.child("page1"),
            table_ctx.child("page2"),
            table_ctx.child("page3"),
        );

        db.acquire(&t1, IX).unwrap();
        table_ctx.acquire(&t1, IX).unwrap();
        p1.acquire(&t1, S).unwrap();
        p2.acquire(&t1, IS).unwrap();
        p3.acquire(&t1, X).unwrap();

        table_ctx.escalate(&t1).unwrap();

        assert_eq!(table_ctx.explicit_mode(t1.trans_num()), X);
        for p in [&p1, &p2, &p3] {
            assert_eq!(p.explicit_mode(t1.trans_num()), NL);
        }
        assert_eq!(table_ctx.num_children(t1.trans_num()), 0);
        assert_eq!(table.locks_of(t1.trans_num()).len(), 2);
    }

    #[test]
    fn escalate_picks_s_for_read_descendants() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");
        let page = table_ctx.child("page1");

        db.acquire(&t1, IS).unwrap();
        table_ctx.acquire(&t1, IS).unwrap();
        page.acquire(&t1, S).unwrap();

        table_ctx.escalate(&t1).unwrap();
        assert_eq!(table_ctx.explicit_mode(t1.trans_num()), S);
        assert_eq!(page.explicit_mode(t1.trans_num()), NL);
    }

    #[test]
    fn escalate_is_idempotent() {
        let (table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");
        let page = table_ctx.child("page1");

        db.acquire(&t1, IS).unwrap();
        table_ctx.acquire(&t1, IS).unwrap();
        page.acquire(&t1, S).unwrap();

        table_ctx.escalate(&t1).unwrap();
        let locks_after_first = table.locks_of(t1.trans_num());
        table_ctx.escalate(&t1).unwrap();
        assert_eq!(table.locks_of(t1.trans_num()), locks_after_first);
    }

    #[test]
    fn escalate_without_lock_rejected() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let err = db.child("table1").escalate(&t1).unwrap_err();
        assert!(matches!(err, CoreError::NoLockHeld { .. }));
    }

    #[test]
    fn effective_mode_walks_ancestors() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");
        let page = table_ctx.child("page1");

        assert_eq!(page.effective_mode(t1.trans_num()), NL);

        db.acquire(&t1, IX).unwrap();
        table_ctx.acquire(&t1, SIX).unwrap();
        // SIX at the table grants S at the page.
        assert_eq!(page.effective_mode(t1.trans_num()), S);
        // Intent at the database grants nothing by itself.
        assert_eq!(db.child("table2").effective_mode(t1.trans_num()), NL);
        // Explicit mode wins at its own level.
        assert_eq!(table_ctx.effective_mode(t1.trans_num()), SIX);
    }

    #[test]
    fn effective_mode_from_exclusive_ancestor() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let page = db.child("table1").child("page1");

        db.acquire(&t1, X).unwrap();
        assert_eq!(page.effective_mode(t1.trans_num()), X);
    }

    #[test]
    fn disable_child_locks_makes_new_children_readonly() {
        let (_table, db) = setup();
        let t1 = txn(1);
        let table_ctx = db.child("table1");

        let before = table_ctx.child("page1");
        table_ctx.disable_child_locks();
        let after = table_ctx.child("page2");

        assert!(!before.is_readonly());
        assert!(after.is_readonly());

        db.acquire(&t1, IS).unwrap();
        table_ctx.acquire(&t1, IS).unwrap();
        let err = after.acquire(&t1, S).unwrap_err();
        assert!(matches!(err, CoreError::ReadOnlyContext { .. }));
        // Readonly propagates to grandchildren.
        assert!(after.child("slot").is_readonly());
    }

    #[test]
    fn child_contexts_are_cached() {
        let (_table, db) = setup();
        let a = db.child("table1");
        let b = db.child("table1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn from_resource_name_resolves_paths() {
        let (_table, db) = setup();
        let page = db.child("table1").child("page1");

        let name = ResourceName::root("database").child("table1").child("page1");
        let resolved = LockContext::from_resource_name(&db, &name).unwrap();
        assert!(Arc::ptr_eq(&resolved, &page));

        let outside = ResourceName::root("other");
        assert!(LockContext::from_resource_name(&db, &outside).is_err());
    }
}
