//! Declarative lock acquisition.
//!
//! [`ensure_lock_held`] is the interface the rest of the engine uses to
//! take locks: state what you need (`S`, `X`, or nothing) at a context,
//! and the facade acquires, promotes, and escalates as needed - granting
//! the least permissive set of locks that suffices.

use crate::concurrency::{LockContext, LockMode};
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use std::sync::Arc;

/// Ensures `transaction` can perform actions requiring `request` on
/// `context`.
///
/// `request` must be `S`, `X`, or `NL`. On return, the transaction's
/// effective mode at `context` substitutes `request`, and every ancestor
/// holds an intent mode sufficient for the explicit mode here.
///
/// # Errors
///
/// Returns [`CoreError::InvalidLock`] for intent-mode requests, or any
/// error from the underlying context operations.
pub fn ensure_lock_held(
    transaction: &Arc<Transaction>,
    context: &Arc<LockContext>,
    request: LockMode,
) -> CoreResult<()> {
    if request.is_intent() {
        return Err(CoreError::invalid_lock(format!(
            "lock requests must be S, X, or NL, got {request}"
        )));
    }

    let trans_num = transaction.trans_num();

    // Nothing to do if the effective mode already suffices (this also
    // covers every NL request).
    let effective = context.effective_mode(trans_num);
    if effective.substitutable(request) {
        return Ok(());
    }

    let explicit = context.explicit_mode(trans_num);

    // Holding IX and needing S: SIX gives both without giving up the
    // write intent.
    if explicit == LockMode::IX && request == LockMode::S {
        ensure_ancestor_lock(transaction, context.parent_context(), LockMode::IX)?;
        return context.promote(transaction, LockMode::SIX);
    }

    // Any other intent lock: collapse the subtree first, then promote if
    // the escalated mode still does not suffice.
    let explicit = if explicit.is_intent() {
        context.escalate(transaction)?;
        let escalated = context.explicit_mode(trans_num);
        if escalated.substitutable(request) {
            return Ok(());
        }
        escalated
    } else {
        explicit
    };

    // The explicit mode is now NL, S, or X.
    ensure_ancestor_lock(transaction, context.parent_context(), request.parent_of())?;
    if explicit == LockMode::NL {
        context.acquire(transaction, request)
    } else {
        context.promote(transaction, request)
    }
}

/// Ensures `context` (an ancestor of the request site) holds a mode that
/// substitutes `required`, fixing ancestors above it first.
fn ensure_ancestor_lock(
    transaction: &Arc<Transaction>,
    context: Option<Arc<LockContext>>,
    required: LockMode,
) -> CoreResult<()> {
    let Some(context) = context else {
        return Ok(());
    };

    let trans_num = transaction.trans_num();
    let held = context.explicit_mode(trans_num);
    if held.substitutable(required) {
        return Ok(());
    }

    ensure_ancestor_lock(transaction, context.parent_context(), required)?;
    if held == LockMode::NL {
        context.acquire(transaction, required)
    } else if held.is_intent() {
        context.promote(transaction, required)
    } else {
        // A non-intent S ancestor that must also carry write intent.
        context.promote(transaction, LockMode::SIX)
    }
}
