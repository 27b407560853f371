// Declarative lock acquisition.
//
// `ensure_sufficient_lock_held` is what request execution actually calls: it
// states the effective lock a plan step needs at a context (NL, S, or X) and
// this module figures out the cheapest sequence of acquires, promotes, and
// escalations that makes it true, bringing ancestors to the right intention
// modes along the way.

use std::sync::Arc;

use super::error::{LockError, LockResult};
use super::lock_context::LockContext;
use super::lock_type::LockType;
use crate::common::TransactionId;

/// Ensures the transaction's effective lock at `ctx` substitutes for
/// `request`, which must be NL, S, or X.
pub fn ensure_sufficient_lock_held(
    ctx: &Arc<LockContext>,
    trans_num: TransactionId,
    request: LockType,
) -> LockResult<()> {
    if !matches!(
        request,
        LockType::NoLock | LockType::Shared | LockType::Exclusive
    ) {
        return Err(LockError::invalid(format!(
            "effective lock requests must be NL, S, or X, not {request}"
        )));
    }

    let effective = ctx.get_effective_lock_type(trans_num);
    if LockType::substitutable(effective, request) {
        return Ok(());
    }

    let explicit = ctx.get_explicit_lock_type(trans_num);
    match explicit {
        // An IX holder that needs to read everything below: S + IX = SIX.
        LockType::IntentExclusive if request == LockType::Shared => {
            ctx.promote(trans_num, LockType::SharedIntentExclusive)
        }
        // Any other intention lock: collapse the subtree, then strengthen
        // the result if escalation only got us S.
        LockType::IntentShared | LockType::IntentExclusive | LockType::SharedIntentExclusive => {
            ctx.escalate(trans_num)?;
            if LockType::substitutable(ctx.get_explicit_lock_type(trans_num), request) {
                return Ok(());
            }
            ensure_ancestor_intents(ctx, trans_num, LockType::IntentExclusive)?;
            ctx.promote(trans_num, LockType::Exclusive)
        }
        // NL or S here: bring the ancestors to the matching intention, then
        // acquire or promote in place.
        _ => {
            let intent = if request == LockType::Exclusive {
                LockType::IntentExclusive
            } else {
                LockType::IntentShared
            };
            ensure_ancestor_intents(ctx, trans_num, intent)?;
            if explicit == LockType::NoLock {
                ctx.acquire(trans_num, request)
            } else {
                ctx.promote(trans_num, request)
            }
        }
    }
}

/// Brings every ancestor of `ctx` to at least `intent`, starting from the
/// root so that each step finds its own parent already satisfied.
fn ensure_ancestor_intents(
    ctx: &Arc<LockContext>,
    trans_num: TransactionId,
    intent: LockType,
) -> LockResult<()> {
    let mut chain = Vec::new();
    let mut current = ctx.parent();
    while let Some(ancestor) = current {
        current = ancestor.parent();
        chain.push(ancestor);
    }
    for ancestor in chain.into_iter().rev() {
        let held = ancestor.get_explicit_lock_type(trans_num);
        if LockType::substitutable(held, intent) {
            continue;
        }
        match held {
            LockType::NoLock => ancestor.acquire(trans_num, intent)?,
            // S + IX = SIX; a plain promotion to IX would lose the S.
            LockType::Shared if intent == LockType::IntentExclusive => {
                ancestor.promote(trans_num, LockType::SharedIntentExclusive)?
            }
            _ => ancestor.promote(trans_num, intent)?,
        }
    }
    Ok(())
}
