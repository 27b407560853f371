// Lock contexts: the resource hierarchy over the lock manager.
//
// A context wraps one resource name and adds what the flat lock manager
// cannot know: that a lock here needs an intention lock on the parent, that
// releasing here would orphan descendants, and how many locks a transaction
// holds on this node's children. Contexts form a tree rooted at the
// database; children are owned by their parent's child map, while the
// upward reference is weak so the tree has no ownership cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::error::{LockError, LockResult};
use super::lock_manager::LockManager;
use super::lock_type::LockType;
use super::resource::ResourceName;
use crate::common::TransactionId;

/// A node in the lock hierarchy.
pub struct LockContext {
    manager: Arc<LockManager>,
    parent: Option<Weak<LockContext>>,
    name: ResourceName,
    readonly: AtomicBool,
    child_locks_disabled: AtomicBool,
    children: RwLock<HashMap<String, Arc<LockContext>>>,
    child_lock_counts: RwLock<HashMap<TransactionId, usize>>,
}

impl LockContext {
    /// Creates the root context of a hierarchy.
    pub fn new_root(manager: Arc<LockManager>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            parent: None,
            name: ResourceName::root(name),
            readonly: AtomicBool::new(false),
            child_locks_disabled: AtomicBool::new(false),
            children: RwLock::new(HashMap::new()),
            child_lock_counts: RwLock::new(HashMap::new()),
        })
    }

    /// Gets or creates the child context for `segment`.
    pub fn child(self: &Arc<Self>, segment: &str) -> Arc<LockContext> {
        let mut children = self.children.write();
        children
            .entry(segment.to_string())
            .or_insert_with(|| {
                Arc::new(Self {
                    manager: self.manager.clone(),
                    parent: Some(Arc::downgrade(self)),
                    name: self.name.child(segment),
                    readonly: AtomicBool::new(self.child_locks_disabled.load(Ordering::SeqCst)),
                    child_locks_disabled: AtomicBool::new(false),
                    children: RwLock::new(HashMap::new()),
                    child_lock_counts: RwLock::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// This context's resource name.
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// The parent context, if any is still alive.
    pub fn parent(&self) -> Option<Arc<LockContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// True if mutating calls are rejected.
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    /// Turns the context readonly. There is no way back.
    pub fn make_readonly(&self) {
        self.readonly.store(true, Ordering::SeqCst);
    }

    /// Disallows locking below this context: existing children become
    /// readonly, and so does every child created later.
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, Ordering::SeqCst);
        for child in self.children.read().values() {
            child.make_readonly();
        }
    }

    /// Acquires `lock_type` here, enforcing multigranularity constraints.
    pub fn acquire(&self, trans_num: TransactionId, lock_type: LockType) -> LockResult<()> {
        self.check_mutable()?;
        if lock_type == LockType::NoLock {
            return Err(LockError::invalid("NL is never a valid lock request"));
        }
        if let Some(parent) = self.parent() {
            let parent_effective = parent.get_effective_lock_type(trans_num);
            if !LockType::can_be_parent(parent_effective, lock_type) {
                return Err(LockError::invalid(format!(
                    "cannot hold {lock_type} on '{}' under parent lock {parent_effective}",
                    self.name
                )));
            }
        }
        if matches!(lock_type, LockType::IntentShared | LockType::Shared)
            && self.has_six_ancestor(trans_num)
        {
            return Err(LockError::invalid(format!(
                "{lock_type} on '{}' is redundant under a SIX ancestor",
                self.name
            )));
        }
        self.manager
            .acquire(trans_num, self.name.clone(), lock_type)?;
        if let Some(parent) = self.parent() {
            parent.add_child_lock(trans_num);
        }
        Ok(())
    }

    /// Releases the lock here. Denied while the transaction still holds
    /// locks on children of this context.
    pub fn release(&self, trans_num: TransactionId) -> LockResult<()> {
        self.check_mutable()?;
        if self.get_num_children(trans_num) > 0 {
            return Err(LockError::invalid(format!(
                "releasing '{}' would orphan descendant locks",
                self.name
            )));
        }
        self.manager.release(trans_num, &self.name)?;
        if let Some(parent) = self.parent() {
            parent.remove_child_lock(trans_num);
        }
        Ok(())
    }

    /// Promotes the lock here to `new_type`.
    ///
    /// Promoting to SIX swallows the transaction's S/IS descendants: they are
    /// released in the same atomic step that installs the SIX lock.
    pub fn promote(
        self: &Arc<Self>,
        trans_num: TransactionId,
        new_type: LockType,
    ) -> LockResult<()> {
        self.check_mutable()?;
        if new_type == LockType::NoLock {
            return Err(LockError::invalid("cannot promote to NL"));
        }
        let held = self.manager.lock_type_held(trans_num, &self.name);
        if held == LockType::NoLock {
            return Err(LockError::NoLockHeld {
                trans_num,
                name: self.name.clone(),
            });
        }
        if let Some(parent) = self.parent() {
            let parent_effective = parent.get_effective_lock_type(trans_num);
            if !LockType::can_be_parent(parent_effective, new_type) {
                return Err(LockError::invalid(format!(
                    "cannot hold {new_type} on '{}' under parent lock {parent_effective}",
                    self.name
                )));
            }
        }
        if new_type != LockType::SharedIntentExclusive {
            return self.manager.promote(trans_num, &self.name, new_type);
        }

        if self.has_six_ancestor(trans_num) {
            return Err(LockError::invalid(format!(
                "SIX on '{}' is redundant under a SIX ancestor",
                self.name
            )));
        }
        if held == new_type {
            return Err(LockError::DuplicateLockRequest {
                trans_num,
                name: self.name.clone(),
                held,
            });
        }
        if !LockType::substitutable(new_type, held) {
            return Err(LockError::invalid(format!(
                "promotion from {held} to {new_type} is not a strengthening"
            )));
        }
        let redundant: Vec<ResourceName> = self
            .manager
            .get_descendant_locks(trans_num, &self.name)
            .into_iter()
            .filter(|l| matches!(l.lock_type, LockType::Shared | LockType::IntentShared))
            .map(|l| l.name)
            .collect();
        let mut release = redundant.clone();
        release.push(self.name.clone());
        self.manager
            .acquire_and_release(trans_num, self.name.clone(), new_type, &release)?;
        self.uncount_released(trans_num, &redundant);
        Ok(())
    }

    /// Collapses the transaction's locks in this subtree into one S or X
    /// lock here. X if this node or any descendant held IX, SIX, or X;
    /// otherwise S. Does nothing if the target mode is already held.
    pub fn escalate(self: &Arc<Self>, trans_num: TransactionId) -> LockResult<()> {
        self.check_mutable()?;
        let held = self.manager.lock_type_held(trans_num, &self.name);
        if held == LockType::NoLock {
            return Err(LockError::NoLockHeld {
                trans_num,
                name: self.name.clone(),
            });
        }
        let descendants = self.manager.get_descendant_locks(trans_num, &self.name);
        let wants_exclusive = std::iter::once(held)
            .chain(descendants.iter().map(|l| l.lock_type))
            .any(|t| {
                matches!(
                    t,
                    LockType::IntentExclusive
                        | LockType::SharedIntentExclusive
                        | LockType::Exclusive
                )
            });
        let target = if wants_exclusive {
            LockType::Exclusive
        } else {
            LockType::Shared
        };
        if held == target {
            return Ok(());
        }
        let descendant_names: Vec<ResourceName> =
            descendants.into_iter().map(|l| l.name).collect();
        let mut release = descendant_names.clone();
        release.push(self.name.clone());
        self.manager
            .acquire_and_release(trans_num, self.name.clone(), target, &release)?;
        self.uncount_released(trans_num, &descendant_names);
        Ok(())
    }

    /// The lock explicitly held at this node, or NL.
    pub fn get_explicit_lock_type(&self, trans_num: TransactionId) -> LockType {
        self.manager.lock_type_held(trans_num, &self.name)
    }

    /// The lock effectively held at this node: the explicit lock if present,
    /// else whatever an ancestor's S, X, or SIX implies here. Intention-only
    /// ancestors imply nothing.
    pub fn get_effective_lock_type(&self, trans_num: TransactionId) -> LockType {
        let explicit = self.get_explicit_lock_type(trans_num);
        if explicit != LockType::NoLock {
            return explicit;
        }
        match self.parent() {
            None => LockType::NoLock,
            Some(parent) => match parent.get_effective_lock_type(trans_num) {
                LockType::SharedIntentExclusive => LockType::Shared,
                t @ (LockType::Shared | LockType::Exclusive) => t,
                _ => LockType::NoLock,
            },
        }
    }

    /// Number of locks the transaction holds on immediate children of this
    /// context. Deliberately not transitive: the counter is maintained by
    /// the direct parent on every acquire and release, and that immediate
    /// count is all the orphan checks and escalation bookkeeping need.
    pub fn get_num_children(&self, trans_num: TransactionId) -> usize {
        self.child_lock_counts
            .read()
            .get(&trans_num)
            .copied()
            .unwrap_or(0)
    }

    fn check_mutable(&self) -> LockResult<()> {
        if self.is_readonly() {
            return Err(LockError::ReadonlyContext {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn has_six_ancestor(&self, trans_num: TransactionId) -> bool {
        let mut current = self.parent();
        while let Some(ctx) = current {
            if ctx.get_explicit_lock_type(trans_num) == LockType::SharedIntentExclusive {
                return true;
            }
            current = ctx.parent();
        }
        false
    }

    fn add_child_lock(&self, trans_num: TransactionId) {
        *self.child_lock_counts.write().entry(trans_num).or_insert(0) += 1;
    }

    fn remove_child_lock(&self, trans_num: TransactionId) {
        let mut counts = self.child_lock_counts.write();
        if let Some(count) = counts.get_mut(&trans_num) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&trans_num);
            }
        }
    }

    /// Walks (creating as needed) to the context for a strict descendant
    /// resource name.
    fn descendant_context(self: &Arc<Self>, name: &ResourceName) -> Arc<LockContext> {
        debug_assert!(name.is_descendant_of(&self.name));
        let mut ctx = self.clone();
        for segment in &name.segments()[self.name.depth()..] {
            ctx = ctx.child(segment);
        }
        ctx
    }

    /// Fixes up per-transaction child counts after descendant locks were
    /// released in an atomic swap.
    fn uncount_released(self: &Arc<Self>, trans_num: TransactionId, released: &[ResourceName]) {
        for name in released {
            let parent = name
                .parent()
                .expect("released descendant always has a parent");
            if parent == self.name {
                self.remove_child_lock(trans_num);
            } else {
                self.descendant_context(&parent).remove_child_lock(trans_num);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::lock_manager::LockManagerConfig;
    use LockType::*;

    fn hierarchy() -> (Arc<LockManager>, Arc<LockContext>) {
        let manager = Arc::new(LockManager::new(LockManagerConfig::default()));
        let db = LockContext::new_root(manager.clone(), "database");
        (manager, db)
    }

    #[test]
    fn test_acquire_requires_parent_intent() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        assert!(matches!(
            table.acquire(1, Shared),
            Err(LockError::InvalidLock { .. })
        ));
        db.acquire(1, IntentShared).unwrap();
        table.acquire(1, Shared).unwrap();
        assert_eq!(db.get_num_children(1), 1);
    }

    #[test]
    fn test_release_refuses_to_orphan_descendants() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        db.acquire(1, IntentShared).unwrap();
        table.acquire(1, Shared).unwrap();
        assert!(matches!(
            db.release(1),
            Err(LockError::InvalidLock { .. })
        ));
        table.release(1).unwrap();
        assert_eq!(db.get_num_children(1), 0);
        db.release(1).unwrap();
    }

    #[test]
    fn test_effective_lock_type_walks_ancestors() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        let page = table.child("3");

        db.acquire(1, Exclusive).unwrap();
        assert_eq!(page.get_effective_lock_type(1), Exclusive);
        db.release(1).unwrap();

        db.acquire(2, IntentExclusive).unwrap();
        table.acquire(2, SharedIntentExclusive).unwrap();
        assert_eq!(page.get_effective_lock_type(2), Shared);
        assert_eq!(table.get_effective_lock_type(2), SharedIntentExclusive);
        assert_eq!(db.get_effective_lock_type(2), IntentExclusive);

        // Intent-only ancestors imply nothing.
        let other = db.child("t2");
        assert_eq!(other.get_effective_lock_type(2), NoLock);
    }

    #[test]
    fn test_redundant_lock_under_six_rejected() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        let page = table.child("3");
        db.acquire(1, IntentExclusive).unwrap();
        table.acquire(1, SharedIntentExclusive).unwrap();
        assert!(matches!(
            page.acquire(1, IntentShared),
            Err(LockError::InvalidLock { .. })
        ));
        // IX under SIX is fine.
        page.acquire(1, IntentExclusive).unwrap();
    }

    #[test]
    fn test_promote_to_six_swallows_s_and_is_descendants() {
        let (manager, db) = hierarchy();
        let table = db.child("t1");
        let p3 = table.child("3");
        let p5 = table.child("5");

        db.acquire(1, IntentExclusive).unwrap();
        table.acquire(1, IntentExclusive).unwrap();
        p3.acquire(1, Shared).unwrap();
        p5.acquire(1, Shared).unwrap();

        let swaps_before = manager.stats().atomic_swaps;
        table.promote(1, SharedIntentExclusive).unwrap();
        assert_eq!(manager.stats().atomic_swaps, swaps_before + 1);

        assert_eq!(db.get_explicit_lock_type(1), IntentExclusive);
        assert_eq!(table.get_explicit_lock_type(1), SharedIntentExclusive);
        assert_eq!(p3.get_explicit_lock_type(1), NoLock);
        assert_eq!(p5.get_explicit_lock_type(1), NoLock);
        assert_eq!(table.get_num_children(1), 0);
        assert!(manager.get_descendant_locks(1, table.name()).is_empty());
    }

    #[test]
    fn test_promote_six_under_six_rejected() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        db.acquire(1, SharedIntentExclusive).unwrap();
        table.acquire(1, IntentExclusive).unwrap();
        assert!(matches!(
            table.promote(1, SharedIntentExclusive),
            Err(LockError::InvalidLock { .. })
        ));
    }

    #[test]
    fn test_escalate_chooses_exclusive_when_writes_present() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        let p3 = table.child("3");
        let p5 = table.child("5");
        db.acquire(1, IntentExclusive).unwrap();
        table.acquire(1, IntentExclusive).unwrap();
        p3.acquire(1, Shared).unwrap();
        p5.acquire(1, Exclusive).unwrap();

        table.escalate(1).unwrap();
        assert_eq!(table.get_explicit_lock_type(1), Exclusive);
        assert_eq!(p3.get_explicit_lock_type(1), NoLock);
        assert_eq!(p5.get_explicit_lock_type(1), NoLock);
        assert_eq!(table.get_num_children(1), 0);
    }

    #[test]
    fn test_escalate_chooses_shared_for_read_only_subtree() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        let p3 = table.child("3");
        db.acquire(1, IntentShared).unwrap();
        table.acquire(1, IntentShared).unwrap();
        p3.acquire(1, Shared).unwrap();

        table.escalate(1).unwrap();
        assert_eq!(table.get_explicit_lock_type(1), Shared);
        assert_eq!(p3.get_explicit_lock_type(1), NoLock);
    }

    #[test]
    fn test_escalate_is_idempotent() {
        let (manager, db) = hierarchy();
        let table = db.child("t1");
        db.acquire(1, IntentExclusive).unwrap();
        table.acquire(1, IntentExclusive).unwrap();
        table.child("3").acquire(1, Exclusive).unwrap();

        table.escalate(1).unwrap();
        let mutations = manager.stats().mutations();
        table.escalate(1).unwrap();
        assert_eq!(manager.stats().mutations(), mutations);
    }

    #[test]
    fn test_readonly_context_rejects_mutation() {
        let (_m, db) = hierarchy();
        db.acquire(1, IntentShared).unwrap();
        let table = db.child("t1");
        db.disable_child_locks();
        assert!(matches!(
            table.acquire(1, Shared),
            Err(LockError::ReadonlyContext { .. })
        ));
        // Children created after the fact are readonly too.
        let late = db.child("t2");
        assert!(matches!(
            late.acquire(1, Shared),
            Err(LockError::ReadonlyContext { .. })
        ));
    }

    #[test]
    fn test_child_counts_span_generations() {
        let (_m, db) = hierarchy();
        let table = db.child("t1");
        let p3 = table.child("3");
        let p5 = table.child("5");
        db.acquire(1, IntentExclusive).unwrap();
        table.acquire(1, IntentExclusive).unwrap();
        p3.acquire(1, Exclusive).unwrap();
        p5.acquire(1, Exclusive).unwrap();
        assert_eq!(db.get_num_children(1), 1);
        assert_eq!(table.get_num_children(1), 2);
        p3.release(1).unwrap();
        assert_eq!(table.get_num_children(1), 1);
    }
}
