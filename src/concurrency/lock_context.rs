use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use log::debug;

use crate::{
    concurrency::{Lock, LockManager, LockType, ResourceName},
    error::DbError,
    transaction::{Transaction, TransactionID},
    types::DbResult,
};

/// One node in the resource hierarchy, layered over the flat lock
/// manager to enforce the multigranularity rules.
///
/// Ownership flows root to leaf: a context owns its children and holds
/// only a weak back-pointer to its parent, so the tree has no
/// reference cycles. The manager is shared by every node.
pub struct LockContext {
    manager: Arc<LockManager>,
    self_ref: Weak<LockContext>,
    parent: Weak<LockContext>,
    name: ResourceName,
    readonly: bool,
    children_disabled: AtomicBool,

    /// For each transaction, how many locks it holds on strict
    /// descendants of this node.
    num_child_locks: Mutex<HashMap<TransactionID, usize>>,
    children: Mutex<HashMap<String, Arc<LockContext>>>,
}

impl LockContext {
    pub fn new_root(manager: Arc<LockManager>, name: &str) -> Arc<LockContext> {
        Self::create(manager, Weak::new(), ResourceName::root(name), false)
    }

    fn create(
        manager: Arc<LockManager>,
        parent: Weak<LockContext>,
        name: ResourceName,
        readonly: bool,
    ) -> Arc<LockContext> {
        Arc::new_cyclic(|me| LockContext {
            manager,
            self_ref: me.clone(),
            parent,
            name,
            readonly,
            children_disabled: AtomicBool::new(false),
            num_child_locks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch (or create) the child context for `segment`. Children of
    /// a readonly context, and children created after
    /// `disable_children`, are readonly themselves.
    pub fn child(&self, segment: &str) -> Arc<LockContext> {
        let mut children = self.children.lock().unwrap();
        if let Some(c) = children.get(segment) {
            return Arc::clone(c);
        }

        let readonly = self.readonly || self.children_disabled.load(Ordering::SeqCst);
        let child = LockContext::create(
            Arc::clone(&self.manager),
            self.self_ref.clone(),
            self.name.child(segment),
            readonly,
        );
        children.insert(segment.to_string(), Arc::clone(&child));
        child
    }

    /// Make every child context created from now on readonly. Used for
    /// indices and temp tables, whose fine-grained locking is managed
    /// elsewhere.
    pub fn disable_children(&self) {
        self.children_disabled.store(true, Ordering::SeqCst);
    }

    pub fn get_name(&self) -> &ResourceName {
        &self.name
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn parent_ctx(&self) -> Option<Arc<LockContext>> {
        self.parent.upgrade()
    }

    /// Strict ancestors, nearest first.
    fn ancestors(&self) -> Vec<Arc<LockContext>> {
        let mut out = Vec::new();
        let mut cur = self.parent_ctx();
        while let Some(c) = cur {
            cur = c.parent_ctx();
            out.push(c);
        }
        out
    }

    /// Strict ancestors, root first. The order acquisitions must
    /// happen in.
    pub(crate) fn ancestors_top_down(&self) -> Vec<Arc<LockContext>> {
        let mut out = self.ancestors();
        out.reverse();
        out
    }

    /// The lock this transaction holds on exactly this resource.
    pub fn explicit_lock_type(&self, tx: &Arc<Transaction>) -> LockType {
        self.manager.get_lock_type(tx.get_id(), &self.name)
    }

    /// The capability this transaction effectively has here: its own
    /// lock if any, else whatever a non-intent ancestor lock confers
    /// (S and X pass down as themselves, SIX passes down as S; intent
    /// locks confer nothing).
    pub fn effective_lock_type(&self, tx: &Arc<Transaction>) -> LockType {
        let explicit = self.explicit_lock_type(tx);
        if explicit != LockType::NL {
            return explicit;
        }
        match self.parent_ctx() {
            Some(parent) => match parent.effective_lock_type(tx) {
                LockType::SIX => LockType::S,
                LockType::S => LockType::S,
                LockType::X => LockType::X,
                _ => LockType::NL,
            },
            None => LockType::NL,
        }
    }

    pub fn get_num_child_locks(&self, tx: &Arc<Transaction>) -> usize {
        *self
            .num_child_locks
            .lock()
            .unwrap()
            .get(&tx.get_id())
            .unwrap_or(&0)
    }

    fn has_six_ancestor(&self, tx: &Arc<Transaction>) -> bool {
        self.ancestors()
            .iter()
            .any(|a| a.explicit_lock_type(tx) == LockType::SIX)
    }

    /// This transaction's locks on strict descendants of this node.
    fn descendant_locks(&self, tx: &Arc<Transaction>) -> Vec<Lock> {
        self.manager
            .locks_of(tx.get_id())
            .into_iter()
            .filter(|l| l.resource.is_descendant_of(&self.name))
            .collect()
    }

    fn adjust_count(&self, txn_id: TransactionID, delta: i64) {
        let mut counts = self.num_child_locks.lock().unwrap();
        let count = counts.entry(txn_id).or_insert(0);
        if delta >= 0 {
            *count += delta as usize;
        } else {
            *count = count.saturating_sub((-delta) as usize);
        }
        if *count == 0 {
            counts.remove(&txn_id);
        }
    }

    /// A lock on a strict descendant of this node was released;
    /// decrement the counter on every strict ancestor of that
    /// descendant.
    fn dec_counts_for_descendant(&self, txn_id: TransactionID, descendant: &ResourceName) {
        for a in self.ancestors() {
            a.adjust_count(txn_id, -1);
        }
        self.adjust_count(txn_id, -1);

        // contexts between this node and the descendant
        let mut ctx = self.self_ref.upgrade().unwrap();
        let segments = descendant.segments_below(&self.name).to_vec();
        for segment in &segments[..segments.len() - 1] {
            let next = ctx.child(segment);
            next.adjust_count(txn_id, -1);
            ctx = next;
        }
    }

    /// Take `lock_type` here, enforcing the hierarchy: the parent's
    /// effective lock must permit it, and an S or IS under an SIX
    /// ancestor is rejected as redundant.
    pub fn acquire(&self, tx: &Arc<Transaction>, lock_type: LockType) -> DbResult {
        if self.readonly {
            return Err(DbError::UnsupportedOperation(format!(
                "context {} is readonly",
                self.name
            )));
        }
        if lock_type == LockType::NL {
            return Err(DbError::InvalidLock(
                "cannot acquire NL, use release instead".to_string(),
            ));
        }
        if matches!(lock_type, LockType::S | LockType::IS) && self.has_six_ancestor(tx) {
            return Err(DbError::InvalidLock(format!(
                "{} under an SIX ancestor is redundant",
                lock_type
            )));
        }
        if let Some(parent) = self.parent_ctx() {
            let parent_type = parent.effective_lock_type(tx);
            if !parent_type.can_be_parent_of(lock_type) {
                return Err(DbError::InvalidLock(format!(
                    "parent lock {} on {} does not permit {} on {}",
                    parent_type,
                    parent.get_name(),
                    lock_type,
                    self.name
                )));
            }
        }

        self.manager.acquire(tx, &self.name, lock_type)?;

        for a in self.ancestors() {
            a.adjust_count(tx.get_id(), 1);
        }
        Ok(())
    }

    /// Release the lock here. Refused while a strict descendant still
    /// holds S or X (those imply this lock); descendants holding only
    /// intent locks do not block the release.
    pub fn release(&self, tx: &Arc<Transaction>) -> DbResult {
        if self.readonly {
            return Err(DbError::UnsupportedOperation(format!(
                "context {} is readonly",
                self.name
            )));
        }
        if self.explicit_lock_type(tx) == LockType::NL {
            return Err(DbError::NoLockHeld(format!(
                "{} holds no lock on {}",
                tx, self.name
            )));
        }
        for lock in self.descendant_locks(tx) {
            if matches!(lock.lock_type, LockType::S | LockType::X) {
                return Err(DbError::InvalidLock(format!(
                    "cannot release {}: descendant {} still holds {}",
                    self.name, lock.resource, lock.lock_type
                )));
            }
        }

        self.manager.release(tx, &self.name)?;

        for a in self.ancestors() {
            a.adjust_count(tx.get_id(), -1);
        }
        Ok(())
    }

    /// Upgrade the lock here to `new_type`.
    ///
    /// Promoting to SIX from IS, IX or S also releases every S and IS
    /// this transaction holds on strict descendants, in one atomic
    /// manager call; those locks become redundant under the SIX.
    pub fn promote(&self, tx: &Arc<Transaction>, new_type: LockType) -> DbResult {
        if self.readonly {
            return Err(DbError::UnsupportedOperation(format!(
                "context {} is readonly",
                self.name
            )));
        }

        let current = self.explicit_lock_type(tx);
        if current == LockType::NL {
            return Err(DbError::NoLockHeld(format!(
                "{} holds no lock on {}",
                tx, self.name
            )));
        }

        if let Some(parent) = self.parent_ctx() {
            let parent_type = parent.effective_lock_type(tx);
            if !parent_type.can_be_parent_of(new_type) {
                return Err(DbError::InvalidLock(format!(
                    "parent lock {} on {} does not permit {} on {}",
                    parent_type,
                    parent.get_name(),
                    new_type,
                    self.name
                )));
            }
        }

        if new_type != LockType::SIX {
            return self.manager.promote(tx, &self.name, new_type);
        }

        // promotion to SIX
        if self.has_six_ancestor(tx) {
            return Err(DbError::InvalidLock(
                "SIX under an SIX ancestor is redundant".to_string(),
            ));
        }
        if current == LockType::SIX {
            return Err(DbError::DuplicateLockRequest(format!(
                "{} already holds SIX on {}",
                tx, self.name
            )));
        }
        if !matches!(current, LockType::IS | LockType::IX | LockType::S) {
            return Err(DbError::InvalidLock(format!(
                "cannot promote {} to SIX on {}",
                current, self.name
            )));
        }

        let redundant: Vec<ResourceName> = self
            .descendant_locks(tx)
            .into_iter()
            .filter(|l| matches!(l.lock_type, LockType::S | LockType::IS))
            .map(|l| l.resource)
            .collect();

        let mut release_names = redundant.clone();
        release_names.push(self.name.clone());
        self.manager
            .acquire_and_release(tx, &self.name, LockType::SIX, release_names)?;

        for name in &redundant {
            self.dec_counts_for_descendant(tx.get_id(), name);
        }
        debug!("{} promoted to SIX on {}", tx, self.name);
        Ok(())
    }

    /// Collapse this subtree to a single lock here: X if this node or
    /// any descendant lock is IX, SIX or X, else S. One atomic manager
    /// call releases every descendant lock. A no-op when the lock here
    /// is already S or X and no descendant locks remain.
    pub fn escalate(&self, tx: &Arc<Transaction>) -> DbResult {
        if self.readonly {
            return Err(DbError::UnsupportedOperation(format!(
                "context {} is readonly",
                self.name
            )));
        }

        let current = self.explicit_lock_type(tx);
        if current == LockType::NL {
            return Err(DbError::NoLockHeld(format!(
                "{} holds no lock on {}",
                tx, self.name
            )));
        }

        let descendants = self.descendant_locks(tx);
        if descendants.is_empty() && matches!(current, LockType::S | LockType::X) {
            return Ok(());
        }

        let exclusive = matches!(current, LockType::IX | LockType::SIX | LockType::X)
            || descendants
                .iter()
                .any(|l| matches!(l.lock_type, LockType::IX | LockType::SIX | LockType::X));
        let target = if exclusive { LockType::X } else { LockType::S };

        let mut release_names: Vec<ResourceName> = vec![self.name.clone()];
        release_names.extend(descendants.iter().map(|l| l.resource.clone()));
        self.manager
            .acquire_and_release(tx, &self.name, target, release_names)?;

        for lock in &descendants {
            self.dec_counts_for_descendant(tx.get_id(), &lock.resource);
        }
        debug!("{} escalated {} to {}", tx, self.name, target);
        Ok(())
    }
}
