use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    concurrency::{LockType, ResourceName},
    error::DbError,
    transaction::{Transaction, TransactionID},
    types::DbResult,
};

/// One granted lock: `(resource, type, transaction)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub resource: ResourceName,
    pub lock_type: LockType,
    pub txn_id: TransactionID,
}

/// A waiter in a resource's FIFO queue. `release_names` are the locks
/// to let go of once the request is eventually granted (used by
/// acquire-and-release).
struct LockRequest {
    transaction: Arc<Transaction>,
    lock: Lock,
    release_names: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    /// Granted locks, in acquisition order. A promote swaps the type
    /// in place so the position is preserved.
    locks: Vec<Lock>,
    wait_queue: VecDeque<LockRequest>,
}

#[derive(Default)]
struct LockManagerState {
    entries: HashMap<ResourceName, ResourceEntry>,
    /// Per-transaction lock lists, in acquisition order. Mirrors the
    /// grants inside `entries`.
    transaction_locks: HashMap<TransactionID, Vec<Lock>>,
}

impl LockManagerState {
    fn entry_mut(&mut self, resource: &ResourceName) -> &mut ResourceEntry {
        self.entries.entry(resource.clone()).or_default()
    }

    fn lock_type_on(&self, resource: &ResourceName, txn_id: TransactionID) -> LockType {
        match self.entries.get(resource) {
            Some(entry) => entry
                .locks
                .iter()
                .find(|l| l.txn_id == txn_id)
                .map(|l| l.lock_type)
                .unwrap_or(LockType::NL),
            None => LockType::NL,
        }
    }

    /// Is `lock_type` compatible with every grant on the resource held
    /// by a transaction other than `txn_id`?
    fn compatible_with_grants(
        &self,
        resource: &ResourceName,
        txn_id: TransactionID,
        lock_type: LockType,
    ) -> bool {
        match self.entries.get(resource) {
            Some(entry) => entry
                .locks
                .iter()
                .filter(|l| l.txn_id != txn_id)
                .all(|l| l.lock_type.compatible_with(lock_type)),
            None => true,
        }
    }

    /// Is `lock_type` compatible with every request already waiting on
    /// the resource? Letting a fresh request slip past queued waiters
    /// it conflicts with would starve them by lock type.
    fn compatible_with_queue(&self, resource: &ResourceName, lock_type: LockType) -> bool {
        match self.entries.get(resource) {
            Some(entry) => entry
                .wait_queue
                .iter()
                .all(|r| r.lock.lock_type.compatible_with(lock_type)),
            None => true,
        }
    }

    /// Install a grant. If the transaction already holds a lock on the
    /// resource the type is swapped in place, keeping its position in
    /// both the grant list and the transaction's lock list.
    fn grant(&mut self, lock: Lock) {
        let entry = self.entry_mut(&lock.resource);
        match entry
            .locks
            .iter_mut()
            .find(|l| l.txn_id == lock.txn_id)
        {
            Some(existing) => existing.lock_type = lock.lock_type,
            None => entry.locks.push(lock.clone()),
        }

        let txn_locks = self.transaction_locks.entry(lock.txn_id).or_default();
        match txn_locks
            .iter_mut()
            .find(|l| l.resource == lock.resource)
        {
            Some(existing) => existing.lock_type = lock.lock_type,
            None => txn_locks.push(lock),
        }
    }

    fn remove_grant(&mut self, txn_id: TransactionID, resource: &ResourceName) {
        if let Some(entry) = self.entries.get_mut(resource) {
            entry.locks.retain(|l| l.txn_id != txn_id);
        }
        if let Some(txn_locks) = self.transaction_locks.get_mut(&txn_id) {
            txn_locks.retain(|l| &l.resource != resource);
        }
    }

    /// Walk the wait queue from the front, granting requests until the
    /// head is incompatible with the current grants. The head is never
    /// skipped to serve a compatible request behind it.
    fn process_queue(&mut self, resource: &ResourceName) {
        loop {
            let request = {
                let entry = match self.entries.get_mut(resource) {
                    Some(e) => e,
                    None => return,
                };
                let head = match entry.wait_queue.front() {
                    Some(r) => r,
                    None => return,
                };
                let compatible = entry
                    .locks
                    .iter()
                    .filter(|l| l.txn_id != head.lock.txn_id)
                    .all(|l| l.lock_type.compatible_with(head.lock.lock_type));
                if !compatible {
                    return;
                }
                entry.wait_queue.pop_front().unwrap()
            };

            debug!(
                "{} granted {} on {} from the queue",
                request.transaction, request.lock.lock_type, resource
            );
            self.grant(request.lock.clone());

            // deferred releases bundled with the request
            for name in &request.release_names {
                if name != resource {
                    self.remove_grant(request.lock.txn_id, name);
                    self.process_queue(name);
                }
            }

            request.transaction.unblock();
        }
    }
}

/// The flat lock manager: per-resource grant lists plus FIFO wait
/// queues, all behind one mutex.
///
/// The mutex is never held across a suspension. When a request cannot
/// be granted the transaction's park flag is armed under the mutex,
/// the mutex is dropped, and only then does the transaction actually
/// block, so a wakeup can never be missed.
pub struct LockManager {
    state: Mutex<LockManagerState>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockManagerState::default()),
        }
    }

    /// Take `lock_type` on `resource`, blocking while it conflicts
    /// with other transactions' grants or with anything already in the
    /// wait queue.
    pub fn acquire(
        &self,
        tx: &Arc<Transaction>,
        resource: &ResourceName,
        lock_type: LockType,
    ) -> DbResult {
        let mut must_block = false;
        {
            let mut state = self.state.lock().unwrap();
            let txn_id = tx.get_id();

            if state.lock_type_on(resource, txn_id) != LockType::NL {
                return Err(DbError::DuplicateLockRequest(format!(
                    "{} already holds a lock on {}",
                    tx, resource
                )));
            }

            let lock = Lock {
                resource: resource.clone(),
                lock_type,
                txn_id,
            };

            if state.compatible_with_grants(resource, txn_id, lock_type)
                && state.compatible_with_queue(resource, lock_type)
            {
                debug!("{} acquired {} on {}", tx, lock_type, resource);
                state.grant(lock);
            } else {
                debug!("{} waits for {} on {}", tx, lock_type, resource);
                tx.prepare_block();
                state.entry_mut(resource).wait_queue.push_back(LockRequest {
                    transaction: Arc::clone(tx),
                    lock,
                    release_names: Vec::new(),
                });
                must_block = true;
            }
        }

        if must_block {
            tx.block();
        }
        Ok(())
    }

    /// Drop the lock on `resource` and hand the queue whatever became
    /// grantable.
    pub fn release(&self, tx: &Arc<Transaction>, resource: &ResourceName) -> DbResult {
        let mut state = self.state.lock().unwrap();
        let txn_id = tx.get_id();

        if state.lock_type_on(resource, txn_id) == LockType::NL {
            return Err(DbError::NoLockHeld(format!(
                "{} holds no lock on {}",
                tx, resource
            )));
        }

        debug!("{} released its lock on {}", tx, resource);
        state.remove_grant(txn_id, resource);
        state.process_queue(resource);
        Ok(())
    }

    /// Upgrade the lock on `resource` to `new_type` in place (the
    /// acquisition position is preserved). Blocks at the front of the
    /// queue when other transactions' grants conflict.
    pub fn promote(
        &self,
        tx: &Arc<Transaction>,
        resource: &ResourceName,
        new_type: LockType,
    ) -> DbResult {
        let mut must_block = false;
        {
            let mut state = self.state.lock().unwrap();
            let txn_id = tx.get_id();

            let current = state.lock_type_on(resource, txn_id);
            if current == LockType::NL {
                return Err(DbError::NoLockHeld(format!(
                    "{} holds no lock on {}",
                    tx, resource
                )));
            }
            if current == new_type {
                return Err(DbError::DuplicateLockRequest(format!(
                    "{} already holds {} on {}",
                    tx, new_type, resource
                )));
            }
            if !new_type.substitutes(current) {
                return Err(DbError::InvalidLock(format!(
                    "{} does not substitute {} on {}",
                    new_type, current, resource
                )));
            }

            let lock = Lock {
                resource: resource.clone(),
                lock_type: new_type,
                txn_id,
            };

            if state.compatible_with_grants(resource, txn_id, new_type) {
                debug!("{} promoted to {} on {}", tx, new_type, resource);
                state.grant(lock);
            } else {
                debug!("{} waits to promote to {} on {}", tx, new_type, resource);
                tx.prepare_block();
                state.entry_mut(resource).wait_queue.push_front(LockRequest {
                    transaction: Arc::clone(tx),
                    lock,
                    release_names: Vec::new(),
                });
                must_block = true;
            }
        }

        if must_block {
            tx.block();
        }
        Ok(())
    }

    /// Take `lock_type` on `resource` and atomically release every
    /// lock named in `release_names` (which may include `resource`
    /// itself, in which case the grant swaps in place). If the new
    /// lock conflicts, the request waits at the front of the queue and
    /// the releases happen when it is granted.
    pub fn acquire_and_release(
        &self,
        tx: &Arc<Transaction>,
        resource: &ResourceName,
        lock_type: LockType,
        release_names: Vec<ResourceName>,
    ) -> DbResult {
        let mut must_block = false;
        {
            let mut state = self.state.lock().unwrap();
            let txn_id = tx.get_id();

            for name in &release_names {
                if state.lock_type_on(name, txn_id) == LockType::NL {
                    return Err(DbError::NoLockHeld(format!(
                        "{} holds no lock on {}",
                        tx, name
                    )));
                }
            }

            let current = state.lock_type_on(resource, txn_id);
            if current != LockType::NL && !release_names.contains(resource) {
                return Err(DbError::DuplicateLockRequest(format!(
                    "{} already holds a lock on {}",
                    tx, resource
                )));
            }

            let lock = Lock {
                resource: resource.clone(),
                lock_type,
                txn_id,
            };

            if state.compatible_with_grants(resource, txn_id, lock_type) {
                debug!(
                    "{} acquired {} on {}, releasing {} locks",
                    tx,
                    lock_type,
                    resource,
                    release_names.len()
                );
                state.grant(lock);
                for name in &release_names {
                    if name != resource {
                        state.remove_grant(txn_id, name);
                        state.process_queue(name);
                    }
                }
            } else {
                debug!("{} waits for {} on {}", tx, lock_type, resource);
                tx.prepare_block();
                state.entry_mut(resource).wait_queue.push_front(LockRequest {
                    transaction: Arc::clone(tx),
                    lock,
                    release_names,
                });
                must_block = true;
            }
        }

        if must_block {
            tx.block();
        }
        Ok(())
    }

    /// The lock `tx` holds on `resource`, `NL` if none.
    pub fn get_lock_type(&self, txn_id: TransactionID, resource: &ResourceName) -> LockType {
        self.state.lock().unwrap().lock_type_on(resource, txn_id)
    }

    /// Every lock the transaction holds, in acquisition order.
    pub fn locks_of(&self, txn_id: TransactionID) -> Vec<Lock> {
        self.state
            .lock()
            .unwrap()
            .transaction_locks
            .get(&txn_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every lock granted on the resource, in acquisition order.
    pub fn locks_on(&self, resource: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(resource)
            .map(|e| e.locks.clone())
            .unwrap_or_default()
    }
}
