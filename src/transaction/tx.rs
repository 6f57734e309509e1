use core::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Condvar, Mutex,
};

use log::debug;

pub type TransactionID = u64;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Running,
    Committing,
    Aborting,
    /// Aborting because restart recovery decided so, not the user.
    RecoveryAborting,
    Complete,
}

/// A transaction handle: an id, a status, and the park primitive the
/// lock manager suspends it on.
///
/// The park discipline avoids missed wakeups: `prepare_block` arms the
/// flag while the lock manager still holds its own mutex, the mutex is
/// released, and only then does `block` actually wait. An `unblock`
/// that lands in between simply clears the flag and `block` returns
/// immediately.
pub struct Transaction {
    id: TransactionID,
    status: Mutex<TransactionStatus>,

    parked: Mutex<bool>,
    wakeup: Condvar,
}

impl Transaction {
    pub fn new() -> Self {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_id(id)
    }

    pub fn with_id(id: TransactionID) -> Self {
        Self {
            id,
            status: Mutex::new(TransactionStatus::Running),
            parked: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    pub fn get_id(&self) -> TransactionID {
        self.id
    }

    pub fn get_status(&self) -> TransactionStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Arm the park flag. Must happen before the caller drops whatever
    /// mutex made the decision to block.
    pub fn prepare_block(&self) {
        *self.parked.lock().unwrap() = true;
    }

    /// Park until some other thread calls `unblock`. No-op if the
    /// wakeup already happened.
    pub fn block(&self) {
        debug!("tx_{} blocked", self.id);
        let mut parked = self.parked.lock().unwrap();
        while *parked {
            parked = self.wakeup.wait(parked).unwrap();
        }
        debug!("tx_{} resumed", self.id);
    }

    pub fn unblock(&self) {
        let mut parked = self.parked.lock().unwrap();
        *parked = false;
        self.wakeup.notify_all();
    }

    pub fn is_blocked(&self) -> bool {
        *self.parked.lock().unwrap()
    }

    /// Final teardown, called when the transaction ends. Clears a
    /// stale park flag so a finished transaction can never stay
    /// suspended.
    pub fn cleanup(&self) {
        self.unblock();
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
