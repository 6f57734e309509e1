use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

/// Crate-wide error type.
///
/// Lock-protocol failures form a closed set of variants, all checked
/// before any mutation (a failed call leaves no partial effects).
/// Everything that goes wrong below the lock layer (file io, codec)
/// is an `Io`.
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    /// The transaction already holds an equivalent lock on the
    /// resource it tried to acquire or promote on.
    DuplicateLockRequest(String),

    /// Release, promote or escalate targeted a resource the
    /// transaction holds no lock on.
    NoLockHeld(String),

    /// The request violates the multigranularity or substitutability
    /// rules (this includes an explicit NL acquire).
    InvalidLock(String),

    /// Mutation attempted on a readonly lock context.
    UnsupportedOperation(String),

    /// File or serialization problem.
    Io(String),
}

impl DbError {
    pub fn new(msg: &str) -> DbError {
        DbError::Io(msg.to_string())
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        error!("{}\n{:?}", self, bt);
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DbError::DuplicateLockRequest(msg) => {
                write!(f, "duplicate lock request: {}", msg)
            }
            DbError::NoLockHeld(msg) => write!(f, "no lock held: {}", msg),
            DbError::InvalidLock(msg) => write!(f, "invalid lock: {}", msg),
            DbError::UnsupportedOperation(msg) => {
                write!(f, "unsupported operation: {}", msg)
            }
            DbError::Io(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for DbError {}
