mod tx;

pub use tx::{Transaction, TransactionID, TransactionStatus};
