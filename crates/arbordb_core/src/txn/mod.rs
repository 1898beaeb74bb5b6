//! Transactions: lifecycle, buffered write sets, spill, and commit.

mod manager;
mod spill;
mod state;

pub use manager::TransactionManager;
pub use spill::{SpillLog, SpillTarget};
pub use state::{PendingWrite, Transaction, TxnState, WriteSet};
