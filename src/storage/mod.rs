//! Storage module for ledger persistence

pub mod ledger;
pub mod persistence;

pub use ledger::{AddressCursor, LedgerState, LedgerStore, MemoryLedger};
pub use persistence::{Storage, StorageConfig, StorageError};
