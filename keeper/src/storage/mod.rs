//! Storage Layer Module
//!
//! Persistence for requests, safes, deposits, balances, proposals and
//! emitted ledger transactions.

pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteStore;
pub use traits::{Commit, Store, StorageError, StorageResult, Write};
