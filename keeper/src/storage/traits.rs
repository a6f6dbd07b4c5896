//! Storage Trait Definitions
//!
//! The store is the single source of truth of the keeper. Everything a
//! request changes is described by one [`Commit`] and applied in a single
//! transaction together with the request's terminal state.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    BalanceRecord, DepositRecord, LedgerTransaction, ProposalRecord, RequestRecord, RequestState, SafeRecord,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("balance of {asset_id} at {address} would go negative")]
    NegativeBalance { address: String, asset_id: Uuid },

    #[error("request {0} is already {1}")]
    AlreadyFinished(Uuid, RequestState),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// One state change inside a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Records a credited deposit; fails the commit if (hash, index) exists
    InsertDeposit(DepositRecord),
    /// Adds to a safe balance
    Credit {
        address: String,
        asset_id: Uuid,
        bond_asset_id: Uuid,
        amount: u128,
    },
    /// Subtracts from a safe balance; fails the commit below zero
    Debit {
        address: String,
        asset_id: Uuid,
        amount: u128,
    },
    /// Inserts or replaces a safe
    PutSafe(SafeRecord),
    /// Inserts or replaces a proposal
    PutProposal(ProposalRecord),
    AddObserverKey { public: String, request_id: Uuid },
}

/// Terminal outcome of a request and everything it changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub request_id: Uuid,
    pub state: RequestState,
    pub failure: Option<String>,
    pub writes: Vec<Write>,
    pub transactions: Vec<LedgerTransaction>,
}

impl Commit {
    pub fn done(request_id: Uuid, writes: Vec<Write>, transactions: Vec<LedgerTransaction>) -> Self {
        Self {
            request_id,
            state: RequestState::Done,
            failure: None,
            writes,
            transactions,
        }
    }

    /// A rejection changes nothing but the request itself
    pub fn failed(request_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            state: RequestState::Failed,
            failure: Some(reason.into()),
            writes: Vec::new(),
            transactions: Vec::new(),
        }
    }
}

/// Keeper storage interface
///
/// Implementations:
/// - `SqliteStore` - SQLite behind an r2d2 pool
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new request in the initial state
    async fn insert_request(&self, record: &RequestRecord) -> StorageResult<()>;

    async fn get_request(&self, id: Uuid) -> StorageResult<Option<RequestRecord>>;

    /// Requests still initial, oldest first
    async fn initial_requests(&self) -> StorageResult<Vec<RequestRecord>>;

    /// Request counts keyed by state
    async fn count_requests(&self) -> StorageResult<std::collections::BTreeMap<String, u64>>;

    /// Apply a request outcome atomically
    async fn commit(&self, commit: &Commit) -> StorageResult<()>;

    /// Transactions emitted by a request
    async fn request_transactions(&self, request_id: Uuid) -> StorageResult<Vec<LedgerTransaction>>;

    /// Transactions not yet handed to the bus, oldest first
    async fn unsent_transactions(&self) -> StorageResult<Vec<LedgerTransaction>>;

    async fn mark_sent(&self, trace_id: Uuid) -> StorageResult<()>;

    async fn get_safe(&self, holder: &str) -> StorageResult<Option<SafeRecord>>;

    async fn safe_by_address(&self, address: &str) -> StorageResult<Option<SafeRecord>>;

    /// Safe whose keygen or ownership session is `session_id`
    async fn safe_by_session(&self, session_id: Uuid) -> StorageResult<Option<SafeRecord>>;

    /// Halt (with a reason) or resume (with `None`) processing of a safe
    async fn set_halted(&self, holder: &str, reason: Option<&str>) -> StorageResult<()>;

    async fn get_deposit(&self, transaction_hash: &str, output_index: u64) -> StorageResult<Option<DepositRecord>>;

    /// Balance of `asset_id` at `address`, zero if absent
    async fn read_balance(&self, address: &str, asset_id: Uuid) -> StorageResult<u128>;

    async fn balances(&self, address: &str) -> StorageResult<Vec<BalanceRecord>>;

    async fn get_proposal(&self, id: Uuid) -> StorageResult<Option<ProposalRecord>>;

    async fn proposal_by_session(&self, session_id: Uuid) -> StorageResult<Option<ProposalRecord>>;

    async fn observer_key_exists(&self, public: &str) -> StorageResult<bool>;
}
