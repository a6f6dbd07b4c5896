//! Keeper node for safe custody
//!
//! The keeper is the single authority over safes. It reads requests from
//! holders, the observer and the signer group off the group bus, persists
//! each one, and drives it to exactly one terminal outcome.
//!
//! ## Components
//!
//! 1. **Requests** - envelope decoding and per-role action checks
//! 2. **Safes** - proposal, signer keygen, ownership proof, closing
//! 3. **Deposits** - external-chain verification and crediting
//! 4. **Ledger** - per-safe balances and transaction proposals
//! 5. **Status API** - read-only HTTP views plus the bus inbox
//!
//! ## Usage
//!
//! ```bash
//! SAFE_OPERATION_KEY=... SAFE_SIGNER_MEMBERS=signer-1,signer-2 \
//! SAFE_SIGNER_THRESHOLD=2 SAFE_OBSERVER_ID=observer safe-keeper run
//! ```

pub mod api;
pub mod config;
pub mod deposit;
pub mod error;
pub mod ledger;
pub mod node;
pub mod request;
pub mod rpc;
pub mod safe;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports: node and configuration
pub use config::{ConfigError, KeeperConfig};
pub use error::{KeeperError, Result};
pub use node::{KeeperNode, Outcome};

// Re-exports: status API
pub use api::{create_router, AppState};

// Re-exports: requests and safes
pub use request::{encode_memo, envelope, Action, Request, SafeProposal, TransactionProposal};
pub use safe::{ownership_digest, proposal_digest, safe_address, safe_path};

// Re-exports: deposits
pub use deposit::{Deposit, DepositError, DepositVerifier};

// Re-exports: chains and storage
pub use rpc::{ChainClients, ChainRpc, EsploraRpc, EvmRpc, RpcError, TxOutput};
pub use storage::{SqliteStore, Store, StorageError};
pub use types::*;
