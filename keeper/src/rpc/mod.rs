//! Chain RPC collaborators
//!
//! The keeper needs four things from a chain node: the raw transaction, one
//! of its outputs, who funded it and the current height. UTXO chains are
//! read through Esplora, EVM chains through JSON-RPC.

pub mod esplora;
pub mod evm;

use async_trait::async_trait;
use safe_common::Chain;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use esplora::EsploraRpc;
pub use evm::EvmRpc;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transaction not found: {0}")]
    TxNotFound(String),

    #[error("Output {index} not found in {hash}")]
    OutputNotFound { hash: String, index: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("no RPC client for {0}")]
    Unsupported(Chain),
}

/// An output as the chain sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub receiver: String,
    pub amount: u128,
    /// Block height, 0 while unconfirmed
    pub height: u64,
    pub coinbase: bool,
    /// Token contract for EVM token transfers
    pub asset_address: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Raw serialized transaction
    async fn get_transaction(&self, hash: &str) -> Result<Vec<u8>, RpcError>;

    async fn get_transaction_output(&self, hash: &str, index: u64) -> Result<TxOutput, RpcError>;

    /// Address that funded the transaction, if it has one
    async fn get_transaction_sender(&self, hash: &str) -> Result<Option<String>, RpcError>;

    async fn current_height(&self) -> Result<u64, RpcError>;
}

/// One RPC client per configured chain
#[derive(Clone, Default)]
pub struct ChainClients {
    clients: HashMap<Chain, Arc<dyn ChainRpc>>,
}

impl ChainClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, chain: Chain, client: Arc<dyn ChainRpc>) -> Self {
        self.clients.insert(chain, client);
        self
    }

    pub fn get(&self, chain: Chain) -> Result<Arc<dyn ChainRpc>, RpcError> {
        self.clients
            .get(&chain)
            .cloned()
            .ok_or(RpcError::Unsupported(chain))
    }

    pub fn chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.clients.keys().copied().collect();
        chains.sort_by_key(|c| c.id());
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chain_is_unsupported() {
        let clients = ChainClients::new().with(Chain::Bitcoin, Arc::new(EsploraRpc::new("http://localhost:3002")));
        assert!(clients.get(Chain::Bitcoin).is_ok());
        assert!(matches!(
            clients.get(Chain::Polygon),
            Err(RpcError::Unsupported(Chain::Polygon))
        ));
        assert_eq!(clients.chains(), vec![Chain::Bitcoin]);
    }
}
