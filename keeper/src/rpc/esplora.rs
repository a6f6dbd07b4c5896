//! Esplora API client for Bitcoin and Litecoin
//!
//! Works against any Esplora deployment (blockstream.info, litecoinspace.org
//! or a self-hosted electrs).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{ChainRpc, RpcError, TxOutput};

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraRpc {
    client: Client,
    base_url: String,
}

/// Transaction as returned by `GET /tx/:txid`
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    pub txid: String,
    pub vin: Vec<EsploraVin>,
    pub vout: Vec<EsploraVout>,
    pub status: EsploraTxStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraVin {
    #[serde(default)]
    pub is_coinbase: bool,
    pub prevout: Option<EsploraVout>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraVout {
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

/// Transaction status
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

impl EsploraTx {
    pub fn is_coinbase(&self) -> bool {
        self.vin.first().is_some_and(|vin| vin.is_coinbase)
    }

    pub fn output(&self, index: u64) -> Result<TxOutput, RpcError> {
        let not_found = || RpcError::OutputNotFound {
            hash: self.txid.clone(),
            index,
        };
        let vout = usize::try_from(index)
            .ok()
            .and_then(|i| self.vout.get(i))
            .ok_or_else(not_found)?;
        let receiver = vout.scriptpubkey_address.clone().ok_or_else(not_found)?;
        let height = match (self.status.confirmed, self.status.block_height) {
            (true, Some(height)) => height,
            _ => 0,
        };
        Ok(TxOutput {
            receiver,
            amount: vout.value as u128,
            height,
            coinbase: self.is_coinbase(),
            asset_address: None,
        })
    }

    /// Address of the first spent output
    pub fn sender(&self) -> Option<String> {
        self.vin
            .first()
            .and_then(|vin| vin.prevout.as_ref())
            .and_then(|prevout| prevout.scriptpubkey_address.clone())
    }
}

impl EsploraRpc {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_tx(&self, txid: &str) -> Result<EsploraTx, RpcError> {
        let url = format!("{}/tx/{}", self.base_url, txid);
        let resp = self.client.get(&url).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RpcError::TxNotFound(txid.to_string()));
        }
        if !resp.status().is_success() {
            return Err(RpcError::Node(format!("GET {} returned {}", url, resp.status())));
        }

        let tx: EsploraTx = resp.json().await?;
        Ok(tx)
    }
}

#[async_trait]
impl ChainRpc for EsploraRpc {
    async fn get_transaction(&self, hash: &str) -> Result<Vec<u8>, RpcError> {
        let url = format!("{}/tx/{}/hex", self.base_url, hash);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(RpcError::TxNotFound(hash.to_string()));
        }

        let raw = resp.text().await?;
        hex::decode(raw.trim()).map_err(|e| RpcError::Parse(e.to_string()))
    }

    async fn get_transaction_output(&self, hash: &str, index: u64) -> Result<TxOutput, RpcError> {
        self.get_tx(hash).await?.output(index)
    }

    async fn get_transaction_sender(&self, hash: &str) -> Result<Option<String>, RpcError> {
        Ok(self.get_tx(hash).await?.sender())
    }

    async fn current_height(&self) -> Result<u64, RpcError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.client.get(&url).send().await?;

        let height: u64 = resp
            .text()
            .await?
            .trim()
            .parse()
            .map_err(|_| RpcError::Parse("Failed to parse block height".to_string()))?;

        Ok(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(confirmed: bool) -> EsploraTx {
        serde_json::from_value(serde_json::json!({
            "txid": "aa".repeat(32),
            "vin": [{
                "txid": "bb".repeat(32),
                "vout": 0,
                "is_coinbase": false,
                "prevout": {
                    "scriptpubkey_address": "bc1ql24x05zhqrpejar0p3kevhu48yhnnr3r95sv4y",
                    "value": 90000
                }
            }],
            "vout": [
                { "scriptpubkey_address": "bc1qchange", "value": 39000 },
                { "scriptpubkey_address": "bc1qsafe", "value": 50000 },
                { "scriptpubkey": "6a", "value": 0 }
            ],
            "status": if confirmed {
                serde_json::json!({ "confirmed": true, "block_height": 840000 })
            } else {
                serde_json::json!({ "confirmed": false })
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_output_by_index() {
        let tx = fixture(true);
        let output = tx.output(1).unwrap();
        assert_eq!(output.receiver, "bc1qsafe");
        assert_eq!(output.amount, 50_000);
        assert_eq!(output.height, 840_000);
        assert!(!output.coinbase);
        assert_eq!(tx.sender().as_deref(), Some("bc1ql24x05zhqrpejar0p3kevhu48yhnnr3r95sv4y"));
    }

    #[test]
    fn test_unconfirmed_output_has_no_height() {
        assert_eq!(fixture(false).output(1).unwrap().height, 0);
    }

    #[test]
    fn test_missing_or_addressless_output() {
        let tx = fixture(true);
        assert!(matches!(tx.output(5), Err(RpcError::OutputNotFound { index: 5, .. })));
        assert!(matches!(tx.output(2), Err(RpcError::OutputNotFound { index: 2, .. })));
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = EsploraRpc::new("https://blockstream.info/api/");
        assert_eq!(client.base_url(), "https://blockstream.info/api");
    }
}
