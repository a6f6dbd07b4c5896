//! JSON-RPC client for Ethereum and Polygon
//!
//! Output index 0 is the native value of the transaction; any other index
//! (and index 0 when such a log exists) selects the ERC-20 `Transfer` log
//! with that log index in the receipt.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ChainRpc, RpcError, TxOutput};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

pub struct EvmRpc {
    url: String,
    client: Client,
    request_id: AtomicU64,
}

pub fn parse_quantity(value: &Value) -> Result<u128, RpcError> {
    let text = value
        .as_str()
        .ok_or_else(|| RpcError::Parse(format!("quantity is not a string: {}", value)))?;
    let digits = text.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|e| RpcError::Parse(format!("{}: {}", text, e)))
}

fn address(value: &Value) -> Option<String> {
    value.as_str().map(|s| s.to_lowercase())
}

/// Address held in the last 20 bytes of a 32-byte log topic
fn topic_address(topic: &Value) -> Option<String> {
    let text = topic.as_str()?.trim_start_matches("0x");
    if text.len() != 64 {
        return None;
    }
    Some(format!("0x{}", text[24..].to_lowercase()))
}

/// Finds output `index` in a transaction and its receipt
pub fn output_from(tx: &Value, receipt: &Value, hash: &str, index: u64) -> Result<TxOutput, RpcError> {
    let not_found = || RpcError::OutputNotFound {
        hash: hash.to_string(),
        index,
    };
    if receipt["status"].as_str() == Some("0x0") {
        return Err(not_found());
    }
    let height = match &tx["blockNumber"] {
        Value::Null => 0,
        number => parse_quantity(number)? as u64,
    };

    let logs = receipt["logs"].as_array().cloned().unwrap_or_default();
    for log in &logs {
        if parse_quantity(&log["logIndex"])? != index as u128 {
            continue;
        }
        let topics = log["topics"].as_array().ok_or_else(not_found)?;
        if topics.len() != 3 || topics[0].as_str().map(|t| t.to_lowercase()).as_deref() != Some(TRANSFER_TOPIC) {
            continue;
        }
        return Ok(TxOutput {
            receiver: topic_address(&topics[2]).ok_or_else(not_found)?,
            amount: parse_quantity(&log["data"])?,
            height,
            coinbase: false,
            asset_address: address(&log["address"]),
        });
    }

    if index != 0 {
        return Err(not_found());
    }
    Ok(TxOutput {
        receiver: address(&tx["to"]).ok_or_else(not_found)?,
        amount: parse_quantity(&tx["value"])?,
        height,
        coinbase: false,
        asset_address: None,
    })
}

impl EvmRpc {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: Client::new(),
            request_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self.client.post(&self.url).json(&request).send().await?;
        let json: Value = response.json().await?;

        if let Some(error) = json.get("error") {
            return Err(RpcError::Node(
                error["message"].as_str().unwrap_or("Unknown error").to_string(),
            ));
        }

        Ok(json["result"].clone())
    }

    async fn transaction(&self, hash: &str) -> Result<Value, RpcError> {
        let tx = self.call("eth_getTransactionByHash", json!([hash])).await?;
        if tx.is_null() {
            return Err(RpcError::TxNotFound(hash.to_string()));
        }
        Ok(tx)
    }
}

#[async_trait]
impl ChainRpc for EvmRpc {
    async fn get_transaction(&self, hash: &str) -> Result<Vec<u8>, RpcError> {
        let raw = self.call("eth_getRawTransactionByHash", json!([hash])).await?;
        let raw = raw.as_str().ok_or_else(|| RpcError::TxNotFound(hash.to_string()))?;
        hex::decode(raw.trim_start_matches("0x")).map_err(|e| RpcError::Parse(e.to_string()))
    }

    async fn get_transaction_output(&self, hash: &str, index: u64) -> Result<TxOutput, RpcError> {
        let tx = self.transaction(hash).await?;
        let receipt = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        if receipt.is_null() {
            // mined receipts lag the transaction on some nodes
            return Err(RpcError::TxNotFound(hash.to_string()));
        }
        output_from(&tx, &receipt, hash, index)
    }

    async fn get_transaction_sender(&self, hash: &str) -> Result<Option<String>, RpcError> {
        Ok(address(&self.transaction(hash).await?["from"]))
    }

    async fn current_height(&self) -> Result<u64, RpcError> {
        let number = self.call("eth_blockNumber", json!([])).await?;
        Ok(parse_quantity(&number)? as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";

    fn tx() -> Value {
        json!({
            "hash": "0x01",
            "from": "0x1616B057F8a89955d4A4f9fd9Eb10289ac0e44A1",
            "to": "0xAbCdEf0000000000000000000000000000000001",
            "value": "0xde0b6b3a7640000",
            "blockNumber": "0x10"
        })
    }

    fn receipt() -> Value {
        json!({
            "status": "0x1",
            "logs": [{
                "address": TOKEN,
                "logIndex": "0x3",
                "topics": [
                    TRANSFER_TOPIC,
                    "0x0000000000000000000000001616b057f8a89955d4a4f9fd9eb10289ac0e44a1",
                    "0x000000000000000000000000abcdef0000000000000000000000000000000002"
                ],
                "data": "0x00000000000000000000000000000000000000000000000000000000000f4240"
            }]
        })
    }

    #[test]
    fn test_native_output() {
        let output = output_from(&tx(), &receipt(), "0x01", 0).unwrap();
        assert_eq!(output.receiver, "0xabcdef0000000000000000000000000000000001");
        assert_eq!(output.amount, 1_000_000_000_000_000_000);
        assert_eq!(output.height, 16);
        assert_eq!(output.asset_address, None);
    }

    #[test]
    fn test_token_output() {
        let output = output_from(&tx(), &receipt(), "0x01", 3).unwrap();
        assert_eq!(output.receiver, "0xabcdef0000000000000000000000000000000002");
        assert_eq!(output.amount, 1_000_000);
        assert_eq!(output.asset_address.as_deref(), Some(TOKEN));
    }

    #[test]
    fn test_reverted_or_missing_outputs() {
        assert!(matches!(
            output_from(&tx(), &receipt(), "0x01", 7),
            Err(RpcError::OutputNotFound { index: 7, .. })
        ));
        let reverted = json!({ "status": "0x0", "logs": [] });
        assert!(output_from(&tx(), &reverted, "0x01", 0).is_err());
    }

    #[test]
    fn test_pending_transaction_has_no_height() {
        let mut pending = tx();
        pending["blockNumber"] = Value::Null;
        assert_eq!(output_from(&pending, &receipt(), "0x01", 0).unwrap().height, 0);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0xff")).unwrap(), 255);
        assert!(parse_quantity(&json!(12)).is_err());
    }
}
