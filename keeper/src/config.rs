//! Environment-based Configuration for the keeper
//!
//! Values come from the process environment, optionally seeded from a
//! `.env` file by the binary. Secrets (the operation key) are never given
//! defaults.
//!
//! # Required Environment Variables
//! - `SAFE_OPERATION_KEY` - hex secret shared with the signer group
//! - `SAFE_SIGNER_MEMBERS` - comma separated signer conversation ids
//! - `SAFE_SIGNER_THRESHOLD` - signatures the signer group needs
//! - `SAFE_OBSERVER_ID` - conversation id of the observer
//!
//! # Optional Settings
//! - `SAFE_KEEPER_ID` - this node's conversation id (default: "keeper")
//! - `SAFE_DATABASE_PATH` - SQLite file (default: "data/keeper.sqlite3")
//! - `SAFE_OPERATION_ASSET_ID` - asset carrying operations to the signers
//! - `SAFE_BITCOIN_RPC`, `SAFE_LITECOIN_RPC` - Esplora endpoints
//! - `SAFE_ETHEREUM_RPC`, `SAFE_POLYGON_RPC` - JSON-RPC endpoints
//! - `SAFE_BIND` - status API address (default: "0.0.0.0:7080")
//! - `SAFE_PEERS` - HTTP bus peers as `id=url,id=url`
//! - `SAFE_MAX_RETRIES`, `SAFE_RETRY_BASE_MS`, `SAFE_RETRY_MAX_MS` - upstream retry policy
//! - `SAFE_REPLAY_INTERVAL_SECS` - how often initial requests are replayed

use crate::types::Role;
use safe_common::Chain;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Asset used for operation transfers when none is configured
pub const DEFAULT_OPERATION_ASSET: Uuid = uuid::uuid!("a8b2c4d6-1e3f-4a5b-8c7d-9e0f1a2b3c4d");

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub keeper_id: String,
    pub database_path: PathBuf,
    pub operation_key: String,
    pub operation_asset_id: Uuid,
    pub signer_members: Vec<String>,
    pub signer_threshold: u8,
    pub observer_id: String,
    /// RPC endpoint per chain; chains without one cannot take deposits
    pub rpc: Vec<(Chain, String)>,
    pub bind: String,
    pub peers: BTreeMap<String, String>,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub replay_interval: Duration,
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, ConfigError> {
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl KeeperConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, one variable at a time
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let operation_key = required(&lookup, "SAFE_OPERATION_KEY")?;
        if hex::decode(&operation_key).map(|k| k.len() < 32).unwrap_or(true) {
            return Err(ConfigError::InvalidValue(
                "SAFE_OPERATION_KEY".to_string(),
                "must be at least 32 hex encoded bytes".to_string(),
            ));
        }

        let signer_members = list(&required(&lookup, "SAFE_SIGNER_MEMBERS")?);
        let signer_threshold: u8 = required(&lookup, "SAFE_SIGNER_THRESHOLD")?
            .trim()
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue("SAFE_SIGNER_THRESHOLD".to_string(), "must be a number".to_string())
            })?;
        if signer_threshold == 0 || signer_threshold as usize > signer_members.len() {
            return Err(ConfigError::InvalidValue(
                "SAFE_SIGNER_THRESHOLD".to_string(),
                format!("must be between 1 and {}", signer_members.len()),
            ));
        }

        let keeper_id = lookup("SAFE_KEEPER_ID").unwrap_or_else(|| "keeper".to_string());
        let observer_id = required(&lookup, "SAFE_OBSERVER_ID")?;
        if observer_id == keeper_id || signer_members.contains(&observer_id) {
            return Err(ConfigError::InvalidValue(
                "SAFE_OBSERVER_ID".to_string(),
                "must differ from the keeper and the signers".to_string(),
            ));
        }

        let rpc = Chain::ALL
            .into_iter()
            .filter_map(|chain| {
                let name = format!("SAFE_{}_RPC", chain.to_string().to_uppercase());
                lookup(&name).map(|url| (chain, url))
            })
            .collect();

        let mut peers = BTreeMap::new();
        for entry in list(&lookup("SAFE_PEERS").unwrap_or_default()) {
            let (id, url) = entry.split_once('=').ok_or_else(|| {
                ConfigError::InvalidValue("SAFE_PEERS".to_string(), format!("expected id=url, got {}", entry))
            })?;
            peers.insert(id.trim().to_string(), url.trim().to_string());
        }

        let retry_base: u64 = parsed(&lookup, "SAFE_RETRY_BASE_MS", 500)?;
        let retry_max: u64 = parsed(&lookup, "SAFE_RETRY_MAX_MS", 30_000)?;
        if retry_base == 0 {
            return Err(ConfigError::InvalidValue(
                "SAFE_RETRY_BASE_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if retry_max < retry_base {
            return Err(ConfigError::InvalidValue(
                "SAFE_RETRY_MAX_MS".to_string(),
                format!("must be at least SAFE_RETRY_BASE_MS ({})", retry_base),
            ));
        }

        Ok(Self {
            keeper_id,
            database_path: PathBuf::from(
                lookup("SAFE_DATABASE_PATH").unwrap_or_else(|| "data/keeper.sqlite3".to_string()),
            ),
            operation_key,
            operation_asset_id: parsed(&lookup, "SAFE_OPERATION_ASSET_ID", DEFAULT_OPERATION_ASSET)?,
            signer_members,
            signer_threshold,
            observer_id,
            rpc,
            bind: lookup("SAFE_BIND").unwrap_or_else(|| "0.0.0.0:7080".to_string()),
            peers,
            max_retries: parsed(&lookup, "SAFE_MAX_RETRIES", 5)?,
            retry_base: Duration::from_millis(retry_base),
            retry_max: Duration::from_millis(retry_max),
            replay_interval: Duration::from_secs(parsed(&lookup, "SAFE_REPLAY_INTERVAL_SECS", 60)?),
        })
    }

    /// Role of a sending conversation
    pub fn role_of(&self, sender: &str) -> Role {
        if sender == self.observer_id {
            Role::Observer
        } else if self.signer_members.iter().any(|m| m == sender) {
            Role::Signer
        } else {
            Role::Holder
        }
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        tracing::info!(
            keeper_id = %self.keeper_id,
            database = %self.database_path.display(),
            signers = ?self.signer_members,
            threshold = self.signer_threshold,
            observer = %self.observer_id,
            chains = ?self.rpc.iter().map(|(chain, _)| chain.to_string()).collect::<Vec<_>>(),
            "keeper configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = [
            ("SAFE_OPERATION_KEY", "11".repeat(32).as_str()),
            ("SAFE_SIGNER_MEMBERS", "signer-1, signer-2,signer-3"),
            ("SAFE_SIGNER_THRESHOLD", "2"),
            ("SAFE_OBSERVER_ID", "observer"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        vars
    }

    fn load(vars: HashMap<String, String>) -> Result<KeeperConfig, ConfigError> {
        KeeperConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(vars(&[])).unwrap();
        assert_eq!(config.keeper_id, "keeper");
        assert_eq!(config.signer_members, vec!["signer-1", "signer-2", "signer-3"]);
        assert_eq!(config.signer_threshold, 2);
        assert_eq!(config.operation_asset_id, DEFAULT_OPERATION_ASSET);
        assert_eq!(config.max_retries, 5);
        assert!(config.rpc.is_empty());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_chain_endpoints_and_peers() {
        let config = load(vars(&[
            ("SAFE_BITCOIN_RPC", "https://blockstream.info/api"),
            ("SAFE_POLYGON_RPC", "https://polygon-rpc.com"),
            ("SAFE_PEERS", "signer-1=http://10.0.0.1:7000, signer-2=http://10.0.0.2:7000"),
        ]))
        .unwrap();
        assert_eq!(
            config.rpc,
            vec![
                (Chain::Bitcoin, "https://blockstream.info/api".to_string()),
                (Chain::Polygon, "https://polygon-rpc.com".to_string()),
            ]
        );
        assert_eq!(config.peers.get("signer-2").map(String::as_str), Some("http://10.0.0.2:7000"));
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let mut missing = vars(&[]);
        missing.remove("SAFE_OPERATION_KEY");
        assert!(matches!(load(missing), Err(ConfigError::MissingEnvVar(name)) if name == "SAFE_OPERATION_KEY"));

        assert!(matches!(
            load(vars(&[("SAFE_OPERATION_KEY", "abcd")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            load(vars(&[("SAFE_SIGNER_THRESHOLD", "4")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            load(vars(&[("SAFE_OBSERVER_ID", "signer-1")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            load(vars(&[("SAFE_PEERS", "signer-1")])),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            load(vars(&[("SAFE_MAX_RETRIES", "many")])),
            Err(ConfigError::InvalidValue(..))
        ));
    }

    #[test]
    fn test_retry_policy_bounds() {
        assert!(matches!(
            load(vars(&[("SAFE_RETRY_BASE_MS", "0")])),
            Err(ConfigError::InvalidValue(name, _)) if name == "SAFE_RETRY_BASE_MS"
        ));
        assert!(matches!(
            load(vars(&[("SAFE_RETRY_BASE_MS", "1000"), ("SAFE_RETRY_MAX_MS", "10")])),
            Err(ConfigError::InvalidValue(name, _)) if name == "SAFE_RETRY_MAX_MS"
        ));

        let config = load(vars(&[("SAFE_RETRY_BASE_MS", "1"), ("SAFE_RETRY_MAX_MS", "2")])).unwrap();
        assert_eq!(config.retry_base, Duration::from_millis(1));
        assert_eq!(config.retry_max, Duration::from_millis(2));
    }

    #[test]
    fn test_roles() {
        let config = load(vars(&[])).unwrap();
        assert_eq!(config.role_of("observer"), Role::Observer);
        assert_eq!(config.role_of("signer-3"), Role::Signer);
        assert_eq!(config.role_of("anyone"), Role::Holder);
    }
}
