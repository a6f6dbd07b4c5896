//! Signer node configuration
//!
//! Loaded from a TOML file; secrets may be left out of the file and passed
//! through the CLI or environment instead.
//!
//! ```toml
//! node_id = "signer-1"
//! threshold = 3
//! keeper_id = "keeper"
//! output_asset_id = "a8c6a5e5-0f52-4a8b-8e35-6a5a3e5f8d2c"
//! keystore_dir = "data/signer-1"
//! bind = "0.0.0.0:9001"
//!
//! [[members]]
//! id = "signer-1"
//! transport_public = "<hex x25519 public key>"
//! url = "http://localhost:9001"
//! ```

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("missing required setting: {0}")]
    Missing(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfig {
    pub id: String,
    /// Hex x25519 key private round messages are sealed to
    pub transport_public: String,
    /// Base URL of the member's `/bus` endpoint
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub node_id: String,
    pub members: Vec<MemberConfig>,
    pub threshold: u16,
    /// Bus member that receives keygen and sign outputs
    pub keeper_id: String,
    #[serde(default)]
    pub keeper_url: Option<String>,
    /// Asset used for output transfers to the keeper
    pub output_asset_id: Uuid,
    pub keystore_dir: PathBuf,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum wait for one round of peer messages
    #[serde(default = "default_round_timeout")]
    pub round_timeout_secs: u64,
    /// Maximum lifetime of a whole session
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Hex secret shared with the keeper for operation memos
    #[serde(default)]
    pub operation_key: Option<String>,
    /// Hex x25519 secret of this node
    #[serde(default)]
    pub transport_key: Option<String>,
    #[serde(default)]
    pub keystore_password: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_round_timeout() -> u64 {
    60
}

fn default_session_timeout() -> u64 {
    600
}

impl SignerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: SignerConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ids: BTreeSet<&str> = self.members.iter().map(|m| m.id.as_str()).collect();
        if ids.len() != self.members.len() {
            return Err(ConfigError::InvalidValue(
                "members".to_string(),
                "duplicate member id".to_string(),
            ));
        }
        if !ids.contains(self.node_id.as_str()) {
            return Err(ConfigError::InvalidValue(
                "node_id".to_string(),
                format!("{} is not a member", self.node_id),
            ));
        }
        if self.threshold < 2 || self.threshold as usize > self.members.len() {
            return Err(ConfigError::InvalidValue(
                "threshold".to_string(),
                format!("{} of {}", self.threshold, self.members.len()),
            ));
        }
        if ids.contains(self.keeper_id.as_str()) {
            return Err(ConfigError::InvalidValue(
                "keeper_id".to_string(),
                "keeper cannot be a signer member".to_string(),
            ));
        }
        Ok(())
    }

    /// Member ids in canonical order
    pub fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids
    }

    /// Bus peer URLs, including the keeper when configured
    pub fn peer_urls(&self) -> BTreeMap<String, String> {
        let mut peers: BTreeMap<String, String> = self
            .members
            .iter()
            .filter_map(|m| m.url.clone().map(|url| (m.id.clone(), url)))
            .collect();
        if let Some(url) = &self.keeper_url {
            peers.insert(self.keeper_id.clone(), url.clone());
        }
        peers
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        node_id = "signer-2"
        threshold = 3
        keeper_id = "keeper"
        keeper_url = "http://localhost:7000"
        output_asset_id = "a8c6a5e5-0f52-4a8b-8e35-6a5a3e5f8d2c"
        keystore_dir = "data/signer-2"

        [[members]]
        id = "signer-1"
        transport_public = "00"
        url = "http://localhost:9001"

        [[members]]
        id = "signer-2"
        transport_public = "00"
        url = "http://localhost:9002"

        [[members]]
        id = "signer-3"
        transport_public = "00"

        [[members]]
        id = "signer-4"
        transport_public = "00"
    "#;

    #[test]
    fn test_parse_sample() {
        let config: SignerConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind, "0.0.0.0:9001");
        assert_eq!(config.round_timeout(), Duration::from_secs(60));
        assert_eq!(config.member_ids().len(), 4);

        let peers = config.peer_urls();
        assert_eq!(peers.len(), 3);
        assert_eq!(peers["keeper"], "http://localhost:7000");
    }

    #[test]
    fn test_threshold_bounds() {
        let mut config: SignerConfig = toml::from_str(SAMPLE).unwrap();
        config.threshold = 5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(..))));
        config.threshold = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_must_be_member() {
        let mut config: SignerConfig = toml::from_str(SAMPLE).unwrap();
        config.node_id = "signer-9".to_string();
        assert!(config.validate().is_err());
    }
}
