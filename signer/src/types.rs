//! Response types for the signer status API

use safe_common::Curve;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Node identifier on the group bus
    pub node_id: String,
    /// Number of key shares held
    pub key_count: usize,
}

/// Signer group information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerInfo {
    pub node_id: String,
    /// Group members in canonical order
    pub members: Vec<String>,
    /// Threshold required for signing
    pub threshold: u16,
    pub key_count: usize,
    /// This node's x25519 transport key (hex)
    pub transport_public_key: String,
    /// Sessions currently tracked
    pub active_sessions: usize,
}

/// A group key held by this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub session_id: Uuid,
    pub curve: Curve,
    /// Published group public key (hex)
    pub public_key: String,
    /// Fingerprint referenced by sign inputs (hex)
    pub fingerprint: String,
    pub chain_code: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
