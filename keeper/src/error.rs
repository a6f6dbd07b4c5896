//! Keeper error types
//!
//! Errors fall in four classes: malformed or rejected input fails the
//! request, transient upstream trouble leaves it initial for a retry,
//! malicious input fails it with an audit event and an invariant violation
//! halts the safe it touches.

use safe_common::logging::AuditKind;
use safe_common::{BusError, CodecError, CryptoError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::deposit::DepositError;
use crate::rpc::RpcError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("deposit error: {0}")]
    Deposit(#[from] DepositError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Payload does not parse or does not fit the sender's role
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Well formed but not allowed in the current state
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("malicious request: {detail}")]
    Malicious { kind: AuditKind, detail: String },

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl KeeperError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn malicious(kind: AuditKind, detail: impl Into<String>) -> Self {
        Self::Malicious {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Upstream trouble worth retrying with backoff inside one delivery
    pub fn is_retryable(&self) -> bool {
        match self {
            KeeperError::Rpc(_) | KeeperError::Bus(_) => true,
            KeeperError::Storage(e) => matches!(e, StorageError::Database(_) | StorageError::Connection(_)),
            KeeperError::Deposit(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Leave the request initial without retrying now
    pub fn is_deferred(&self) -> bool {
        matches!(self, KeeperError::Deposit(DepositError::NotYetFinal { .. }))
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, KeeperError::Invariant(_))
    }

    /// Audit event a permanent failure must raise
    pub fn audit_kind(&self) -> Option<AuditKind> {
        match self {
            KeeperError::Malicious { kind, .. } => Some(*kind),
            KeeperError::Deposit(DepositError::Malicious(_)) => Some(AuditKind::MaliciousDeposit),
            KeeperError::Deposit(DepositError::Duplicate { .. }) => Some(AuditKind::DuplicateDeposit),
            _ => None,
        }
    }

    /// Get error code for API responses and failure records
    pub fn error_code(&self) -> &'static str {
        match self {
            KeeperError::Config(_) => "CONFIG_ERROR",
            KeeperError::Storage(_) => "STORAGE_ERROR",
            KeeperError::Rpc(_) => "UPSTREAM_UNAVAILABLE",
            KeeperError::Deposit(e) => e.error_code(),
            KeeperError::Codec(_) | KeeperError::Malformed(_) => "MALFORMED_REQUEST",
            KeeperError::Crypto(_) => "CRYPTO_ERROR",
            KeeperError::Bus(_) => "BUS_ERROR",
            KeeperError::Rejected(_) => "REJECTED",
            KeeperError::Malicious { .. } => "MALICIOUS_REQUEST",
            KeeperError::Invariant(_) => "INVARIANT_VIOLATION",
        }
    }
}

/// Result type alias using KeeperError
pub type Result<T> = std::result::Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let upstream = KeeperError::from(RpcError::TxNotFound("aa".to_string()));
        assert!(upstream.is_retryable());
        assert_eq!(upstream.error_code(), "UPSTREAM_UNAVAILABLE");

        let pending = KeeperError::from(DepositError::NotYetFinal {
            confirmations: 0,
            required: 3,
        });
        assert!(pending.is_deferred());
        assert!(!pending.is_retryable());

        let bad = KeeperError::malformed("short extra");
        assert!(!bad.is_retryable());
        assert!(bad.audit_kind().is_none());
        assert_eq!(bad.error_code(), "MALFORMED_REQUEST");
    }

    #[test]
    fn test_audited_failures() {
        let forged = KeeperError::from(DepositError::Malicious("amount mismatch".to_string()));
        assert_eq!(forged.audit_kind(), Some(AuditKind::MaliciousDeposit));

        let mismatch = KeeperError::malicious(AuditKind::SignatureMismatch, "bad ownership proof");
        assert_eq!(mismatch.audit_kind(), Some(AuditKind::SignatureMismatch));
        assert!(mismatch.to_string().contains("bad ownership proof"));

        assert!(KeeperError::invariant("negative balance").is_invariant());
    }

    #[test]
    fn test_storage_errors() {
        assert!(KeeperError::from(StorageError::Database("locked".to_string())).is_retryable());
        assert!(!KeeperError::from(StorageError::InvalidData("bad row".to_string())).is_retryable());
    }
}
