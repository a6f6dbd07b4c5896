//! Tracing setup and audit events
//!
//! `RUST_LOG` wins when set; otherwise the filter is built from the level
//! passed in. Audit events go to the `audit` target so operators can route
//! them separately.

use serde::Serialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Installs the global subscriber for a binary
pub fn init_logging(crate_name: &str, level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "info,{}={},safe_common={},audit=info",
            crate_name.replace('-', "_"),
            level.as_str(),
            level.as_str()
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))
    }
}

/// What an audit event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    MaliciousDeposit,
    DuplicateDeposit,
    SignatureMismatch,
    SessionConflict,
    InvariantViolation,
}

impl AuditKind {
    fn as_str(self) -> &'static str {
        match self {
            AuditKind::MaliciousDeposit => "malicious_deposit",
            AuditKind::DuplicateDeposit => "duplicate_deposit",
            AuditKind::SignatureMismatch => "signature_mismatch",
            AuditKind::SessionConflict => "session_conflict",
            AuditKind::InvariantViolation => "invariant_violation",
        }
    }
}

/// Records an audit event; invariant violations are logged at error level
pub fn audit(kind: AuditKind, entity: &str, detail: &str) {
    match kind {
        AuditKind::InvariantViolation | AuditKind::SessionConflict => {
            tracing::error!(target: "audit", kind = kind.as_str(), entity, detail, "audit event")
        }
        _ => tracing::warn!(target: "audit", kind = kind.as_str(), entity, detail, "audit event"),
    }
}
