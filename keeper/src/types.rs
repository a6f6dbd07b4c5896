//! Keeper records
//!
//! Every record here is persisted by the store. Requests move
//! initial → done/failed exactly once; safes move pending → approved → closed.

use safe_common::{Chain, Transfer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Processing state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Initial,
    Done,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestState::Initial)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown request state: {}", s)),
        }
    }
}

/// Who sent a request, decided by the sending conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Holder,
    Signer,
    Observer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Holder => "holder",
            Self::Signer => "signer",
            Self::Observer => "observer",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "holder" => Ok(Self::Holder),
            "signer" => Ok(Self::Signer),
            "observer" => Ok(Self::Observer),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// Lifecycle of a safe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeState {
    /// Waiting for the signer key and its ownership proof
    Pending,
    Approved,
    Closed,
}

impl std::fmt::Display for SafeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SafeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("unknown safe state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Pending,
    Signed,
}

impl std::fmt::Display for ProposalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Signed => "signed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ProposalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "signed" => Ok(Self::Signed),
            _ => Err(format!("unknown proposal state: {}", s)),
        }
    }
}

/// An inbound transfer as received, plus its processing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Trace id of the carrying transfer
    pub id: Uuid,
    pub role: Role,
    /// Action tag, 0 when the memo could not be parsed
    pub action: u8,
    pub sender: String,
    pub transaction_hash: String,
    pub asset_id: Uuid,
    pub amount: String,
    pub memo: String,
    pub state: RequestState,
    pub failure: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RequestRecord {
    pub fn from_transfer(transfer: &Transfer, role: Role, action: u8) -> Self {
        let now = now_millis();
        Self {
            id: transfer.trace_id,
            role,
            action,
            sender: transfer.sender.clone(),
            transaction_hash: transfer.transaction_hash.clone(),
            asset_id: transfer.asset_id,
            amount: transfer.amount.clone(),
            memo: transfer.memo.clone(),
            state: RequestState::Initial,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A custody wallet bound to one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeRecord {
    /// Hex compressed holder key, unique per safe
    pub holder: String,
    /// Conversation that proposed the safe; only it may act as the holder
    pub owner: String,
    pub request_id: Uuid,
    pub chain: Chain,
    pub observer: String,
    /// Blocks before the holder and observer may recover without the signers
    pub timelock: u16,
    pub threshold: u8,
    pub receivers: Vec<String>,
    /// Encoded derivation path of the signer child key
    pub path: Vec<u8>,
    pub keygen_session: Uuid,
    pub signer: Option<String>,
    pub chain_code: Option<String>,
    pub signer_child: Option<String>,
    pub ownership_session: Option<Uuid>,
    pub ownership_signature: Option<String>,
    pub address: Option<String>,
    pub state: SafeState,
    /// Reason processing is halted for this safe
    pub halted: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An external-chain output credited to a safe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub transaction_hash: String,
    pub output_index: u64,
    pub chain: Chain,
    pub asset_id: Uuid,
    pub asset_address: Option<String>,
    pub amount: u128,
    pub holder: String,
    pub sender: Option<String>,
    pub request_id: Uuid,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub address: String,
    pub asset_id: Uuid,
    pub bond_asset_id: Uuid,
    pub balance: u128,
    pub updated_at: i64,
}

/// A holder's spend from a safe, waiting for or carrying its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: Uuid,
    pub holder: String,
    pub address: String,
    pub chain: Chain,
    pub asset_id: Uuid,
    pub amount: u128,
    pub receiver: String,
    pub digest: String,
    pub session_id: Uuid,
    pub signature: Option<String>,
    pub state: ProposalState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outgoing transfer on the group ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub trace_id: Uuid,
    pub request_id: Uuid,
    pub asset_id: Uuid,
    pub receivers: Vec<String>,
    pub threshold: u8,
    /// Decimal amount in asset units
    pub amount: String,
    pub memo: String,
}

impl LedgerTransaction {
    pub fn to_transfer(&self, sender: &str) -> Transfer {
        Transfer {
            trace_id: self.trace_id,
            transaction_hash: hex::encode(Sha256::digest(self.trace_id.as_bytes())),
            sender: sender.to_string(),
            receivers: self.receivers.clone(),
            threshold: self.threshold,
            asset_id: self.asset_id,
            amount: self.amount.clone(),
            memo: self.memo.clone(),
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_round_trip() {
        for state in [RequestState::Initial, RequestState::Done, RequestState::Failed] {
            assert_eq!(state.to_string().parse::<RequestState>().unwrap(), state);
        }
        for state in [SafeState::Pending, SafeState::Approved, SafeState::Closed] {
            assert_eq!(state.to_string().parse::<SafeState>().unwrap(), state);
        }
        assert!("halted".parse::<SafeState>().is_err());
    }

    #[test]
    fn test_only_initial_is_open() {
        assert!(!RequestState::Initial.is_terminal());
        assert!(RequestState::Done.is_terminal());
        assert!(RequestState::Failed.is_terminal());
    }

    #[test]
    fn test_transfer_hash_follows_trace_id() {
        let tx = LedgerTransaction {
            trace_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            receivers: vec!["a".to_string()],
            threshold: 1,
            amount: "1".to_string(),
            memo: String::new(),
        };
        let first = tx.to_transfer("keeper");
        let again = tx.to_transfer("keeper");
        assert_eq!(first.transaction_hash, again.transaction_hash);
        assert_eq!(first.sender, "keeper");
    }
}
