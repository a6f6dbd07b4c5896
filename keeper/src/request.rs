//! Keeper requests
//!
//! A request is a bus transfer addressed to the keeper. Holders and the
//! observer put a base64 envelope in the memo whose type byte is the
//! action; signers put a sealed operation there. An action is only
//! accepted from the role it belongs to.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use safe_common::{Chain, Curve, Envelope, Operation, OperationCipher, OperationType};
use uuid::Uuid;

use crate::error::{KeeperError, Result};
use crate::types::Role;

pub const ACTION_PROPOSE_SAFE: u8 = 110;
pub const ACTION_PROPOSE_TRANSACTION: u8 = 111;
pub const ACTION_CLOSE_SAFE: u8 = 112;
pub const ACTION_DEPOSIT: u8 = 120;
pub const ACTION_ADD_OBSERVER_KEY: u8 = 121;

/// Compressed secp256k1 key width used for holders and observers
pub const KEY_LEN: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ProposeSafe,
    ProposeTransaction,
    CloseSafe,
    Deposit,
    AddObserverKey,
    KeygenOutput,
    SignOutput,
}

impl Action {
    pub fn tag(self) -> u8 {
        match self {
            Action::ProposeSafe => ACTION_PROPOSE_SAFE,
            Action::ProposeTransaction => ACTION_PROPOSE_TRANSACTION,
            Action::CloseSafe => ACTION_CLOSE_SAFE,
            Action::Deposit => ACTION_DEPOSIT,
            Action::AddObserverKey => ACTION_ADD_OBSERVER_KEY,
            Action::KeygenOutput => OperationType::KeygenOutput.tag(),
            Action::SignOutput => OperationType::SignOutput.tag(),
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            ACTION_PROPOSE_SAFE => Some(Action::ProposeSafe),
            ACTION_PROPOSE_TRANSACTION => Some(Action::ProposeTransaction),
            ACTION_CLOSE_SAFE => Some(Action::CloseSafe),
            ACTION_DEPOSIT => Some(Action::Deposit),
            ACTION_ADD_OBSERVER_KEY => Some(Action::AddObserverKey),
            2 => Some(Action::KeygenOutput),
            4 => Some(Action::SignOutput),
            _ => None,
        }
    }

    /// The only role allowed to send this action
    pub fn role(self) -> Role {
        match self {
            Action::ProposeSafe | Action::ProposeTransaction | Action::CloseSafe => Role::Holder,
            Action::Deposit | Action::AddObserverKey => Role::Observer,
            Action::KeygenOutput | Action::SignOutput => Role::Signer,
        }
    }
}

/// A decoded request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub action: Action,
    pub envelope: Envelope,
}

impl Request {
    /// Decodes a transfer memo sent by `role`
    pub fn parse(memo: &str, role: Role, cipher: &OperationCipher) -> Result<Self> {
        if role == Role::Signer {
            let op = cipher
                .open_operation(memo)
                .map_err(|e| KeeperError::malformed(e.to_string()))?;
            let action = match op.kind {
                OperationType::KeygenOutput => Action::KeygenOutput,
                OperationType::SignOutput => Action::SignOutput,
                other => return Err(KeeperError::malformed(format!("signer sent {:?}", other))),
            };
            return Ok(Self {
                action,
                envelope: op.into(),
            });
        }

        let bytes = STANDARD
            .decode(memo.trim())
            .map_err(|e| KeeperError::malformed(format!("memo is not base64: {}", e)))?;
        let envelope = Envelope::decode(&bytes)?;
        let action = Action::from_tag(envelope.tag)
            .ok_or_else(|| KeeperError::malformed(format!("unknown action {}", envelope.tag)))?;
        if action.role() != role {
            return Err(KeeperError::malformed(format!(
                "{:?} is not a {} action",
                action, role
            )));
        }
        Ok(Self { action, envelope })
    }

    /// Hex key carried in `public`, for holder and observer actions
    pub fn key_hex(&self) -> Result<String> {
        if self.envelope.public.len() != KEY_LEN {
            return Err(KeeperError::malformed(format!(
                "key of {} bytes",
                self.envelope.public.len()
            )));
        }
        Ok(hex::encode(&self.envelope.public))
    }

    /// Signer output carried by a signer request
    pub fn operation(&self) -> Result<Operation> {
        Ok(Operation::try_from(self.envelope.clone())?)
    }
}

/// Base64 memo for a holder or observer request
pub fn encode_memo(envelope: &Envelope) -> Result<String> {
    Ok(STANDARD.encode(envelope.encode()?))
}

fn chain_byte(extra: &[u8]) -> Result<Chain> {
    let id = *extra
        .first()
        .ok_or_else(|| KeeperError::malformed("empty extra"))?;
    Chain::from_id(id).map_err(|e| KeeperError::malformed(e.to_string()))
}

/// Parameters of a new safe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeProposal {
    pub chain: Chain,
    pub observer: Vec<u8>,
    /// Relative timelock in blocks
    pub timelock: u16,
    pub threshold: u8,
    pub receivers: Vec<Uuid>,
}

impl SafeProposal {
    /// `chain | observer(33) | timelock(u16 BE) | threshold | receivers(16 each)`
    pub fn parse(extra: &[u8]) -> Result<Self> {
        let chain = chain_byte(extra)?;
        let fixed = 1 + KEY_LEN + 2 + 1;
        if extra.len() < fixed || (extra.len() - fixed) % 16 != 0 {
            return Err(KeeperError::malformed(format!("safe proposal of {} bytes", extra.len())));
        }
        let observer = extra[1..1 + KEY_LEN].to_vec();
        let timelock = u16::from_be_bytes([extra[1 + KEY_LEN], extra[2 + KEY_LEN]]);
        let threshold = extra[3 + KEY_LEN];
        let receivers = extra[fixed..]
            .chunks_exact(16)
            .map(|c| Uuid::from_slice(c).map_err(|e| KeeperError::malformed(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            chain,
            observer,
            timelock,
            threshold,
            receivers,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.chain.id()];
        out.extend_from_slice(&self.observer);
        out.extend_from_slice(&self.timelock.to_be_bytes());
        out.push(self.threshold);
        for receiver in &self.receivers {
            out.extend_from_slice(receiver.as_bytes());
        }
        out
    }
}

/// A holder's spend from an approved safe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionProposal {
    pub chain: Chain,
    pub asset_id: Uuid,
    pub amount: u128,
    pub receiver: String,
}

impl TransactionProposal {
    /// `chain | asset(16) | amount(16 BE) | receiver (utf-8)`
    pub fn parse(extra: &[u8]) -> Result<Self> {
        let chain = chain_byte(extra)?;
        if extra.len() <= 1 + 16 + 16 {
            return Err(KeeperError::malformed(format!("transaction proposal of {} bytes", extra.len())));
        }
        let asset_id = Uuid::from_slice(&extra[1..17]).map_err(|e| KeeperError::malformed(e.to_string()))?;
        let mut amount = [0u8; 16];
        amount.copy_from_slice(&extra[17..33]);
        let amount = u128::from_be_bytes(amount);
        if amount == 0 {
            return Err(KeeperError::malformed("zero amount"));
        }
        let receiver = std::str::from_utf8(&extra[33..])
            .map_err(|e| KeeperError::malformed(e.to_string()))?
            .to_string();
        Ok(Self {
            chain,
            asset_id,
            amount,
            receiver,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.chain.id()];
        out.extend_from_slice(self.asset_id.as_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(self.receiver.as_bytes());
        out
    }
}

/// Envelope of a holder or observer request; `id` is informational
pub fn envelope(action: Action, curve: Curve, public: Vec<u8>, extra: Vec<u8>) -> Envelope {
    Envelope {
        tag: action.tag(),
        curve,
        id: Uuid::new_v4(),
        public,
        extra,
    }
}
