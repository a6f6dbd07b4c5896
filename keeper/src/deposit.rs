//! Deposit Verifier
//!
//! An observer claims that an external-chain output paid a safe. The claim
//! is only credited when the chain agrees with it exactly and the output
//! is final:
//!
//! 1. the extra parses into chain, asset, hash, index and amount
//! 2. the safe exists, is approved and lives on the claimed chain
//! 3. (hash, index) was never credited before
//! 4. the on-chain output pays the safe address the claimed amount
//! 5. the output has enough confirmations, or one confirmation when the
//!    funding transaction comes from a trusted sender

use safe_common::ids::{trace_id, unique_id};
use safe_common::Chain;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::format_amount;
use crate::rpc::{ChainClients, RpcError, TxOutput};
use crate::storage::{Commit, StorageError, Store, Write};
use crate::types::{now_millis, DepositRecord, LedgerTransaction, SafeRecord, SafeState};

/// Senders whose deposits are final after one confirmation
pub const TRUSTED_SENDERS: [&str; 3] = [
    "bc1ql24x05zhqrpejar0p3kevhu48yhnnr3r95sv4y",
    "ltc1qs46hqx885kpz83vfg6evm9dsuapznfaw997qwl",
    "0x1616b057F8a89955d4A4f9fd9Eb10289ac0e44A1",
];

/// Confirmations assumed for a trusted output with at least one
pub const TRUSTED_CONFIRMATIONS: u64 = 1_000_000;

const HASH_LEN: usize = 32;
const TOKEN_LEN: usize = 20;
const INDEX_LEN: usize = 8;
const MAX_AMOUNT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum DepositError {
    #[error("invalid deposit extra: {0}")]
    InvalidExtra(String),

    #[error("safe not ready: {0}")]
    SafeNotReady(String),

    #[error("deposit {hash}:{index} already credited")]
    Duplicate { hash: String, index: u64 },

    #[error("malicious deposit: {0}")]
    Malicious(String),

    #[error("{confirmations} of {required} confirmations")]
    NotYetFinal { confirmations: u64, required: u64 },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] RpcError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DepositError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DepositError::UpstreamUnavailable(_) => true,
            DepositError::Storage(e) => matches!(e, StorageError::Database(_) | StorageError::Connection(_)),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            DepositError::InvalidExtra(_) => "INVALID_DEPOSIT_EXTRA",
            DepositError::SafeNotReady(_) => "SAFE_NOT_READY",
            DepositError::Duplicate { .. } => "DUPLICATE_DEPOSIT",
            DepositError::Malicious(_) => "MALICIOUS_DEPOSIT",
            DepositError::NotYetFinal { .. } => "NOT_YET_FINAL",
            DepositError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            DepositError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

/// A claimed deposit as carried in an observer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub chain: Chain,
    pub asset_id: Uuid,
    /// Plain hex on UTXO chains, `0x` prefixed on EVM chains
    pub hash: String,
    /// Lowercase token contract; `None` for the native coin
    pub asset_address: Option<String>,
    pub index: u64,
    pub amount: u128,
}

fn invalid(msg: impl Into<String>) -> DepositError {
    DepositError::InvalidExtra(msg.into())
}

impl Deposit {
    /// `chain | asset(16) | hash(32) | [token(20)] | index(8 BE) | amount(BE)`
    pub fn parse(extra: &[u8]) -> Result<Self, DepositError> {
        if extra.len() < 1 + 16 + HASH_LEN + INDEX_LEN {
            return Err(invalid(format!("{} bytes", extra.len())));
        }
        let chain = Chain::from_id(extra[0]).map_err(|e| invalid(e.to_string()))?;
        let asset_id = Uuid::from_slice(&extra[1..17]).map_err(|e| invalid(e.to_string()))?;
        let rest = &extra[17..];

        let (hash, asset_address, rest) = if chain.is_utxo() {
            (hex::encode(&rest[..HASH_LEN]), None, &rest[HASH_LEN..])
        } else {
            if rest.len() < HASH_LEN + TOKEN_LEN + INDEX_LEN {
                return Err(invalid(format!("{} bytes", extra.len())));
            }
            let token = &rest[HASH_LEN..HASH_LEN + TOKEN_LEN];
            let asset_address = if token.iter().all(|&b| b == 0) {
                None
            } else {
                Some(format!("0x{}", hex::encode(token)))
            };
            (
                format!("0x{}", hex::encode(&rest[..HASH_LEN])),
                asset_address,
                &rest[HASH_LEN + TOKEN_LEN..],
            )
        };

        let mut index = [0u8; INDEX_LEN];
        index.copy_from_slice(&rest[..INDEX_LEN]);
        let index = u64::from_be_bytes(index);

        let amount_bytes = &rest[INDEX_LEN..];
        if amount_bytes.is_empty() || amount_bytes.len() > MAX_AMOUNT_LEN {
            return Err(invalid(format!("amount of {} bytes", amount_bytes.len())));
        }
        let amount = amount_bytes.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128);
        if amount == 0 {
            return Err(invalid("zero amount"));
        }
        if chain.is_utxo() && amount > i64::MAX as u128 {
            return Err(invalid(format!("amount {} overflows i64", amount)));
        }

        let native = chain.native_asset_id();
        if asset_address.is_none() && asset_id != native {
            return Err(invalid(format!("asset {} is not native to {}", asset_id, chain)));
        }

        Ok(Self {
            chain,
            asset_id,
            hash,
            asset_address,
            index,
            amount,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, DepositError> {
        let hash = hex::decode(self.hash.trim_start_matches("0x")).map_err(|e| invalid(e.to_string()))?;
        if hash.len() != HASH_LEN {
            return Err(invalid(format!("hash of {} bytes", hash.len())));
        }
        let mut out = vec![self.chain.id()];
        out.extend_from_slice(self.asset_id.as_bytes());
        out.extend_from_slice(&hash);
        if !self.chain.is_utxo() {
            let token = match &self.asset_address {
                Some(address) => hex::decode(address.trim_start_matches("0x")).map_err(|e| invalid(e.to_string()))?,
                None => vec![0u8; TOKEN_LEN],
            };
            if token.len() != TOKEN_LEN {
                return Err(invalid(format!("token address of {} bytes", token.len())));
            }
            out.extend_from_slice(&token);
        }
        out.extend_from_slice(&self.index.to_be_bytes());
        let amount = self.amount.to_be_bytes();
        let skip = amount.iter().take_while(|&&b| b == 0).count().min(MAX_AMOUNT_LEN - 1);
        out.extend_from_slice(&amount[skip..]);
        Ok(out)
    }
}

/// Confirmations of an output at `height` seen from `current`
pub fn confirmations(current: u64, height: u64) -> u64 {
    if height == 0 || current < height {
        return 0;
    }
    current - height + 1
}

pub fn is_trusted_sender(sender: &str) -> bool {
    TRUSTED_SENDERS.iter().any(|t| t.eq_ignore_ascii_case(sender))
}

/// Bond asset the receivers of `holder`'s safe hold for `asset_id`
pub fn bond_asset_id(holder: &str, asset_id: Uuid) -> Uuid {
    unique_id(&[holder.as_bytes(), asset_id.as_bytes()])
}

/// A deposit the chain confirmed, ready to be credited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedInput {
    pub deposit: DepositRecord,
    pub safe: SafeRecord,
    pub bond_asset_id: Uuid,
    pub confirmations: u64,
}

impl VerifiedInput {
    /// Deposit record, credit and the bond transfer to the safe receivers
    pub fn into_commit(self) -> Commit {
        let request_id = self.deposit.request_id;
        let address = self.safe.address.clone().unwrap_or_default();
        let transaction = LedgerTransaction {
            trace_id: trace_id(&request_id, "deposit"),
            request_id,
            asset_id: self.bond_asset_id,
            receivers: self.safe.receivers.clone(),
            threshold: self.safe.threshold,
            amount: format_amount(self.deposit.amount, self.deposit.chain.decimals()),
            memo: String::new(),
        };
        let credit = Write::Credit {
            address,
            asset_id: self.deposit.asset_id,
            bond_asset_id: self.bond_asset_id,
            amount: self.deposit.amount,
        };
        Commit::done(request_id, vec![Write::InsertDeposit(self.deposit), credit], vec![transaction])
    }
}

pub struct DepositVerifier {
    store: Arc<dyn Store>,
    clients: ChainClients,
}

impl DepositVerifier {
    pub fn new(store: Arc<dyn Store>, clients: ChainClients) -> Self {
        Self { store, clients }
    }

    /// Checks `deposit` for the safe of `holder` on behalf of `request_id`
    pub async fn verify(&self, request_id: Uuid, holder: &str, deposit: &Deposit) -> Result<VerifiedInput, DepositError> {
        let safe = self
            .store
            .get_safe(holder)
            .await?
            .ok_or_else(|| DepositError::SafeNotReady(format!("no safe for {}", holder)))?;
        if safe.state != SafeState::Approved {
            return Err(DepositError::SafeNotReady(format!("safe is {}", safe.state)));
        }
        if safe.chain != deposit.chain {
            return Err(DepositError::SafeNotReady(format!("safe is on {}, deposit on {}", safe.chain, deposit.chain)));
        }
        let address = safe
            .address
            .clone()
            .ok_or_else(|| DepositError::SafeNotReady("approved safe without address".to_string()))?;

        if self.store.get_deposit(&deposit.hash, deposit.index).await?.is_some() {
            return Err(DepositError::Duplicate {
                hash: deposit.hash.clone(),
                index: deposit.index,
            });
        }

        let rpc = self.clients.get(deposit.chain)?;
        let output = match rpc.get_transaction_output(&deposit.hash, deposit.index).await {
            Ok(output) => output,
            Err(RpcError::OutputNotFound { hash, index }) => {
                return Err(DepositError::Malicious(format!("no output {}:{}", hash, index)));
            }
            Err(e) => return Err(e.into()),
        };
        check_output(deposit, &address, &output)?;

        let current = rpc.current_height().await?;
        let mut confirmations = confirmations(current, output.height);
        let mut required = deposit.chain.finality_threshold();
        if output.coinbase {
            required = required.max(deposit.chain.coinbase_maturity());
        }

        let mut sender = None;
        if confirmations > 0 {
            sender = rpc.get_transaction_sender(&deposit.hash).await?;
            if confirmations < required {
                if let Some(from) = &sender {
                    if self.is_trusted(from).await? {
                        tracing::info!(hash = %deposit.hash, sender = %from, "trusted sender, skipping finality wait");
                        confirmations = TRUSTED_CONFIRMATIONS;
                    }
                }
            }
        }
        if confirmations < required {
            return Err(DepositError::NotYetFinal { confirmations, required });
        }

        tracing::info!(
            hash = %deposit.hash,
            index = deposit.index,
            amount = %deposit.amount,
            address = %address,
            confirmations,
            "deposit verified"
        );
        Ok(VerifiedInput {
            bond_asset_id: bond_asset_id(&safe.holder, deposit.asset_id),
            deposit: DepositRecord {
                transaction_hash: deposit.hash.clone(),
                output_index: deposit.index,
                chain: deposit.chain,
                asset_id: deposit.asset_id,
                asset_address: deposit.asset_address.clone(),
                amount: deposit.amount,
                holder: safe.holder.clone(),
                sender,
                request_id,
                created_at: now_millis(),
            },
            safe,
            confirmations,
        })
    }

    async fn is_trusted(&self, sender: &str) -> Result<bool, DepositError> {
        if is_trusted_sender(sender) {
            return Ok(true);
        }
        Ok(self.store.safe_by_address(sender).await?.is_some())
    }
}

fn check_output(deposit: &Deposit, address: &str, output: &TxOutput) -> Result<(), DepositError> {
    let receiver_matches = if deposit.chain.is_utxo() {
        output.receiver == address
    } else {
        output.receiver.eq_ignore_ascii_case(address)
    };
    if !receiver_matches {
        return Err(DepositError::Malicious(format!(
            "output pays {} instead of {}",
            output.receiver, address
        )));
    }
    if output.amount != deposit.amount {
        return Err(DepositError::Malicious(format!(
            "output amount {} instead of {}",
            output.amount, deposit.amount
        )));
    }
    if !deposit.chain.is_utxo() {
        let claimed = deposit.asset_address.as_deref().map(str::to_lowercase);
        let actual = output.asset_address.as_deref().map(str::to_lowercase);
        if claimed != actual {
            return Err(DepositError::Malicious(format!("output token {:?} instead of {:?}", actual, claimed)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockChainRpc;
    use crate::storage::SqliteStore;
    use crate::testing::{approved_safe, seed, HOLDER};

    const SAFE_ADDRESS: &str = "bc1qsafe";

    fn btc_deposit(amount: u128) -> Deposit {
        Deposit {
            chain: Chain::Bitcoin,
            asset_id: Chain::Bitcoin.native_asset_id(),
            hash: "ab".repeat(32),
            asset_address: None,
            index: 1,
            amount,
        }
    }

    fn output(receiver: &str, amount: u128, height: u64) -> TxOutput {
        TxOutput {
            receiver: receiver.to_string(),
            amount,
            height,
            coinbase: false,
            asset_address: None,
        }
    }

    fn rpc(output: TxOutput, current: u64, sender: Option<&str>) -> MockChainRpc {
        let mut rpc = MockChainRpc::new();
        rpc.expect_get_transaction_output().returning(move |_, _| Ok(output.clone()));
        rpc.expect_current_height().returning(move || Ok(current));
        let sender = sender.map(str::to_string);
        rpc.expect_get_transaction_sender().returning(move |_| Ok(sender.clone()));
        rpc
    }

    async fn setup(rpc: MockChainRpc) -> (DepositVerifier, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        seed(&store, vec![Write::PutSafe(approved_safe(Chain::Bitcoin, SAFE_ADDRESS))]).await;
        let clients = ChainClients::new().with(Chain::Bitcoin, Arc::new(rpc));
        (DepositVerifier::new(store.clone(), clients), store)
    }

    #[test]
    fn test_parse_bitcoin_extra() {
        let deposit = btc_deposit(50_000);
        let extra = deposit.encode().unwrap();
        assert_eq!(extra.len(), 1 + 16 + 32 + 8 + 2);
        assert_eq!(Deposit::parse(&extra).unwrap(), deposit);
    }

    #[test]
    fn test_parse_ethereum_token_extra() {
        let token = Deposit {
            chain: Chain::Ethereum,
            asset_id: Uuid::new_v4(),
            hash: format!("0x{}", "cd".repeat(32)),
            asset_address: Some("0xdac17f958d2ee523a2206206994597c13d831ec7".to_string()),
            index: 3,
            amount: 1_000_000,
        };
        assert_eq!(Deposit::parse(&token.encode().unwrap()).unwrap(), token);

        let native = Deposit {
            asset_id: Chain::Ethereum.native_asset_id(),
            asset_address: None,
            amount: 10u128.pow(18),
            ..token
        };
        assert_eq!(Deposit::parse(&native.encode().unwrap()).unwrap(), native);
    }

    #[test]
    fn test_parse_rejects_bad_extra() {
        let extra = btc_deposit(50_000).encode().unwrap();
        assert!(matches!(Deposit::parse(&extra[..40]), Err(DepositError::InvalidExtra(_))));
        // index present, amount missing
        assert!(Deposit::parse(&extra[..1 + 16 + 32 + 8]).is_err());

        let mut wrong_asset = btc_deposit(50_000);
        wrong_asset.asset_id = Uuid::new_v4();
        assert!(Deposit::parse(&wrong_asset.encode().unwrap()).is_err());

        let mut too_large = extra[..1 + 16 + 32 + 8].to_vec();
        too_large.extend_from_slice(&[0x80, 0, 0, 0, 0, 0, 0, 0]);
        assert!(Deposit::parse(&too_large).is_err());

        let mut unknown_chain = extra.clone();
        unknown_chain[0] = 9;
        assert!(Deposit::parse(&unknown_chain).is_err());
    }

    #[test]
    fn test_confirmations_never_negative() {
        assert_eq!(confirmations(100, 0), 0);
        assert_eq!(confirmations(99, 100), 0);
        assert_eq!(confirmations(100, 100), 1);
        assert_eq!(confirmations(102, 100), 3);
    }

    #[test]
    fn test_trusted_senders_ignore_case() {
        assert!(is_trusted_sender("0x1616b057f8a89955d4a4f9fd9eb10289ac0e44a1"));
        assert!(is_trusted_sender("bc1ql24x05zhqrpejar0p3kevhu48yhnnr3r95sv4y"));
        assert!(!is_trusted_sender("bc1qsomeoneelse"));
    }

    #[tokio::test]
    async fn test_unconfirmed_deposit_is_deferred() {
        let (verifier, _) = setup(rpc(output(SAFE_ADDRESS, 50_000, 0), 840_000, None)).await;
        let err = verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await.unwrap_err();
        assert!(matches!(err, DepositError::NotYetFinal { confirmations: 0, required: 3 }));
    }

    #[tokio::test]
    async fn test_final_deposit_is_verified() {
        let (verifier, _) = setup(rpc(output(SAFE_ADDRESS, 50_000, 840_000), 840_002, None)).await;
        let request_id = Uuid::new_v4();
        let verified = verifier.verify(request_id, HOLDER, &btc_deposit(50_000)).await.unwrap();
        assert_eq!(verified.confirmations, 3);
        assert_eq!(verified.bond_asset_id, bond_asset_id(HOLDER, Chain::Bitcoin.native_asset_id()));

        let commit = verified.into_commit();
        assert_eq!(commit.request_id, request_id);
        assert_eq!(commit.writes.len(), 2);
        assert_eq!(commit.transactions.len(), 1);
        assert_eq!(commit.transactions[0].amount, "0.00050000");
        assert_eq!(commit.transactions[0].trace_id, trace_id(&request_id, "deposit"));
    }

    #[tokio::test]
    async fn test_trusted_sender_skips_finality_wait() {
        let trusted = rpc(output(SAFE_ADDRESS, 50_000, 840_000), 840_000, Some(TRUSTED_SENDERS[0]));
        let (verifier, _) = setup(trusted).await;
        let verified = verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await.unwrap();
        assert_eq!(verified.confirmations, TRUSTED_CONFIRMATIONS);

        // the fast path still needs one confirmation
        let pending = rpc(output(SAFE_ADDRESS, 50_000, 0), 840_000, Some(TRUSTED_SENDERS[0]));
        let (verifier, _) = setup(pending).await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await,
            Err(DepositError::NotYetFinal { .. })
        ));
    }

    #[tokio::test]
    async fn test_coinbase_needs_maturity() {
        let mut coinbase = output(SAFE_ADDRESS, 50_000, 840_000);
        coinbase.coinbase = true;
        let (verifier, _) = setup(rpc(coinbase, 840_010, None)).await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await,
            Err(DepositError::NotYetFinal { confirmations: 11, required: 100 })
        ));
    }

    #[tokio::test]
    async fn test_mismatched_output_is_malicious() {
        let (verifier, _) = setup(rpc(output(SAFE_ADDRESS, 49_999, 840_000), 840_010, None)).await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await,
            Err(DepositError::Malicious(_))
        ));

        let (verifier, _) = setup(rpc(output("bc1qattacker", 50_000, 840_000), 840_010, None)).await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await,
            Err(DepositError::Malicious(_))
        ));

        let mut missing = MockChainRpc::new();
        missing.expect_get_transaction_output().returning(|hash, index| {
            Err(RpcError::OutputNotFound {
                hash: hash.to_string(),
                index,
            })
        });
        let (verifier, _) = setup(missing).await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await,
            Err(DepositError::Malicious(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_node_is_retryable() {
        let mut down = MockChainRpc::new();
        down.expect_get_transaction_output()
            .returning(|hash, _| Err(RpcError::TxNotFound(hash.to_string())));
        let (verifier, _) = setup(down).await;
        let err = verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_safe_must_be_ready() {
        let (verifier, store) = setup(MockChainRpc::new()).await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), &"03".repeat(33), &btc_deposit(50_000)).await,
            Err(DepositError::SafeNotReady(_))
        ));

        let mut litecoin = btc_deposit(50_000);
        litecoin.chain = Chain::Litecoin;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &litecoin).await,
            Err(DepositError::SafeNotReady(_))
        ));

        let mut closed = approved_safe(Chain::Bitcoin, SAFE_ADDRESS);
        closed.state = SafeState::Closed;
        seed(&store, vec![Write::PutSafe(closed)]).await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await,
            Err(DepositError::SafeNotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_credited_deposit_is_duplicate() {
        let (verifier, store) = setup(rpc(output(SAFE_ADDRESS, 50_000, 840_000), 840_002, None)).await;
        let verified = verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await.unwrap();
        let commit = verified.into_commit();
        let request = crate::testing::request(crate::types::Role::Observer, 120);
        let commit = Commit {
            request_id: request.id,
            ..commit
        };
        store.insert_request(&request).await.unwrap();
        store.commit(&commit).await.unwrap();
        assert_eq!(
            store.read_balance(SAFE_ADDRESS, Chain::Bitcoin.native_asset_id()).await.unwrap(),
            50_000
        );

        assert!(matches!(
            verifier.verify(Uuid::new_v4(), HOLDER, &btc_deposit(50_000)).await,
            Err(DepositError::Duplicate { index: 1, .. })
        ));
    }
}
