//! Signer node
//!
//! Receives sealed operations from the keeper as bus transfers, runs one
//! threshold session per operation id and sends the result back to the
//! keeper as a transfer with the sealed output in its memo.
//!
//! Session messages may arrive before the operation that starts the session
//! on this node; they are parked in a pending slot until it does. A slot is
//! keyed by the operation id and remembers the request it is running so a
//! redelivered request is ignored while running and answered again once
//! finished.

use crate::dkg;
use crate::ecdsa;
use crate::keystore::{KeyRing, Keystore, KeystoreError, StoredKey};
use crate::session::{Session, SessionContext, SessionError};
use crate::signing;
use frost_ed25519::Ed25519Sha512;
use frost_secp256k1_tr::Secp256K1Sha256TR;
use safe_common::ids::unique_id;
use safe_common::logging::{audit, AuditKind};
use safe_common::{
    derive_public, verify_signature, BusError, BusFrame, CodecError, CryptoError, Curve, DerivationError,
    Operation, OperationCipher, OperationType, Scheme, SessionMessage, SignatureError, Transfer,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

/// Nominal amount of the transfers carrying outputs
pub const OUTPUT_AMOUNT: &str = "0.00000001";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const FINISHED_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SignerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("no key with fingerprint {0}")]
    KeyNotFound(String),
    #[error("key is for {key}, operation is for {operation}")]
    CurveMismatch { key: Curve, operation: Curve },
}

enum SlotState {
    /// Messages arrived before the operation
    Pending(mpsc::UnboundedReceiver<SessionMessage>),
    Running(Operation),
    Finished { request: Operation, output: Operation },
}

struct SessionSlot {
    inbox: mpsc::UnboundedSender<SessionMessage>,
    state: SlotState,
    updated_at: Instant,
}

impl SessionSlot {
    fn running(op: Operation) -> (Self, mpsc::UnboundedReceiver<SessionMessage>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let slot = Self {
            inbox,
            state: SlotState::Running(op),
            updated_at: Instant::now(),
        };
        (slot, rx)
    }

    fn pending() -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        Self {
            inbox,
            state: SlotState::Pending(rx),
            updated_at: Instant::now(),
        }
    }
}

pub struct SignerNode {
    ctx: Arc<SessionContext>,
    keeper_id: String,
    output_asset_id: Uuid,
    cipher: OperationCipher,
    keystore: Keystore,
    keys: RwLock<KeyRing>,
    sessions: Mutex<BTreeMap<Uuid, SessionSlot>>,
    session_timeout: Duration,
}

impl SignerNode {
    /// Builds a node and loads every key share in the keystore
    pub fn new(
        ctx: Arc<SessionContext>,
        keeper_id: impl Into<String>,
        output_asset_id: Uuid,
        cipher: OperationCipher,
        keystore: Keystore,
        session_timeout: Duration,
    ) -> Result<Self, SignerError> {
        let keys = KeyRing::new(keystore.load_all()?);
        tracing::info!(node_id = %ctx.node_id, key_count = keys.len(), "signer node ready");
        Ok(Self {
            ctx,
            keeper_id: keeper_id.into(),
            output_asset_id,
            cipher,
            keystore,
            keys: RwLock::new(keys),
            sessions: Mutex::new(BTreeMap::new()),
            session_timeout,
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn keys(&self) -> Vec<StoredKey> {
        self.keys.read().await.iter().cloned().collect()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot.state, SlotState::Running(_)))
            .count()
    }

    /// Consumes inbound bus frames until the stream closes
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<BusFrame>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => break,
                },
                _ = cleanup.tick() => self.cleanup().await,
            }
        }
        tracing::info!(node_id = %self.ctx.node_id, "inbound bus closed, signer node stopping");
    }

    pub async fn handle_frame(self: &Arc<Self>, frame: BusFrame) {
        match frame {
            BusFrame::Session(message) => self.route(message).await,
            BusFrame::Transfer(transfer) => {
                let trace_id = transfer.trace_id;
                if let Err(e) = self.handle_transfer(transfer).await {
                    tracing::warn!(trace_id = %trace_id, error = %e, "rejected operation transfer");
                }
            }
        }
    }

    async fn route(&self, message: SessionMessage) {
        if !self.ctx.is_member(&message.from) {
            tracing::debug!(from = %message.from, "ignoring session message from non-member");
            return;
        }
        let mut sessions = self.sessions.lock().await;
        let slot = sessions.entry(message.session_id).or_insert_with(SessionSlot::pending);
        if matches!(slot.state, SlotState::Finished { .. }) {
            return;
        }
        // a closed inbox means the session already ended
        let _ = slot.inbox.send(message);
    }

    /// Starts or answers the operation sealed in a keeper transfer
    pub async fn handle_transfer(self: &Arc<Self>, transfer: Transfer) -> Result<(), SignerError> {
        if transfer.sender != self.keeper_id {
            tracing::debug!(sender = %transfer.sender, "ignoring transfer from non-keeper");
            return Ok(());
        }
        let op = self.cipher.open_operation(&transfer.memo)?;
        if !matches!(op.kind, OperationType::KeygenInput | OperationType::SignInput) {
            tracing::debug!(session_id = %op.id, kind = ?op.kind, "ignoring non-request operation");
            return Ok(());
        }

        let mut sessions = self.sessions.lock().await;
        let inbox = match sessions.get_mut(&op.id) {
            Some(slot) => match std::mem::replace(&mut slot.state, SlotState::Running(op.clone())) {
                SlotState::Pending(rx) => {
                    slot.updated_at = Instant::now();
                    rx
                }
                SlotState::Running(running) => {
                    let conflict = running != op;
                    slot.state = SlotState::Running(running);
                    if conflict {
                        audit(AuditKind::SessionConflict, &op.id.to_string(), "different operation for a running session");
                    }
                    return Ok(());
                }
                SlotState::Finished { request, output } => {
                    let conflict = request != op;
                    slot.state = SlotState::Finished {
                        request,
                        output: output.clone(),
                    };
                    drop(sessions);
                    if conflict {
                        audit(AuditKind::SessionConflict, &op.id.to_string(), "different operation for a finished session");
                        return Ok(());
                    }
                    tracing::info!(session_id = %op.id, "request redelivered, publishing stored output");
                    return self.publish(&output).await;
                }
            },
            None => {
                if op.kind == OperationType::KeygenInput {
                    let existing = self.keys.read().await.by_session(&op.id).map(StoredKey::output);
                    if let Some(output) = existing {
                        drop(sessions);
                        tracing::info!(session_id = %op.id, "key already generated, publishing stored output");
                        return self.publish(&output).await;
                    }
                }
                let (slot, rx) = SessionSlot::running(op.clone());
                sessions.insert(op.id, slot);
                rx
            }
        };
        drop(sessions);

        tracing::info!(session_id = %op.id, kind = ?op.kind, curve = %op.curve, "starting session");
        let session = Session::new(op.id, self.ctx.clone(), inbox);
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::time::timeout(node.session_timeout, node.execute(session, &op)).await;
            match result {
                Ok(Ok(output)) => {
                    let session_id = op.id;
                    node.finish(op, output.clone()).await;
                    if let Err(e) = node.publish(&output).await {
                        tracing::warn!(session_id = %session_id, error = %e, "failed to publish output");
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %op.id, error = %e, "session aborted");
                    node.abandon(op.id).await;
                }
                Err(_) => {
                    tracing::warn!(session_id = %op.id, "session timed out");
                    node.abandon(op.id).await;
                }
            }
        });
        Ok(())
    }

    async fn execute(&self, session: Session, op: &Operation) -> Result<Operation, SignerError> {
        match op.kind {
            OperationType::KeygenInput => self.keygen(session, op.curve).await,
            _ => self.sign(session, op).await,
        }
    }

    async fn keygen(&self, mut session: Session, curve: Curve) -> Result<Operation, SignerError> {
        let key = match curve.scheme() {
            Scheme::FrostSecp256k1 => dkg::run_keygen::<Secp256K1Sha256TR>(&mut session, curve).await?,
            Scheme::FrostEd25519 => dkg::run_keygen::<Ed25519Sha512>(&mut session, curve).await?,
            Scheme::Ecdsa => ecdsa::run_keygen(session, curve).await?,
        };
        self.keystore.save(&key)?;
        let output = key.output();
        self.keys.write().await.insert(key);
        Ok(output)
    }

    async fn sign(&self, mut session: Session, op: &Operation) -> Result<Operation, SignerError> {
        let (fingerprint, path) = op.signing_target()?;
        let key = self
            .keys
            .read()
            .await
            .get(&fingerprint)
            .cloned()
            .ok_or_else(|| SignerError::KeyNotFound(hex::encode(fingerprint)))?;
        if key.curve != op.curve {
            return Err(SignerError::CurveMismatch {
                key: key.curve,
                operation: op.curve,
            });
        }

        let scheme = op.curve.scheme();
        let child = derive_public(scheme, &key.public, &key.chain_code, &path)?;
        tracing::debug!(
            session_id = %op.id,
            depth = path.depth(),
            child = %hex::encode(&child.public),
            "derived signing key"
        );

        let signature = match scheme {
            Scheme::FrostSecp256k1 => {
                signing::run_sign::<Secp256K1Sha256TR>(&mut session, &key, &child, &op.extra).await?
            }
            Scheme::FrostEd25519 => signing::run_sign::<Ed25519Sha512>(&mut session, &key, &child, &op.extra).await?,
            Scheme::Ecdsa => ecdsa::run_sign(session, key.clone(), child.clone(), op.extra.clone()).await?,
        };

        if let Err(e) = verify_signature(op.curve, &child.public, &op.extra, &signature) {
            audit(AuditKind::SignatureMismatch, &op.id.to_string(), &e.to_string());
            return Err(e.into());
        }
        Ok(Operation::sign_output(op.id, op.curve, child.public, signature))
    }

    /// Sends `output` to the keeper; replays reuse the same trace id
    async fn publish(&self, output: &Operation) -> Result<(), SignerError> {
        let memo = self.cipher.seal_operation(output)?;
        let trace_id = unique_id(&[output.id.as_bytes(), self.ctx.node_id.as_bytes(), b"output"]);
        let transfer = Transfer {
            trace_id,
            transaction_hash: hex::encode(Sha256::digest(trace_id.as_bytes())),
            sender: self.ctx.node_id.clone(),
            receivers: vec![self.keeper_id.clone()],
            threshold: 1,
            asset_id: self.output_asset_id,
            amount: OUTPUT_AMOUNT.to_string(),
            memo,
        };
        self.ctx.bus().publish(BusFrame::Transfer(transfer)).await?;
        tracing::info!(session_id = %output.id, kind = ?output.kind, "output published");
        Ok(())
    }

    async fn finish(&self, request: Operation, output: Operation) {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get_mut(&request.id) {
            slot.state = SlotState::Finished { request, output };
            slot.updated_at = Instant::now();
        }
    }

    /// Drops all state of a failed session so a redelivery starts over
    async fn abandon(&self, session_id: Uuid) {
        self.sessions.lock().await.remove(&session_id);
    }

    async fn cleanup(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, slot| {
            let age = now.duration_since(slot.updated_at);
            match slot.state {
                SlotState::Pending(_) => age < self.session_timeout,
                SlotState::Running(_) => true,
                SlotState::Finished { .. } => age < FINISHED_RETENTION,
            }
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "expired session slots");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::group;
    use safe_common::{DerivationPath, MemoryBus};
    use tempfile::TempDir;

    fn node(dir: &TempDir) -> (Arc<SignerNode>, Arc<MemoryBus>, mpsc::UnboundedReceiver<BusFrame>) {
        let bus = MemoryBus::new();
        let keeper = bus.join("keeper");
        let (ctx, _rx) = group(bus.clone(), &["a", "b"], 2, Duration::from_secs(1))
            .into_iter()
            .next()
            .unwrap();
        let node = SignerNode::new(
            ctx,
            "keeper",
            Uuid::new_v4(),
            OperationCipher::new(b"operation secret"),
            Keystore::new(dir.path(), "a", "password"),
            Duration::from_secs(5),
        )
        .unwrap();
        (Arc::new(node), bus, keeper)
    }

    fn transfer(node: &SignerNode, sender: &str, op: &Operation) -> Transfer {
        Transfer {
            trace_id: Uuid::new_v4(),
            transaction_hash: "tx".to_string(),
            sender: sender.to_string(),
            receivers: vec!["a".to_string()],
            threshold: 1,
            asset_id: Uuid::new_v4(),
            amount: "1".to_string(),
            memo: node.cipher.seal_operation(op).unwrap(),
        }
    }

    fn stored_key(session_id: Uuid) -> StoredKey {
        StoredKey {
            session_id,
            curve: Curve::Secp256k1EcdsaBitcoin,
            public: vec![2u8; 33],
            chain_code: [1u8; 32],
            share: crate::keystore::KeyShare::Ecdsa {
                private_share: vec![1u8; 32],
                public_key: vec![2u8; 33],
            },
        }
    }

    #[tokio::test]
    async fn test_transfers_from_strangers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _bus, _keeper) = node(&dir);
        let op = Operation::keygen_input(Uuid::new_v4(), Curve::Edwards25519Default);
        node.handle_transfer(transfer(&node, "mallory", &op)).await.unwrap();
        assert_eq!(node.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_redelivered_keygen_republishes_stored_key() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _bus, mut keeper) = node(&dir);
        let id = Uuid::new_v4();
        node.keys.write().await.insert(stored_key(id));

        let op = Operation::keygen_input(id, Curve::Secp256k1EcdsaBitcoin);
        node.handle_transfer(transfer(&node, "keeper", &op)).await.unwrap();

        let Ok(BusFrame::Transfer(out)) = keeper.try_recv() else {
            panic!("expected an output transfer");
        };
        assert_eq!(out.amount, OUTPUT_AMOUNT);
        let output = node.cipher.open_operation(&out.memo).unwrap();
        assert_eq!(output, stored_key(id).output());
        assert!(op.is_answered_by(&output));
        assert_eq!(node.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_sign_for_unknown_key_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _bus, mut keeper) = node(&dir);
        let op = Operation::sign_input(
            Uuid::new_v4(),
            Curve::Secp256k1SchnorrBitcoin,
            [7u8; 8],
            &DerivationPath::master(),
            b"mixin".to_vec(),
        );
        node.handle_transfer(transfer(&node, "keeper", &op)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(keeper.try_recv().is_err());
        assert!(node.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_early_messages_wait_in_pending_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _bus, _keeper) = node(&dir);
        let id = Uuid::new_v4();
        node.route(SessionMessage {
            session_id: id,
            round: 1,
            seq: 0,
            from: "b".to_string(),
            to: None,
            payload: vec![1],
        })
        .await;
        node.route(SessionMessage {
            session_id: Uuid::new_v4(),
            round: 1,
            seq: 0,
            from: "mallory".to_string(),
            to: None,
            payload: vec![1],
        })
        .await;

        let sessions = node.sessions.lock().await;
        assert_eq!(sessions.len(), 1);
        assert!(matches!(sessions[&id].state, SlotState::Pending(_)));
    }
}
