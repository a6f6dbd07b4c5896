//! End-to-end keygen and signing across a signer group on the in-memory bus

use safe_common::{
    derive_public, verify_signature, BusFrame, Curve, DerivationPath, GroupBus, MemoryBus, Operation,
    OperationCipher, OperationType, Transfer, TransportKey,
};
use safe_signer::{Keystore, SessionContext, SignerNode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

const KEEPER: &str = "keeper";

struct Group {
    bus: Arc<MemoryBus>,
    keeper: mpsc::UnboundedReceiver<BusFrame>,
    cipher: OperationCipher,
    members: Vec<String>,
    _dirs: Vec<TempDir>,
}

impl Group {
    fn start(size: usize, threshold: u16) -> Self {
        let bus = MemoryBus::new();
        let keeper = bus.join(KEEPER);
        let names: Vec<String> = (1..=size).map(|i| format!("signer-{}", i)).collect();
        let keys: Vec<TransportKey> = names.iter().map(|_| TransportKey::generate()).collect();
        let members: BTreeMap<String, String> = names
            .iter()
            .zip(&keys)
            .map(|(name, key)| (name.clone(), key.public_hex()))
            .collect();

        let mut dirs = Vec::new();
        for (name, key) in names.iter().zip(keys) {
            let dir = tempfile::tempdir().unwrap();
            let ctx = SessionContext::new(
                name.clone(),
                members.clone(),
                threshold,
                Duration::from_secs(120),
                key,
                bus.clone(),
            )
            .unwrap();
            let node = SignerNode::new(
                Arc::new(ctx),
                KEEPER,
                Uuid::new_v4(),
                OperationCipher::new(b"group operation key"),
                Keystore::new(dir.path(), name.clone(), "password"),
                Duration::from_secs(600),
            )
            .unwrap();
            tokio::spawn(Arc::new(node).run(bus.join(name)));
            dirs.push(dir);
        }

        Self {
            bus,
            keeper,
            cipher: OperationCipher::new(b"group operation key"),
            members: names,
            _dirs: dirs,
        }
    }

    /// Sends `op` to every member and returns one answer per member
    async fn request(&mut self, op: &Operation) -> Vec<Operation> {
        let transfer = Transfer {
            trace_id: Uuid::new_v4(),
            transaction_hash: hex::encode(op.id.as_bytes()),
            sender: KEEPER.to_string(),
            receivers: self.members.clone(),
            threshold: 1,
            asset_id: Uuid::new_v4(),
            amount: "0.00000001".to_string(),
            memo: self.cipher.seal_operation(op).unwrap(),
        };
        self.bus.publish(BusFrame::Transfer(transfer)).await.unwrap();

        let mut answers = BTreeMap::new();
        while answers.len() < self.members.len() {
            let frame = tokio::time::timeout(Duration::from_secs(600), self.keeper.recv())
                .await
                .expect("signer group timed out")
                .unwrap();
            let BusFrame::Transfer(transfer) = frame else {
                continue;
            };
            let answer = self.cipher.open_operation(&transfer.memo).unwrap();
            if answer.id == op.id {
                answers.insert(transfer.sender, answer);
            }
        }
        answers.into_values().collect()
    }

    async fn keygen(&mut self, curve: Curve) -> (Vec<u8>, [u8; 32]) {
        let op = Operation::keygen_input(Uuid::new_v4(), curve);
        let outputs = self.request(&op).await;
        assert!(outputs.iter().all(|o| o == &outputs[0]));
        assert!(op.is_answered_by(&outputs[0]));
        (outputs[0].public.clone(), outputs[0].chain_code().unwrap())
    }

    async fn sign(&mut self, curve: Curve, public: &[u8], path: &DerivationPath, message: &[u8]) -> Operation {
        let fingerprint = safe_common::fingerprint(public);
        let op = Operation::sign_input(Uuid::new_v4(), curve, fingerprint, path, message.to_vec());
        let outputs = self.request(&op).await;
        assert!(outputs.iter().all(|o| o.kind == OperationType::SignOutput));
        assert!(outputs.iter().all(|o| o.public == outputs[0].public));
        outputs[0].clone()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_schnorr_keygen_and_sign_three_of_four() {
    let curve = Curve::Secp256k1SchnorrBitcoin;
    let mut group = Group::start(4, 3);
    let (public, chain_code) = group.keygen(curve).await;
    assert_eq!(hex::encode(&public).len(), 64);

    let output = group.sign(curve, &public, &DerivationPath::master(), b"mixin").await;
    assert_eq!(output.public, public);
    assert!(verify_signature(curve, &public, b"mixin", &output.extra).is_ok());

    let path = DerivationPath::from_bytes(&[1, 123, 0, 0]).unwrap();
    let child = derive_public(curve.scheme(), &public, &chain_code, &path).unwrap();
    let output = group.sign(curve, &public, &path, b"mixin").await;
    assert_eq!(output.public, child.public);
    assert!(verify_signature(curve, &child.public, b"mixin", &output.extra).is_ok());
    assert!(verify_signature(curve, &public, b"mixin", &output.extra).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_ed25519_child_signature() {
    let curve = Curve::Edwards25519Default;
    let mut group = Group::start(3, 2);
    let (public, chain_code) = group.keygen(curve).await;

    let path = DerivationPath::new(vec![7, 1]).unwrap();
    let child = derive_public(curve.scheme(), &public, &chain_code, &path).unwrap();
    let output = group.sign(curve, &public, &path, b"mixin").await;
    assert!(verify_signature(curve, &child.public, b"mixin", &output.extra).is_ok());
    assert!(verify_signature(curve, &public, b"mixin", &output.extra).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_ecdsa_keygen_and_sign() {
    let curve = Curve::Secp256k1EcdsaBitcoin;
    let mut group = Group::start(3, 2);
    let (public, chain_code) = group.keygen(curve).await;
    assert_eq!(public.len(), 33);

    let digest = Sha256::digest(b"mixin");
    let path = DerivationPath::new(vec![3, 9, 12]).unwrap();
    let child = derive_public(curve.scheme(), &public, &chain_code, &path).unwrap();
    let output = group.sign(curve, &public, &path, &digest).await;
    assert_eq!(output.public, child.public);
    assert!(verify_signature(curve, &child.public, &digest, &output.extra).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_redelivered_keygen_returns_same_key() {
    let curve = Curve::Edwards25519Default;
    let mut group = Group::start(3, 2);
    let op = Operation::keygen_input(Uuid::new_v4(), curve);

    let first = group.request(&op).await;
    let again = group.request(&op).await;
    assert_eq!(first, again);
}
