//! Encrypted key share storage
//!
//! Every group key this node holds a share of lives in its own file,
//! `{fingerprint}.key.enc`, encrypted at rest using AES-256-GCM with a
//! password-derived key. Public metadata stays in the clear so keys can be
//! listed without the password.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use safe_common::{fingerprint, Curve, Operation};
use safe_common::derivation::FINGERPRINT_LEN;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("invalid password")]
    InvalidPassword,
}

/// Encrypted key file format
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    /// Version for future format changes
    version: u8,
    /// Node that owns the share
    node_id: String,
    /// Keygen session that produced the key
    session_id: Uuid,
    curve: Curve,
    /// Published group public key (hex-encoded)
    public_key: String,
    /// Salt for key derivation (hex-encoded)
    salt: String,
    /// Nonce for AES-GCM (hex-encoded)
    nonce: String,
    /// Encrypted [`StoredKey`] (hex-encoded)
    ciphertext: String,
}

/// Secret half of a stored key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum KeyShare {
    /// Serialized FROST key package and public key package
    Frost {
        key_package: Vec<u8>,
        public_key_package: Vec<u8>,
    },
    /// Shamir share of the ECDSA key and the compressed group key
    Ecdsa {
        private_share: Vec<u8>,
        public_key: Vec<u8>,
    },
}

/// A threshold key share with everything needed to sign under it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub session_id: Uuid,
    pub curve: Curve,
    /// Group public key in the curve's published format
    pub public: Vec<u8>,
    pub chain_code: [u8; 32],
    pub share: KeyShare,
}

impl StoredKey {
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        fingerprint(&self.public)
    }

    /// The keygen output announcing this key
    pub fn output(&self) -> Operation {
        Operation::keygen_output(self.session_id, self.curve, self.public.clone(), self.chain_code)
    }
}

/// Directory of encrypted key files
pub struct Keystore {
    dir: PathBuf,
    node_id: String,
    password: String,
}

impl Keystore {
    pub fn new(dir: impl AsRef<Path>, node_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            node_id: node_id.into(),
            password: password.into(),
        }
    }

    /// Derive encryption key from password using SHA-256
    fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt);
        hasher.update(b"safe-keystore-v1");
        hasher.finalize().into()
    }

    fn key_path(&self, fingerprint: &[u8]) -> PathBuf {
        self.dir.join(format!("{}.key.enc", hex::encode(fingerprint)))
    }

    /// Save a key share encrypted with the keystore password
    pub fn save(&self, key: &StoredKey) -> Result<(), KeystoreError> {
        let plaintext = serde_json::to_vec(key)?;

        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher_key = Self::derive_key(&self.password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&cipher_key)
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;

        let encrypted = EncryptedKeyFile {
            version: 1,
            node_id: self.node_id.clone(),
            session_id: key.session_id,
            curve: key.curve,
            public_key: hex::encode(&key.public),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        };

        std::fs::create_dir_all(&self.dir)?;
        let path = self.key_path(&key.fingerprint());
        // write then rename so a crash never leaves a truncated key file
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&encrypted)?)?;
        std::fs::rename(&tmp, &path)?;

        tracing::info!(
            node_id = %self.node_id,
            session_id = %key.session_id,
            curve = %key.curve,
            path = %path.display(),
            "Saved encrypted key share"
        );
        Ok(())
    }

    fn load_file(&self, path: &Path) -> Result<StoredKey, KeystoreError> {
        let json = std::fs::read_to_string(path)?;
        let encrypted: EncryptedKeyFile = serde_json::from_str(&json)?;

        if encrypted.node_id != self.node_id {
            return Err(KeystoreError::Decryption(format!(
                "node id mismatch: expected {}, got {}",
                self.node_id, encrypted.node_id
            )));
        }

        let salt = hex::decode(&encrypted.salt).map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce_bytes =
            hex::decode(&encrypted.nonce).map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let ciphertext =
            hex::decode(&encrypted.ciphertext).map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(KeystoreError::Decryption("invalid nonce length".to_string()));
        }

        let cipher_key = Self::derive_key(&self.password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&cipher_key)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| KeystoreError::InvalidPassword)?;

        let key: StoredKey = serde_json::from_slice(&plaintext)?;
        if hex::encode(&key.public) != encrypted.public_key || key.session_id != encrypted.session_id {
            return Err(KeystoreError::Decryption(format!(
                "metadata does not match contents of {}",
                path.display()
            )));
        }
        Ok(key)
    }

    /// Loads one key by fingerprint
    pub fn load(&self, fingerprint: &[u8]) -> Result<StoredKey, KeystoreError> {
        let path = self.key_path(fingerprint);
        if !path.exists() {
            return Err(KeystoreError::KeyNotFound(hex::encode(fingerprint)));
        }
        self.load_file(&path)
    }

    /// Loads every key in the directory
    pub fn load_all(&self) -> Result<Vec<StoredKey>, KeystoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_key = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".key.enc"));
            if is_key {
                keys.push(self.load_file(&path)?);
            }
        }
        keys.sort_by_key(|k| k.session_id);
        tracing::info!(node_id = %self.node_id, count = keys.len(), "Loaded key shares");
        Ok(keys)
    }
}

/// In-memory index of loaded keys
#[derive(Debug, Default)]
pub struct KeyRing {
    by_fingerprint: BTreeMap<[u8; FINGERPRINT_LEN], StoredKey>,
    by_session: BTreeMap<Uuid, [u8; FINGERPRINT_LEN]>,
}

impl KeyRing {
    pub fn new(keys: Vec<StoredKey>) -> Self {
        let mut ring = Self::default();
        for key in keys {
            ring.insert(key);
        }
        ring
    }

    pub fn insert(&mut self, key: StoredKey) {
        let fp = key.fingerprint();
        self.by_session.insert(key.session_id, fp);
        self.by_fingerprint.insert(fp, key);
    }

    pub fn get(&self, fingerprint: &[u8; FINGERPRINT_LEN]) -> Option<&StoredKey> {
        self.by_fingerprint.get(fingerprint)
    }

    pub fn by_session(&self, session_id: &Uuid) -> Option<&StoredKey> {
        self.by_session.get(session_id).and_then(|fp| self.by_fingerprint.get(fp))
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredKey> {
        self.by_fingerprint.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_key() -> StoredKey {
        StoredKey {
            session_id: Uuid::new_v4(),
            curve: Curve::Secp256k1EcdsaBitcoin,
            public: vec![2u8; 33],
            chain_code: [7u8; 32],
            share: KeyShare::Ecdsa {
                private_share: vec![1u8; 32],
                public_key: vec![2u8; 33],
            },
        }
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let key1 = Keystore::derive_key("password123", b"salt");
        let key2 = Keystore::derive_key("password123", b"salt");
        assert_eq!(key1, key2);

        let key3 = Keystore::derive_key("password123", b"different_salt");
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_keystore_round_trip() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(dir.path(), "signer-1", "test_password");
        let key = sample_key();

        keystore.save(&key).unwrap();
        assert_eq!(keystore.load(&key.fingerprint()).unwrap(), key);

        let other = StoredKey {
            session_id: Uuid::new_v4(),
            public: vec![3u8; 33],
            ..sample_key()
        };
        keystore.save(&other).unwrap();
        assert_eq!(keystore.load_all().unwrap().len(), 2);
    }

    #[test]
    fn test_keystore_wrong_password() {
        let dir = tempdir().unwrap();
        let key = sample_key();
        Keystore::new(dir.path(), "signer-1", "correct").save(&key).unwrap();

        let result = Keystore::new(dir.path(), "signer-1", "wrong").load(&key.fingerprint());
        assert!(matches!(result, Err(KeystoreError::InvalidPassword)));
    }

    #[test]
    fn test_keystore_rejects_foreign_node() {
        let dir = tempdir().unwrap();
        let key = sample_key();
        Keystore::new(dir.path(), "signer-1", "pw").save(&key).unwrap();

        let result = Keystore::new(dir.path(), "signer-2", "pw").load(&key.fingerprint());
        assert!(matches!(result, Err(KeystoreError::Decryption(_))));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(dir.path().join("absent"), "signer-1", "pw");
        assert!(keystore.load_all().unwrap().is_empty());
        assert!(matches!(keystore.load(&[0u8; 8]), Err(KeystoreError::KeyNotFound(_))));
    }

    #[test]
    fn test_key_ring_lookups() {
        let key = sample_key();
        let ring = KeyRing::new(vec![key.clone()]);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.get(&key.fingerprint()), Some(&key));
        assert_eq!(ring.by_session(&key.session_id), Some(&key));
        assert_eq!(key.output().chain_code(), Some([7u8; 32]));
    }
}
