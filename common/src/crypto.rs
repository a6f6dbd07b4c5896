//! Transport encryption for operations and private round messages
//!
//! Operations travel in transfer memos encrypted under a key shared by the
//! keeper and the signer group. Round messages addressed to a single signer
//! are sealed to that signer's x25519 key with an ephemeral sender key.

use crate::operation::{CodecError, Operation};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption failed")]
    Decryption,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid memo encoding: {0}")]
    Memo(#[from] base64::DecodeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

fn derive_key(secret: &[u8], domain: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(domain);
    hasher.finalize().into()
}

fn encrypt_with(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_with(cipher: &Aes256Gcm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Symmetric cipher shared by the keeper and the signer group
#[derive(Clone)]
pub struct OperationCipher {
    cipher: Aes256Gcm,
}

impl OperationCipher {
    pub fn new(secret: &[u8]) -> Self {
        let key = derive_key(secret, b"safe-operation-v1");
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    pub fn from_hex(secret: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if bytes.len() < 32 {
            return Err(CryptoError::InvalidKey("operation key must be at least 32 bytes".to_string()));
        }
        Ok(Self::new(&bytes))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt_with(&self.cipher, plaintext)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt_with(&self.cipher, data)
    }

    /// Encodes, encrypts and base64-wraps an operation for a transfer memo
    pub fn seal_operation(&self, op: &Operation) -> Result<String, CryptoError> {
        let encoded = op.encode()?;
        Ok(STANDARD.encode(self.encrypt(&encoded)?))
    }

    /// Reverses [`seal_operation`](Self::seal_operation)
    pub fn open_operation(&self, memo: &str) -> Result<Operation, CryptoError> {
        let sealed = STANDARD.decode(memo.trim())?;
        let plain = self.decrypt(&sealed)?;
        Ok(Operation::decode(&plain)?)
    }
}

impl std::fmt::Debug for OperationCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OperationCipher(..)")
    }
}

/// A node's long-lived x25519 transport key
#[derive(Clone)]
pub struct TransportKey {
    secret: StaticSecret,
}

impl TransportKey {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_hex(secret: &str) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = hex::decode(secret)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("transport key must be 32 bytes".to_string()))?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public().as_bytes())
    }

    /// Opens a payload produced by [`seal_to`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < 32 {
            return Err(CryptoError::Decryption);
        }
        let (ephemeral, rest) = sealed.split_at(32);
        let ephemeral: [u8; 32] = ephemeral.try_into().map_err(|_| CryptoError::Decryption)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(ephemeral));
        let key = derive_key(shared.as_bytes(), b"safe-envelope-v1");
        decrypt_with(&Aes256Gcm::new(&key.into()), rest)
    }
}

pub fn parse_transport_public(hex_key: &str) -> Result<PublicKey, CryptoError> {
    let bytes: [u8; 32] = hex::decode(hex_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("transport public key must be 32 bytes".to_string()))?;
    Ok(PublicKey::from(bytes))
}

/// Seals `plaintext` so only the holder of `recipient` can read it
pub fn seal_to(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_key(shared.as_bytes(), b"safe-envelope-v1");
    let mut out = ephemeral_public.as_bytes().to_vec();
    out.extend_from_slice(&encrypt_with(&Aes256Gcm::new(&key.into()), plaintext)?);
    Ok(out)
}
