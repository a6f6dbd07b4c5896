//! Native signature verification per curve
//!
//! Schnorr signatures follow BIP340 against an x-only key, Ed25519 follows
//! RFC 8032 and ECDSA expects a 32-byte prehashed digest with a low-S
//! signature in either compact or DER form.

use crate::curve::{Curve, Scheme};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),
    #[error("signature does not verify")]
    Mismatch,
}

pub fn verify_signature(
    curve: Curve,
    public: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    match curve.scheme() {
        Scheme::FrostSecp256k1 => verify_schnorr(public, message, signature),
        Scheme::FrostEd25519 => verify_ed25519(public, message, signature),
        Scheme::Ecdsa => verify_ecdsa(public, message, signature),
    }
}

fn verify_schnorr(public: &[u8], message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    use frost_secp256k1_tr as frost;

    if public.len() != 32 {
        return Err(SignatureError::InvalidPublicKey(format!("{} bytes", public.len())));
    }
    let mut lifted = vec![0x02u8];
    lifted.extend_from_slice(public);
    let key = frost::VerifyingKey::deserialize(&lifted)
        .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
    let sig = frost::Signature::deserialize(signature)
        .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
    key.verify(message, &sig).map_err(|_| SignatureError::Mismatch)
}

fn verify_ed25519(public: &[u8], message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    use frost_ed25519 as frost;

    let key = frost::VerifyingKey::deserialize(public)
        .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
    let sig = frost::Signature::deserialize(signature)
        .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
    key.verify(message, &sig).map_err(|_| SignatureError::Mismatch)
}

fn verify_ecdsa(public: &[u8], digest: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    use k256::ecdsa::{Signature, VerifyingKey};

    let key = VerifyingKey::from_sec1_bytes(public)
        .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
    let sig = if signature.len() == 64 {
        Signature::from_slice(signature)
    } else {
        Signature::from_der(signature)
    }
    .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
    if digest.len() != 32 {
        return Err(SignatureError::InvalidEncoding(format!("digest of {} bytes", digest.len())));
    }
    key.verify_prehash(digest, &sig).map_err(|_| SignatureError::Mismatch)
}

/// DER form of a 64-byte compact ECDSA signature
pub fn ecdsa_der(signature: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let sig = k256::ecdsa::Signature::from_slice(signature)
        .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
    Ok(sig.to_der().as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey};
    use rand::rngs::OsRng;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_ecdsa_compact_and_der() {
        let signing = SigningKey::random(&mut OsRng);
        let public = signing.verifying_key().to_encoded_point(true);
        let digest = Sha256::digest(b"mixin");
        let sig: Signature = signing.sign_prehash(&digest).unwrap();
        let compact = sig.to_bytes().to_vec();

        let curve = Curve::Secp256k1EcdsaBitcoin;
        assert!(verify_signature(curve, public.as_bytes(), &digest, &compact).is_ok());
        let der = ecdsa_der(&compact).unwrap();
        assert!(verify_signature(curve, public.as_bytes(), &digest, &der).is_ok());

        let other = Sha256::digest(b"other");
        assert_eq!(
            verify_signature(curve, public.as_bytes(), &other, &compact),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_schnorr_rejects_short_key() {
        let result = verify_signature(Curve::Secp256k1SchnorrBitcoin, &[2u8; 33], b"mixin", &[0u8; 64]);
        assert!(matches!(result, Err(SignatureError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_frost_signatures_verify() {
        use frost_secp256k1_tr as frost;

        let (shares, pubkeys) =
            frost::keys::generate_with_dealer(3, 2, frost::keys::IdentifierList::Default, &mut OsRng).unwrap();
        let mut key_packages = std::collections::BTreeMap::new();
        for (id, share) in shares {
            key_packages.insert(id, frost::keys::KeyPackage::try_from(share).unwrap());
        }

        let mut nonces = std::collections::BTreeMap::new();
        let mut commitments = std::collections::BTreeMap::new();
        for (id, kp) in key_packages.iter().take(2) {
            let (n, c) = frost::round1::commit(kp.signing_share(), &mut OsRng);
            nonces.insert(*id, n);
            commitments.insert(*id, c);
        }
        let package = frost::SigningPackage::new(commitments, b"mixin");
        let mut shares = std::collections::BTreeMap::new();
        for (id, n) in &nonces {
            let share = frost::round2::sign(&package, n, &key_packages[id]).unwrap();
            shares.insert(*id, share);
        }
        let signature = frost::aggregate(&package, &shares, &pubkeys).unwrap();

        let full = pubkeys.verifying_key().serialize().unwrap();
        let sig = signature.serialize().unwrap();
        assert!(verify_signature(Curve::Secp256k1SchnorrBitcoin, &full[1..], b"mixin", &sig).is_ok());
        assert!(verify_signature(Curve::Secp256k1SchnorrBitcoin, &full[1..], b"other", &sig).is_err());
    }
}
