//! Hierarchical key derivation for threshold keys
//!
//! Only non-hardened steps exist: each child is the parent point plus a
//! public tweak, so every signer can apply the same tweak to its own share
//! and the keeper can re-derive the child public key without any secret.
//!
//! ```text
//! I          = HMAC-SHA512(chain_code, ser(parent) || u32_be(index))
//! child      = parent + I[0..32]·G
//! chain_code = I[32..64]
//! ```
//!
//! Schnorr keys are published x-only, so their root point is lifted with an
//! even Y before the first step.

use crate::curve::{Scheme, CHAIN_CODE_LEN};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::ProjectivePoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

/// Bytes of a key fingerprint
pub const FINGERPRINT_LEN: usize = 8;

/// Indices at or above this value are hardened
pub const HARDENED_OFFSET: u32 = 1 << 31;

/// Deepest path accepted
pub const MAX_DEPTH: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerivationError {
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),
    #[error("hardened index {0} cannot be derived from shares")]
    HardenedIndex(u32),
    #[error("invalid public key")]
    InvalidPoint,
    #[error("invalid scalar")]
    InvalidScalar,
    #[error("derived tweak is out of range at index {0}")]
    InvalidChild(u32),
}

/// A sequence of non-hardened child indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn master() -> Self {
        Self(Vec::new())
    }

    pub fn new(indices: Vec<u32>) -> Result<Self, DerivationError> {
        if indices.len() > MAX_DEPTH {
            return Err(DerivationError::InvalidPath(format!("depth {}", indices.len())));
        }
        if let Some(&hardened) = indices.iter().find(|&&i| i >= HARDENED_OFFSET) {
            return Err(DerivationError::HardenedIndex(hardened));
        }
        Ok(Self(indices))
    }

    /// Parses either the compact `[depth, i1, i2, i3]` form or the extended
    /// `depth | depth × u32_be` form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DerivationError> {
        let depth = *bytes
            .first()
            .ok_or_else(|| DerivationError::InvalidPath("empty".to_string()))?
            as usize;

        // bytes past `depth` in the compact form carry no meaning
        if bytes.len() == 4 && depth <= 3 {
            return Self::new(bytes[1..1 + depth].iter().map(|&b| b as u32).collect());
        }

        if bytes.len() != 1 + 4 * depth {
            return Err(DerivationError::InvalidPath(format!(
                "{} bytes for depth {}",
                bytes.len(),
                depth
            )));
        }
        let indices = bytes[1..]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(indices)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let depth = self.0.len() as u8;
        if self.0.len() <= 3 && self.0.iter().all(|&i| i < 256) {
            let mut out = vec![depth, 0, 0, 0];
            for (slot, index) in out[1..].iter_mut().zip(&self.0) {
                *slot = *index as u8;
            }
            return out;
        }
        let mut out = Vec::with_capacity(1 + 4 * self.0.len());
        out.push(depth);
        for index in &self.0 {
            out.extend_from_slice(&index.to_be_bytes());
        }
        out
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_master(&self) -> bool {
        self.0.is_empty()
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }
}

/// First eight bytes of SHA-256 over the public key
pub fn fingerprint(public: &[u8]) -> [u8; FINGERPRINT_LEN] {
    let digest = Sha256::digest(public);
    let mut out = [0u8; FINGERPRINT_LEN];
    out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
    out
}

/// Result of walking a derivation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// Child public key in the curve's published format
    pub public: Vec<u8>,
    /// Child point in full encoding (33 bytes secp256k1, 32 bytes ed25519)
    pub point: Vec<u8>,
    pub chain_code: [u8; CHAIN_CODE_LEN],
    /// Sum of all step tweaks in the curve's scalar encoding
    pub tweak: [u8; 32],
}

/// Derives the child public key at `path` below `master_public`
pub fn derive_public(
    scheme: Scheme,
    master_public: &[u8],
    chain_code: &[u8; CHAIN_CODE_LEN],
    path: &DerivationPath,
) -> Result<DerivedKey, DerivationError> {
    match scheme {
        Scheme::FrostSecp256k1 | Scheme::Ecdsa => derive_secp256k1(scheme, master_public, chain_code, path),
        Scheme::FrostEd25519 => derive_ed25519(master_public, chain_code, path),
    }
}

fn ckd(chain_code: &[u8], parent: &[u8], index: u32) -> Result<([u8; 32], [u8; 32]), DerivationError> {
    let mut mac = HmacSha512::new_from_slice(chain_code).map_err(|_| DerivationError::InvalidScalar)?;
    mac.update(parent);
    mac.update(&index.to_be_bytes());
    let out = mac.finalize().into_bytes();
    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&out[..32]);
    ir.copy_from_slice(&out[32..]);
    Ok((il, ir))
}

fn derive_secp256k1(
    scheme: Scheme,
    master_public: &[u8],
    chain_code: &[u8; CHAIN_CODE_LEN],
    path: &DerivationPath,
) -> Result<DerivedKey, DerivationError> {
    let root = match (scheme, master_public.len()) {
        (Scheme::FrostSecp256k1, 32) => {
            let mut lifted = [0x02u8; 33];
            lifted[1..].copy_from_slice(master_public);
            secp256k1_point(&lifted)?
        }
        (_, 33) => secp256k1_point(master_public)?,
        _ => return Err(DerivationError::InvalidPoint),
    };

    let mut point = root;
    let mut code = *chain_code;
    let mut total = k256::Scalar::ZERO;
    for &index in path.indices() {
        let parent = encode_secp256k1(&point)?;
        let (il, ir) = ckd(&code, &parent, index)?;
        let tweak: k256::Scalar = Option::from(k256::Scalar::from_repr(il.into()))
            .ok_or(DerivationError::InvalidChild(index))?;
        point += ProjectivePoint::GENERATOR * tweak;
        if point == ProjectivePoint::IDENTITY {
            return Err(DerivationError::InvalidChild(index));
        }
        total += tweak;
        code = ir;
    }

    let encoded = encode_secp256k1(&point)?;
    let public = match scheme {
        Scheme::FrostSecp256k1 => encoded[1..].to_vec(),
        _ => encoded.clone(),
    };
    Ok(DerivedKey {
        public,
        point: encoded,
        chain_code: code,
        tweak: total.to_repr().into(),
    })
}

fn derive_ed25519(
    master_public: &[u8],
    chain_code: &[u8; CHAIN_CODE_LEN],
    path: &DerivationPath,
) -> Result<DerivedKey, DerivationError> {
    let mut point = ed25519_point(master_public)?;
    let mut code = *chain_code;
    let mut total = curve25519_dalek::Scalar::ZERO;
    for &index in path.indices() {
        let parent = point.compress().to_bytes();
        let (il, ir) = ckd(&code, &parent, index)?;
        let tweak = curve25519_dalek::Scalar::from_bytes_mod_order(il);
        point += EdwardsPoint::mul_base(&tweak);
        total += tweak;
        code = ir;
    }
    let encoded = point.compress().to_bytes().to_vec();
    Ok(DerivedKey {
        public: encoded.clone(),
        point: encoded,
        chain_code: code,
        tweak: total.to_bytes(),
    })
}

/// Applies `(negate ? -share : share) + tweak` to a serialized secret share
pub fn tweak_share(
    scheme: Scheme,
    share: &[u8],
    tweak: &[u8; 32],
    negate: bool,
) -> Result<Vec<u8>, DerivationError> {
    match scheme {
        Scheme::FrostSecp256k1 | Scheme::Ecdsa => {
            let mut s = secp256k1_scalar(share)?;
            if negate {
                s = -s;
            }
            let t = secp256k1_scalar(tweak)?;
            Ok((s + t).to_repr().to_vec())
        }
        Scheme::FrostEd25519 => {
            let mut s = ed25519_scalar(share)?;
            if negate {
                s = -s;
            }
            let t = ed25519_scalar(tweak)?;
            Ok((s + t).to_bytes().to_vec())
        }
    }
}

/// Applies `(negate ? -P : P) + tweak·G` to a serialized point
pub fn tweak_point(
    scheme: Scheme,
    point: &[u8],
    tweak: &[u8; 32],
    negate: bool,
) -> Result<Vec<u8>, DerivationError> {
    match scheme {
        Scheme::FrostSecp256k1 | Scheme::Ecdsa => {
            let mut p = secp256k1_point(point)?;
            if negate {
                p = -p;
            }
            let t = secp256k1_scalar(tweak)?;
            encode_secp256k1(&(p + ProjectivePoint::GENERATOR * t))
        }
        Scheme::FrostEd25519 => {
            let mut p = ed25519_point(point)?;
            if negate {
                p = -p;
            }
            let t = ed25519_scalar(tweak)?;
            Ok((p + EdwardsPoint::mul_base(&t)).compress().to_bytes().to_vec())
        }
    }
}

fn secp256k1_point(bytes: &[u8]) -> Result<ProjectivePoint, DerivationError> {
    k256::PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|_| DerivationError::InvalidPoint)
}

fn encode_secp256k1(point: &ProjectivePoint) -> Result<Vec<u8>, DerivationError> {
    if *point == ProjectivePoint::IDENTITY {
        return Err(DerivationError::InvalidPoint);
    }
    Ok(point.to_affine().to_encoded_point(true).as_bytes().to_vec())
}

fn secp256k1_scalar(bytes: &[u8]) -> Result<k256::Scalar, DerivationError> {
    let repr: [u8; 32] = bytes.try_into().map_err(|_| DerivationError::InvalidScalar)?;
    Option::from(k256::Scalar::from_repr(repr.into())).ok_or(DerivationError::InvalidScalar)
}

fn ed25519_point(bytes: &[u8]) -> Result<EdwardsPoint, DerivationError> {
    CompressedEdwardsY::from_slice(bytes)
        .map_err(|_| DerivationError::InvalidPoint)?
        .decompress()
        .ok_or(DerivationError::InvalidPoint)
}

fn ed25519_scalar(bytes: &[u8]) -> Result<curve25519_dalek::Scalar, DerivationError> {
    let repr: [u8; 32] = bytes.try_into().map_err(|_| DerivationError::InvalidScalar)?;
    Option::from(curve25519_dalek::Scalar::from_canonical_bytes(repr)).ok_or(DerivationError::InvalidScalar)
}
