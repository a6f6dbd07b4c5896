//! Curve and chain identifiers
//!
//! Every curve id that appears on the wire resolves to exactly one [`Curve`]
//! variant, and each variant carries the field widths the codec checks
//! against. Downstream code matches on [`Scheme`] or [`Chain`] instead of
//! raw bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of an x-only Schnorr or Ed25519 public key
pub const POINT_X_ONLY_LEN: usize = 32;
/// Length of a SEC1 compressed secp256k1 public key
pub const POINT_COMPRESSED_LEN: usize = 33;
/// Length of a chain code
pub const CHAIN_CODE_LEN: usize = 32;
/// Length of every signature carried in a sign-output
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CurveError {
    #[error("unknown curve id: {0}")]
    UnknownCurve(u8),
    #[error("unknown chain id: {0}")]
    UnknownChain(u8),
    #[error("unknown curve name: {0}")]
    UnknownName(String),
}

/// Threshold protocol family behind a curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// FROST over secp256k1 with BIP340 signatures
    FrostSecp256k1,
    /// FROST over Ed25519
    FrostEd25519,
    /// CMP-style threshold ECDSA over secp256k1
    Ecdsa,
}

/// Signing curve as carried in the operation header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Curve {
    Secp256k1EcdsaBitcoin,
    Secp256k1EcdsaEthereum,
    Secp256k1SchnorrBitcoin,
    Edwards25519Default,
    Secp256k1EcdsaLitecoin,
    Secp256k1EcdsaPolygon,
}

impl Curve {
    pub const ALL: [Curve; 6] = [
        Curve::Secp256k1EcdsaBitcoin,
        Curve::Secp256k1EcdsaEthereum,
        Curve::Secp256k1SchnorrBitcoin,
        Curve::Edwards25519Default,
        Curve::Secp256k1EcdsaLitecoin,
        Curve::Secp256k1EcdsaPolygon,
    ];

    pub fn id(self) -> u8 {
        match self {
            Curve::Secp256k1EcdsaBitcoin => 1,
            Curve::Secp256k1EcdsaEthereum => 2,
            Curve::Secp256k1SchnorrBitcoin => 3,
            Curve::Edwards25519Default => 4,
            Curve::Secp256k1EcdsaLitecoin => 5,
            Curve::Secp256k1EcdsaPolygon => 6,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, CurveError> {
        Curve::ALL
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or(CurveError::UnknownCurve(id))
    }

    pub fn scheme(self) -> Scheme {
        match self {
            Curve::Secp256k1SchnorrBitcoin => Scheme::FrostSecp256k1,
            Curve::Edwards25519Default => Scheme::FrostEd25519,
            _ => Scheme::Ecdsa,
        }
    }

    /// Raw length of the group public key for this curve
    pub fn public_key_len(self) -> usize {
        match self.scheme() {
            Scheme::FrostSecp256k1 | Scheme::FrostEd25519 => POINT_X_ONLY_LEN,
            Scheme::Ecdsa => POINT_COMPRESSED_LEN,
        }
    }

    /// Length of the keygen-output extra: role byte, chain code and, for
    /// FROST curves, a trailing flag byte
    pub fn keygen_extra_len(self) -> usize {
        match self.scheme() {
            Scheme::FrostSecp256k1 | Scheme::FrostEd25519 => 1 + CHAIN_CODE_LEN + 1,
            Scheme::Ecdsa => 1 + CHAIN_CODE_LEN,
        }
    }

    /// Chain whose safes are secured by this curve, if any
    pub fn chain(self) -> Option<Chain> {
        match self {
            Curve::Secp256k1EcdsaBitcoin => Some(Chain::Bitcoin),
            Curve::Secp256k1EcdsaLitecoin => Some(Chain::Litecoin),
            Curve::Secp256k1EcdsaEthereum => Some(Chain::Ethereum),
            Curve::Secp256k1EcdsaPolygon => Some(Chain::Polygon),
            Curve::Secp256k1SchnorrBitcoin | Curve::Edwards25519Default => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Curve::Secp256k1EcdsaBitcoin => "secp256k1-ecdsa-bitcoin",
            Curve::Secp256k1EcdsaEthereum => "secp256k1-ecdsa-ethereum",
            Curve::Secp256k1SchnorrBitcoin => "secp256k1-schnorr-bitcoin",
            Curve::Edwards25519Default => "edwards25519-default",
            Curve::Secp256k1EcdsaLitecoin => "secp256k1-ecdsa-litecoin",
            Curve::Secp256k1EcdsaPolygon => "secp256k1-ecdsa-polygon",
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Curve {
    type Err = CurveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Curve::ALL
            .into_iter()
            .find(|c| c.name() == lower)
            .ok_or_else(|| CurveError::UnknownName(s.to_string()))
    }
}

/// External chain a safe lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Bitcoin,
    Ethereum,
    Litecoin,
    Polygon,
}

impl Chain {
    pub const ALL: [Chain; 4] = [Chain::Bitcoin, Chain::Ethereum, Chain::Litecoin, Chain::Polygon];

    pub fn id(self) -> u8 {
        match self {
            Chain::Bitcoin => 1,
            Chain::Ethereum => 2,
            Chain::Litecoin => 5,
            Chain::Polygon => 6,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, CurveError> {
        Chain::ALL
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or(CurveError::UnknownChain(id))
    }

    /// UTXO chains carry no token address in deposit payloads
    pub fn is_utxo(self) -> bool {
        matches!(self, Chain::Bitcoin | Chain::Litecoin)
    }

    /// ECDSA curve used for safes on this chain
    pub fn curve(self) -> Curve {
        match self {
            Chain::Bitcoin => Curve::Secp256k1EcdsaBitcoin,
            Chain::Ethereum => Curve::Secp256k1EcdsaEthereum,
            Chain::Litecoin => Curve::Secp256k1EcdsaLitecoin,
            Chain::Polygon => Curve::Secp256k1EcdsaPolygon,
        }
    }

    /// Confirmations required before a deposit is final
    pub fn finality_threshold(self) -> u64 {
        match self {
            Chain::Bitcoin => 3,
            Chain::Litecoin => 6,
            Chain::Ethereum => 32,
            Chain::Polygon => 256,
        }
    }

    /// Confirmations required for coinbase outputs on UTXO chains
    pub fn coinbase_maturity(self) -> u64 {
        100
    }

    pub fn decimals(self) -> u32 {
        match self {
            Chain::Bitcoin | Chain::Litecoin => 8,
            Chain::Ethereum | Chain::Polygon => 18,
        }
    }

    /// Asset id of the chain's native coin on the group ledger
    pub fn native_asset_id(self) -> uuid::Uuid {
        match self {
            Chain::Bitcoin => uuid::uuid!("c6d0c728-2624-429b-8e0d-d9d19b6592fa"),
            Chain::Ethereum => uuid::uuid!("43d61dcd-e413-450d-80b8-101d5e903357"),
            Chain::Litecoin => uuid::uuid!("76c802a2-7c88-447f-a93e-c29c9e5dd9c8"),
            Chain::Polygon => uuid::uuid!("b7938396-3f94-4e0a-9179-d3440718156f"),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Bitcoin => write!(f, "bitcoin"),
            Chain::Ethereum => write!(f, "ethereum"),
            Chain::Litecoin => write!(f, "litecoin"),
            Chain::Polygon => write!(f, "polygon"),
        }
    }
}

impl FromStr for Chain {
    type Err = CurveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(Chain::Bitcoin),
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            "litecoin" | "ltc" => Ok(Chain::Litecoin),
            "polygon" | "matic" => Ok(Chain::Polygon),
            _ => Err(CurveError::UnknownName(s.to_string())),
        }
    }
}
