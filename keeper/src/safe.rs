//! Safe keys, digests and addresses
//!
//! A safe is controlled by three keys: the holder's, a child of the signer
//! group key and the observer's. Any two of them can spend; after the
//! timelock the holder and observer can recover without the signers.

use bitcoin::bech32::{segwit, Hrp};
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF};
use bitcoin::script::{Builder, ScriptBuf};
use safe_common::{Chain, DerivationPath};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use uuid::Uuid;

use crate::error::{KeeperError, Result};

/// Parses a compressed secp256k1 key
pub fn parse_key(bytes: &[u8]) -> Result<bitcoin::PublicKey> {
    let key = bitcoin::PublicKey::from_slice(bytes).map_err(|e| KeeperError::malformed(e.to_string()))?;
    if !key.compressed {
        return Err(KeeperError::malformed("uncompressed key"));
    }
    Ok(key)
}

/// Path of the signer child key of the safe held by `holder`
pub fn safe_path(holder: &[u8]) -> Result<DerivationPath> {
    let digest = Sha256::digest(holder);
    DerivationPath::new(digest[..3].iter().map(|&b| b as u32).collect())
        .map_err(|e| KeeperError::invariant(e.to_string()))
}

/// Message the signer group signs to prove it controls the safe's child key
pub fn ownership_digest(holder: &[u8], signer_child: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"safe-ownership");
    hasher.update(holder);
    hasher.update(signer_child);
    hasher.finalize().into()
}

pub fn proposal_digest(id: Uuid, address: &str, receiver: &str, amount: u128) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(address.as_bytes());
    hasher.update(receiver.as_bytes());
    hasher.update(amount.to_be_bytes());
    hasher.finalize().into()
}

/// 2-of-3 now, holder and observer 2-of-2 after `timelock` blocks
pub fn witness_script(holder: &[u8], signer: &[u8], observer: &[u8], timelock: u16) -> Result<ScriptBuf> {
    let holder = parse_key(holder)?;
    let signer = parse_key(signer)?;
    let observer = parse_key(observer)?;
    Ok(Builder::new()
        .push_opcode(OP_IF)
        .push_int(2)
        .push_key(&holder)
        .push_key(&signer)
        .push_key(&observer)
        .push_int(3)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_int(timelock as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_int(2)
        .push_key(&holder)
        .push_key(&observer)
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ENDIF)
        .into_script())
}

/// Address of a safe on `chain`
pub fn safe_address(chain: Chain, holder: &[u8], signer: &[u8], observer: &[u8], timelock: u16) -> Result<String> {
    match chain {
        Chain::Bitcoin | Chain::Litecoin => {
            let script = witness_script(holder, signer, observer, timelock)?;
            let program = Sha256::digest(script.as_bytes());
            let hrp = Hrp::parse(if chain == Chain::Bitcoin { "bc" } else { "ltc" })
                .map_err(|e| KeeperError::invariant(e.to_string()))?;
            segwit::encode(hrp, segwit::VERSION_0, &program).map_err(|e| KeeperError::invariant(e.to_string()))
        }
        Chain::Ethereum | Chain::Polygon => {
            for key in [holder, signer, observer] {
                parse_key(key)?;
            }
            let mut hasher = Keccak256::new();
            hasher.update(holder);
            hasher.update(signer);
            hasher.update(observer);
            hasher.update(timelock.to_be_bytes());
            let digest = hasher.finalize();
            Ok(format!("0x{}", hex::encode(&digest[12..])))
        }
    }
}
