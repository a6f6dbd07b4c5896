//! Distributed Key Generation (DKG) sessions
//!
//! Implements FROST DKG over the group bus without a trusted dealer. Every
//! member takes part: round one packages are broadcast together with a
//! chain code contribution, round two packages are sealed to the member
//! they are meant for.

use crate::keystore::{KeyShare, StoredKey};
use crate::session::{Round, Session, SessionError};
use frost_core::keys::dkg;
use frost_core::{Ciphersuite, Identifier};
use rand::rngs::OsRng;
use rand::RngCore;
use safe_common::{Curve, Scheme};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A FROST ciphersuite usable for group keys
pub trait FrostCurve: Ciphersuite {
    const SCHEME: Scheme;

    /// Group key in the form carried by keygen outputs
    fn publish(verifying_key: &[u8]) -> Vec<u8>;
}

impl FrostCurve for frost_secp256k1_tr::Secp256K1Sha256TR {
    const SCHEME: Scheme = Scheme::FrostSecp256k1;

    /// x-only key: the compressed point without its parity byte
    fn publish(verifying_key: &[u8]) -> Vec<u8> {
        verifying_key.get(1..).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

impl FrostCurve for frost_ed25519::Ed25519Sha512 {
    const SCHEME: Scheme = Scheme::FrostEd25519;

    fn publish(verifying_key: &[u8]) -> Vec<u8> {
        verifying_key.to_vec()
    }
}

pub(crate) fn frost_error<C: Ciphersuite>(e: frost_core::Error<C>) -> SessionError {
    SessionError::Protocol(format!("FROST error: {}", e))
}

/// FROST identifier of the member at protocol index `index`
pub(crate) fn identifier<C: Ciphersuite>(index: u16) -> Result<Identifier<C>, SessionError> {
    Identifier::try_from(index).map_err(frost_error)
}

pub(crate) fn member_identifier<C: Ciphersuite>(session: &Session, member: &str) -> Result<Identifier<C>, SessionError> {
    let index = session
        .ctx()
        .index_of(member)
        .ok_or_else(|| SessionError::UnknownMember(member.to_string()))?;
    identifier(index)
}

/// Chain code agreed from every member's random contribution
pub(crate) fn combine_chain_code(contributions: &BTreeMap<String, Vec<u8>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"safe-chain-code");
    for contribution in contributions.values() {
        hasher.update(contribution);
    }
    hasher.finalize().into()
}

pub(crate) fn chain_code_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Runs FROST DKG with every group member and returns this node's share
pub async fn run_keygen<C: FrostCurve>(session: &mut Session, curve: Curve) -> Result<StoredKey, SessionError> {
    let members = session.ctx().members.clone();
    let me = session.ctx().node_id.clone();
    let threshold = session.ctx().threshold;
    let max_signers = members.len() as u16;
    let my_identifier = identifier::<C>(session.ctx().my_index()?)?;

    let (round1_secret, round1_package) =
        dkg::part1(my_identifier, max_signers, threshold, &mut OsRng).map_err(frost_error)?;
    let mut payload = chain_code_seed().to_vec();
    payload.extend_from_slice(&round1_package.serialize().map_err(frost_error)?);
    session.broadcast(Round::DkgCommit, payload).await?;

    tracing::debug!(session_id = %session.id, curve = %curve, "DKG round 1 sent");

    let commits = session.collect(Round::DkgCommit, &members).await?;
    let mut seeds = BTreeMap::new();
    let mut round1_packages = BTreeMap::new();
    let mut owners: BTreeMap<Identifier<C>, String> = BTreeMap::new();
    for (member, payload) in commits {
        if payload.len() <= 32 {
            return Err(SessionError::Protocol(format!("short DKG commitment from {}", member)));
        }
        let (seed, package) = payload.split_at(32);
        seeds.insert(member.clone(), seed.to_vec());
        if member == me {
            continue;
        }
        let id = member_identifier::<C>(session, &member)?;
        let package = dkg::round1::Package::<C>::deserialize(package).map_err(frost_error)?;
        round1_packages.insert(id, package);
        owners.insert(id, member);
    }

    let (round2_secret, round2_outgoing) = dkg::part2(round1_secret, &round1_packages).map_err(frost_error)?;
    for (id, package) in &round2_outgoing {
        let to = owners
            .get(id)
            .ok_or_else(|| SessionError::Protocol("round 2 package for unknown participant".to_string()))?;
        let bytes = package.serialize().map_err(frost_error)?;
        session.send_private(Round::DkgShare, to, &bytes).await?;
    }

    tracing::debug!(session_id = %session.id, "DKG round 2 sent");

    let others: Vec<String> = members.iter().filter(|m| **m != me).cloned().collect();
    let shares = session.collect(Round::DkgShare, &others).await?;
    let mut round2_packages = BTreeMap::new();
    for (member, payload) in shares {
        let id = member_identifier::<C>(session, &member)?;
        let package = dkg::round2::Package::<C>::deserialize(&payload).map_err(frost_error)?;
        round2_packages.insert(id, package);
    }

    let (key_package, public_key_package) =
        dkg::part3(&round2_secret, &round1_packages, &round2_packages).map_err(frost_error)?;

    let group_key = public_key_package.verifying_key().serialize().map_err(frost_error)?;
    let public = C::publish(&group_key);
    if public.len() != curve.public_key_len() {
        return Err(SessionError::Protocol(format!(
            "group key of {} bytes for {}",
            public.len(),
            curve
        )));
    }

    tracing::info!(
        session_id = %session.id,
        curve = %curve,
        public_key = %hex::encode(&public),
        "DKG completed"
    );

    Ok(StoredKey {
        session_id: session.id,
        curve,
        public,
        chain_code: combine_chain_code(&seeds),
        share: KeyShare::Frost {
            key_package: key_package.serialize().map_err(frost_error)?,
            public_key_package: public_key_package.serialize().map_err(frost_error)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::sessions;

    #[test]
    fn test_chain_code_depends_on_every_contribution() {
        let mut contributions = BTreeMap::new();
        contributions.insert("a".to_string(), vec![1u8; 32]);
        contributions.insert("b".to_string(), vec![2u8; 32]);
        let base = combine_chain_code(&contributions);
        assert_eq!(base, combine_chain_code(&contributions.clone()));

        contributions.insert("b".to_string(), vec![3u8; 32]);
        assert_ne!(base, combine_chain_code(&contributions));
    }

    #[test]
    fn test_published_key_widths() {
        let compressed = [2u8; 33];
        assert_eq!(frost_secp256k1_tr::Secp256K1Sha256TR::publish(&compressed).len(), 32);
        assert_eq!(frost_ed25519::Ed25519Sha512::publish(&[9u8; 32]).len(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ed25519_keygen_converges() {
        let mut handles = Vec::new();
        for mut session in sessions(&["a", "b", "c"], 2) {
            handles.push(tokio::spawn(async move {
                run_keygen::<frost_ed25519::Ed25519Sha512>(&mut session, Curve::Edwards25519Default).await
            }));
        }
        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap());
        }

        assert!(keys.iter().all(|k| k.public == keys[0].public));
        assert!(keys.iter().all(|k| k.chain_code == keys[0].chain_code));
        assert_eq!(keys[0].output().validate(), Ok(()));
        assert_ne!(keys[0].share, keys[1].share);
    }
}
