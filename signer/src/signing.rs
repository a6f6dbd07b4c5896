//! FROST signing sessions
//!
//! Every member commits; the first `threshold` committers in bus order form
//! the signing set, so all members agree on it without a coordinator. Set
//! members publish signature shares and every member aggregates.
//!
//! Signing under a derived child key shifts every share by the path tweak:
//! `s_i' = ±s_i + t` and `Y_i' = ±Y_i + t·G`. For BIP340 keys the master
//! point is first normalized to even Y, which is the `±`.

use crate::dkg::{frost_error, member_identifier, FrostCurve};
use crate::keystore::{KeyShare, StoredKey};
use crate::session::{Round, Session, SessionError};
use frost_core::keys::{KeyPackage, PublicKeyPackage, SigningShare, VerifyingShare};
use frost_core::round1::SigningCommitments;
use frost_core::round2::SignatureShare;
use frost_core::{SigningPackage, VerifyingKey};
use rand::rngs::OsRng;
use safe_common::derivation::{tweak_point, tweak_share};
use safe_common::{DerivedKey, Scheme};
use std::collections::BTreeMap;

fn derivation_error(e: safe_common::DerivationError) -> SessionError {
    SessionError::Protocol(format!("derivation failed: {}", e))
}

/// Rebuilds the key packages for the child key at `tweak`
pub fn tweak_packages<C: FrostCurve>(
    key_package: &KeyPackage<C>,
    public_key_package: &PublicKeyPackage<C>,
    tweak: &[u8; 32],
) -> Result<(KeyPackage<C>, PublicKeyPackage<C>), SessionError> {
    let group_key = public_key_package.verifying_key().serialize().map_err(frost_error)?;
    let negate = C::SCHEME == Scheme::FrostSecp256k1 && group_key.first() == Some(&0x03);

    let shift_point = |bytes: &[u8]| tweak_point(C::SCHEME, bytes, tweak, negate).map_err(derivation_error);

    let share = tweak_share(C::SCHEME, &key_package.signing_share().serialize(), tweak, negate)
        .map_err(derivation_error)?;
    let signing_share = SigningShare::<C>::deserialize(&share).map_err(frost_error)?;
    let verifying_share = VerifyingShare::<C>::deserialize(&shift_point(
        &key_package.verifying_share().serialize().map_err(frost_error)?,
    )?)
    .map_err(frost_error)?;
    let verifying_key = VerifyingKey::<C>::deserialize(&shift_point(&group_key)?).map_err(frost_error)?;

    let mut verifying_shares = BTreeMap::new();
    for (id, share) in public_key_package.verifying_shares() {
        let shifted = shift_point(&share.serialize().map_err(frost_error)?)?;
        verifying_shares.insert(*id, VerifyingShare::<C>::deserialize(&shifted).map_err(frost_error)?);
    }

    Ok((
        KeyPackage::new(
            *key_package.identifier(),
            signing_share,
            verifying_share,
            verifying_key,
            *key_package.min_signers(),
        ),
        PublicKeyPackage::new(verifying_shares, verifying_key),
    ))
}

fn load_packages<C: FrostCurve>(key: &StoredKey) -> Result<(KeyPackage<C>, PublicKeyPackage<C>), SessionError> {
    match &key.share {
        KeyShare::Frost {
            key_package,
            public_key_package,
        } => Ok((
            KeyPackage::<C>::deserialize(key_package).map_err(frost_error)?,
            PublicKeyPackage::<C>::deserialize(public_key_package).map_err(frost_error)?,
        )),
        KeyShare::Ecdsa { .. } => Err(SessionError::Protocol(format!(
            "key {} is not a FROST key",
            hex::encode(&key.public)
        ))),
    }
}

/// Signs `message` under the child key `child` of `key`; returns the
/// serialized 64-byte signature
pub async fn run_sign<C: FrostCurve>(
    session: &mut Session,
    key: &StoredKey,
    child: &DerivedKey,
    message: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let (master_package, master_public) = load_packages::<C>(key)?;
    let (key_package, public_key_package) = tweak_packages(&master_package, &master_public, &child.tweak)?;
    let me = session.ctx().node_id.clone();
    let threshold = usize::from(session.ctx().threshold);

    let (nonces, commitments) = frost_core::round1::commit(key_package.signing_share(), &mut OsRng);
    session
        .broadcast(Round::SignCommit, commitments.serialize().map_err(frost_error)?)
        .await?;

    let committed = session.first_senders(Round::SignCommit, threshold).await?;
    let signers: Vec<String> = committed.iter().map(|(member, _)| member.clone()).collect();
    let mut signing_commitments = BTreeMap::new();
    for (member, payload) in &committed {
        let id = member_identifier::<C>(session, member)?;
        signing_commitments.insert(id, SigningCommitments::<C>::deserialize(payload).map_err(frost_error)?);
    }
    let signing_package = SigningPackage::new(signing_commitments, message);

    tracing::debug!(session_id = %session.id, signers = ?signers, "FROST signing set fixed");

    if signers.contains(&me) {
        let share = frost_core::round2::sign(&signing_package, &nonces, &key_package).map_err(frost_error)?;
        session.broadcast(Round::SignShare, share.serialize()).await?;
    }

    let shares = session.collect(Round::SignShare, &signers).await?;
    let mut signature_shares = BTreeMap::new();
    for (member, payload) in shares {
        let id = member_identifier::<C>(session, &member)?;
        signature_shares.insert(id, SignatureShare::<C>::deserialize(&payload).map_err(frost_error)?);
    }

    let signature =
        frost_core::aggregate(&signing_package, &signature_shares, &public_key_package).map_err(frost_error)?;
    let bytes = signature.serialize().map_err(frost_error)?;

    tracing::info!(
        session_id = %session.id,
        child = %hex::encode(&child.public),
        "FROST signature aggregated"
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safe_common::{derive_public, verify_signature, Curve, DerivationPath};

    type Tr = frost_secp256k1_tr::Secp256K1Sha256TR;

    fn dealer_key(curve: Curve) -> (Vec<StoredKey>, Vec<u8>) {
        let (shares, pubkeys) = frost_secp256k1_tr::keys::generate_with_dealer(
            3,
            2,
            frost_secp256k1_tr::keys::IdentifierList::Default,
            &mut OsRng,
        )
        .unwrap();
        let group = pubkeys.verifying_key().serialize().unwrap();
        let public = Tr::publish(&group);
        let keys = shares
            .into_values()
            .map(|share| {
                let package = KeyPackage::try_from(share).unwrap();
                StoredKey {
                    session_id: uuid::Uuid::nil(),
                    curve,
                    public: public.clone(),
                    chain_code: [8u8; 32],
                    share: KeyShare::Frost {
                        key_package: package.serialize().unwrap(),
                        public_key_package: pubkeys.serialize().unwrap(),
                    },
                }
            })
            .collect();
        (keys, public)
    }

    #[test]
    fn test_tweaked_packages_sign_for_child() {
        let curve = Curve::Secp256k1SchnorrBitcoin;
        let (keys, master) = dealer_key(curve);
        let path = DerivationPath::new(vec![1, 123]).unwrap();
        let child = derive_public(Tr::SCHEME, &master, &keys[0].chain_code, &path).unwrap();

        let mut packages = BTreeMap::new();
        let mut public_package = None;
        for key in keys.iter().take(2) {
            let (kp, pkp) = load_packages::<Tr>(key).unwrap();
            let (kp, pkp) = tweak_packages(&kp, &pkp, &child.tweak).unwrap();
            public_package = Some(pkp);
            packages.insert(*kp.identifier(), kp);
        }
        let public_package = public_package.unwrap();

        let mut nonces = BTreeMap::new();
        let mut commitments = BTreeMap::new();
        for (id, kp) in &packages {
            let (n, c) = frost_core::round1::commit(kp.signing_share(), &mut OsRng);
            nonces.insert(*id, n);
            commitments.insert(*id, c);
        }
        let signing_package = SigningPackage::new(commitments, b"mixin");
        let mut shares = BTreeMap::new();
        for (id, n) in &nonces {
            shares.insert(*id, frost_core::round2::sign(&signing_package, n, &packages[id]).unwrap());
        }
        let signature = frost_core::aggregate(&signing_package, &shares, &public_package)
            .unwrap()
            .serialize()
            .unwrap();

        assert!(verify_signature(curve, &child.public, b"mixin", &signature).is_ok());
        assert!(verify_signature(curve, &master, b"mixin", &signature).is_err());
    }

    #[test]
    fn test_master_path_keeps_group_key() {
        let curve = Curve::Secp256k1SchnorrBitcoin;
        let (keys, master) = dealer_key(curve);
        let child = derive_public(Tr::SCHEME, &master, &keys[0].chain_code, &DerivationPath::master()).unwrap();
        let (kp, pkp) = load_packages::<Tr>(&keys[0]).unwrap();
        let (_, tweaked) = tweak_packages(&kp, &pkp, &child.tweak).unwrap();
        let group = tweaked.verifying_key().serialize().unwrap();
        assert_eq!(group[0], 0x02);
        assert_eq!(&group[1..], &master[..]);
    }

    #[test]
    fn test_ecdsa_share_is_rejected() {
        let key = StoredKey {
            session_id: uuid::Uuid::nil(),
            curve: Curve::Secp256k1EcdsaBitcoin,
            public: vec![2u8; 33],
            chain_code: [0u8; 32],
            share: KeyShare::Ecdsa {
                private_share: vec![1u8; 32],
                public_key: vec![2u8; 33],
            },
        };
        assert!(matches!(load_packages::<Tr>(&key), Err(SessionError::Protocol(_))));
    }
}
