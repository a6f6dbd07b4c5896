//! Threshold ECDSA sessions on secp256k1
//!
//! Keygen runs with every member and adds a chain code round so keys can be
//! derived. Signing starts with a join round: the first `threshold` members
//! to join in bus order generate two triples, a presignature and the
//! signature under the child share, then publish the signature for the
//! members that were left out.
//!
//! Triple generation is CPU heavy and the protocol state machines are not
//! `Send`, so each session runs on a blocking thread that drives its own
//! waits on the runtime.

use crate::dkg::{chain_code_seed, combine_chain_code};
use crate::keystore::{KeyShare, StoredKey};
use crate::session::{Round, Session, SessionError};
use cait_sith::protocol::{Action, Participant, Protocol};
use cait_sith::{KeygenOutput, PresignArguments};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::AffineCoordinates;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, FieldBytes, Scalar, Secp256k1, U256};
use safe_common::{verify_signature, Curve, DerivedKey};
use std::future::Future;

fn protocol_error(e: impl std::fmt::Debug) -> SessionError {
    SessionError::Protocol(format!("ECDSA protocol error: {:?}", e))
}

fn participant(index: u16) -> Participant {
    Participant::from(u32::from(index))
}

/// Runs `f` on a blocking thread that re-enters the current runtime
async fn on_blocking_thread<T, F, Fut>(session: Session, f: F) -> Result<T, SessionError>
where
    F: FnOnce(Session) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, SessionError>>,
    T: Send + 'static,
{
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || handle.block_on(f(session)))
        .await
        .map_err(|e| SessionError::Protocol(format!("session task failed: {}", e)))?
}

/// Members taking part in one protocol, paired with their participant ids
struct Participants {
    me: Participant,
    members: Vec<(Participant, String)>,
}

impl Participants {
    fn new(session: &Session, members: &[String]) -> Result<Self, SessionError> {
        let ctx = session.ctx();
        let mut list = Vec::with_capacity(members.len());
        for member in members {
            let index = ctx
                .index_of(member)
                .ok_or_else(|| SessionError::UnknownMember(member.clone()))?;
            list.push((participant(index), member.clone()));
        }
        list.sort_by_key(|(p, _)| u32::from(*p));
        Ok(Self {
            me: participant(ctx.my_index()?),
            members: list,
        })
    }

    fn ids(&self) -> Vec<Participant> {
        self.members.iter().map(|(p, _)| *p).collect()
    }

    fn member(&self, p: Participant) -> Option<&str> {
        self.members
            .iter()
            .find(|(id, _)| *id == p)
            .map(|(_, m)| m.as_str())
    }

    fn participant(&self, member: &str) -> Option<Participant> {
        self.members.iter().find(|(_, m)| m == member).map(|(p, _)| *p)
    }
}

/// Pumps one protocol to completion over `round`
async fn drive<T>(
    session: &mut Session,
    round: Round,
    participants: &Participants,
    mut protocol: impl Protocol<Output = T>,
) -> Result<T, SessionError> {
    loop {
        loop {
            match protocol.poke().map_err(protocol_error)? {
                Action::Wait => break,
                Action::SendMany(data) => session.broadcast(round, data).await?,
                Action::SendPrivate(to, data) => {
                    let member = participants
                        .member(to)
                        .ok_or_else(|| SessionError::Protocol(format!("no member for participant {:?}", to)))?
                        .to_string();
                    session.send_private(round, &member, &data).await?;
                }
                Action::Return(output) => return Ok(output),
            }
        }

        let message = session.next(round).await?;
        if message.from == session.ctx().node_id {
            continue;
        }
        match participants.participant(&message.from) {
            Some(from) => protocol.message(from, message.payload),
            None => tracing::debug!(
                session_id = %session.id,
                from = %message.from,
                "ignoring message from non-participant"
            ),
        }
    }
}

fn scalar(bytes: &[u8]) -> Result<Scalar, SessionError> {
    let repr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SessionError::Protocol(format!("scalar of {} bytes", bytes.len())))?;
    Option::from(Scalar::from_repr(repr.into()))
        .ok_or_else(|| SessionError::Protocol("scalar out of range".to_string()))
}

fn point(bytes: &[u8]) -> Result<AffinePoint, SessionError> {
    k256::PublicKey::from_sec1_bytes(bytes)
        .map(|pk| *pk.as_affine())
        .map_err(|e| SessionError::Protocol(format!("invalid public key: {}", e)))
}

/// Low-S compact `r || s` from a signature nonce point and `s`
pub fn compact_signature(big_r: &AffinePoint, s: &Scalar) -> Result<Vec<u8>, SessionError> {
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&big_r.x());
    let signature = k256::ecdsa::Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|e| SessionError::Protocol(format!("invalid signature scalars: {}", e)))?;
    let signature = signature.normalize_s().unwrap_or(signature);
    Ok(signature.to_bytes().to_vec())
}

/// Runs threshold ECDSA keygen with every group member
pub async fn run_keygen(session: Session, curve: Curve) -> Result<StoredKey, SessionError> {
    on_blocking_thread(session, move |mut session| async move { keygen(&mut session, curve).await }).await
}

async fn keygen(session: &mut Session, curve: Curve) -> Result<StoredKey, SessionError> {
    let members = session.ctx().members.clone();
    let threshold = usize::from(session.ctx().threshold);

    session.broadcast(Round::ChainCode, chain_code_seed().to_vec()).await?;
    let seeds = session.collect(Round::ChainCode, &members).await?;

    let participants = Participants::new(session, &members)?;
    let protocol =
        cait_sith::keygen::<Secp256k1>(&participants.ids(), participants.me, threshold).map_err(protocol_error)?;
    let output = drive(session, Round::EcdsaKeygen, &participants, protocol).await?;

    let public = output.public_key.to_encoded_point(true).as_bytes().to_vec();
    tracing::info!(
        session_id = %session.id,
        curve = %curve,
        public_key = %hex::encode(&public),
        "ECDSA keygen completed"
    );

    Ok(StoredKey {
        session_id: session.id,
        curve,
        public: public.clone(),
        chain_code: combine_chain_code(&seeds),
        share: KeyShare::Ecdsa {
            private_share: output.private_share.to_bytes().to_vec(),
            public_key: public,
        },
    })
}

/// Signs the 32-byte `digest` under the child key `child` of `key`
pub async fn run_sign(session: Session, key: StoredKey, child: DerivedKey, digest: Vec<u8>) -> Result<Vec<u8>, SessionError> {
    on_blocking_thread(session, move |mut session| async move {
        sign(&mut session, &key, &child, &digest).await
    })
    .await
}

async fn sign(session: &mut Session, key: &StoredKey, child: &DerivedKey, digest: &[u8]) -> Result<Vec<u8>, SessionError> {
    let private_share = match &key.share {
        KeyShare::Ecdsa { private_share, .. } => scalar(private_share)?,
        KeyShare::Frost { .. } => {
            return Err(SessionError::Protocol(format!(
                "key {} is not an ECDSA key",
                hex::encode(&key.public)
            )))
        }
    };
    if digest.len() != 32 {
        return Err(SessionError::Protocol(format!("digest of {} bytes", digest.len())));
    }
    let child_point = point(&child.public)?;
    let keygen_out = KeygenOutput {
        private_share: private_share + scalar(&child.tweak)?,
        public_key: child_point,
    };
    let msg_hash = <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(digest));
    let me = session.ctx().node_id.clone();
    let threshold = usize::from(session.ctx().threshold);

    session.broadcast(Round::Join, Vec::new()).await?;
    let signers: Vec<String> = session
        .first_senders(Round::Join, threshold)
        .await?
        .into_iter()
        .map(|(member, _)| member)
        .collect();

    tracing::debug!(session_id = %session.id, signers = ?signers, "ECDSA signing set fixed");

    if !signers.contains(&me) {
        // left out of the set: wait for a member's verified result
        loop {
            let message = session.next(Round::Signature).await?;
            if signers.contains(&message.from)
                && verify_signature(key.curve, &child.public, digest, &message.payload).is_ok()
            {
                return Ok(message.payload);
            }
            tracing::warn!(session_id = %session.id, from = %message.from, "discarding invalid signature message");
        }
    }

    let participants = Participants::new(session, &signers)?;
    let ids = participants.ids();

    let protocol = cait_sith::triples::generate_triple::<Secp256k1>(&ids, participants.me, threshold)
        .map_err(protocol_error)?;
    let triple0 = drive(session, Round::EcdsaTriple0, &participants, protocol).await?;
    let protocol = cait_sith::triples::generate_triple::<Secp256k1>(&ids, participants.me, threshold)
        .map_err(protocol_error)?;
    let triple1 = drive(session, Round::EcdsaTriple1, &participants, protocol).await?;

    let protocol = cait_sith::presign(
        &ids,
        participants.me,
        PresignArguments {
            triple0,
            triple1,
            keygen_out,
            threshold,
        },
    )
    .map_err(protocol_error)?;
    let presignature = drive(session, Round::EcdsaPresign, &participants, protocol).await?;

    let protocol = cait_sith::sign(&ids, participants.me, child_point, presignature, msg_hash).map_err(protocol_error)?;
    let full = drive(session, Round::EcdsaSign, &participants, protocol).await?;
    let signature = compact_signature(&full.big_r, &full.s)?;

    session.broadcast(Round::Signature, signature.clone()).await?;
    tracing::info!(
        session_id = %session.id,
        child = %hex::encode(&child.public),
        "ECDSA signature completed"
    );
    Ok(signature)
}
