//! Deterministic identifiers
//!
//! Session ids, trace ids and bond asset ids are all hashes of their
//! inputs, so a replayed request maps to the same id and two different
//! requests never share one.

use sha2::{Digest, Sha256};
use uuid::{Builder, Uuid};

/// Hashes length-delimited parts into a version 5 shaped UUID
pub fn unique_id(parts: &[&[u8]]) -> Uuid {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_sha1_bytes(bytes).into_uuid()
}

/// Session id for a keygen or sign run requested under `trace_id`
pub fn session_id(kind: &str, trace_id: &str, params: &[u8]) -> Uuid {
    unique_id(&[kind.as_bytes(), trace_id.as_bytes(), params])
}

/// Trace id of a ledger transaction emitted while handling `request_id`
pub fn trace_id(request_id: &Uuid, purpose: &str) -> Uuid {
    unique_id(&[request_id.as_bytes(), purpose.as_bytes()])
}
