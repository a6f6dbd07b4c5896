//! Operation codec
//!
//! Wire layout shared by signer operations and keeper requests:
//!
//! ```text
//! type(1) | curve(1) | session-id(16) | u16 len | public | u16 len | extra
//! ```
//!
//! [`Envelope`] only checks framing. [`Operation`] adds the per-type and
//! per-curve width rules, so a decoded operation is always well formed.

use crate::curve::{Curve, CurveError, Scheme, CHAIN_CODE_LEN, SIGNATURE_LEN};
use crate::derivation::{DerivationPath, FINGERPRINT_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Header bytes before the variable-length fields
pub const HEADER_LEN: usize = 1 + 1 + 16;

/// Role byte markers carried in keygen outputs and requests
pub const ROLE_HOLDER: u8 = 1;
pub const ROLE_SIGNER: u8 = 2;
pub const ROLE_OBSERVER: u8 = 3;

/// Trailing flag byte of FROST keygen outputs
pub const FLAG_NONE: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    #[error("unknown operation type: {0}")]
    UnknownType(u8),
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error("field too long: {0} bytes")]
    FieldTooLong(usize),
}

/// Framing-level view of an encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: u8,
    pub curve: Curve,
    pub id: Uuid,
    pub public: Vec<u8>,
    pub extra: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(HEADER_LEN + 4 + self.public.len() + self.extra.len());
        out.push(self.tag);
        out.push(self.curve.id());
        out.extend_from_slice(self.id.as_bytes());
        write_field(&mut out, &self.public)?;
        write_field(&mut out, &self.extra)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN + 4 {
            return Err(malformed(format!("payload too short: {} bytes", bytes.len())));
        }
        let tag = bytes[0];
        let curve = Curve::from_id(bytes[1])?;
        let id = Uuid::from_slice(&bytes[2..HEADER_LEN])
            .map_err(|e| malformed(e.to_string()))?;

        let mut cursor = HEADER_LEN;
        let public = read_field(bytes, &mut cursor)?;
        let extra = read_field(bytes, &mut cursor)?;
        if cursor != bytes.len() {
            return Err(malformed(format!("{} trailing bytes", bytes.len() - cursor)));
        }

        Ok(Self {
            tag,
            curve,
            id,
            public,
            extra,
        })
    }
}

fn write_field(out: &mut Vec<u8>, field: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(field.len()).map_err(|_| CodecError::FieldTooLong(field.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(field);
    Ok(())
}

fn read_field(bytes: &[u8], cursor: &mut usize) -> Result<Vec<u8>, CodecError> {
    let start = *cursor;
    let prefix = bytes
        .get(start..start + 2)
        .ok_or_else(|| malformed(format!("missing length prefix at offset {}", start)))?;
    let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    let field = bytes
        .get(start + 2..start + 2 + len)
        .ok_or_else(|| malformed(format!("field of {} bytes overruns payload", len)))?;
    *cursor = start + 2 + len;
    Ok(field.to_vec())
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedOperation(reason.into())
}

/// Operation kinds exchanged with the signer group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    KeygenInput,
    KeygenOutput,
    SignInput,
    SignOutput,
}

impl OperationType {
    pub fn tag(self) -> u8 {
        match self {
            OperationType::KeygenInput => 1,
            OperationType::KeygenOutput => 2,
            OperationType::SignInput => 3,
            OperationType::SignOutput => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            1 => Ok(OperationType::KeygenInput),
            2 => Ok(OperationType::KeygenOutput),
            3 => Ok(OperationType::SignInput),
            4 => Ok(OperationType::SignOutput),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    /// Response type paired with a request type
    pub fn response(self) -> Option<Self> {
        match self {
            OperationType::KeygenInput => Some(OperationType::KeygenOutput),
            OperationType::SignInput => Some(OperationType::SignOutput),
            _ => None,
        }
    }
}

/// A validated signer protocol operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationType,
    pub curve: Curve,
    pub public: Vec<u8>,
    pub extra: Vec<u8>,
}

impl Operation {
    pub fn keygen_input(id: Uuid, curve: Curve) -> Self {
        Self {
            id,
            kind: OperationType::KeygenInput,
            curve,
            public: Vec::new(),
            extra: Vec::new(),
        }
    }

    pub fn keygen_output(id: Uuid, curve: Curve, public: Vec<u8>, chain_code: [u8; 32]) -> Self {
        let mut extra = Vec::with_capacity(curve.keygen_extra_len());
        extra.push(ROLE_SIGNER);
        extra.extend_from_slice(&chain_code);
        if curve.scheme() != Scheme::Ecdsa {
            extra.push(FLAG_NONE);
        }
        Self {
            id,
            kind: OperationType::KeygenOutput,
            curve,
            public,
            extra,
        }
    }

    pub fn sign_input(
        id: Uuid,
        curve: Curve,
        fingerprint: [u8; FINGERPRINT_LEN],
        path: &DerivationPath,
        message: Vec<u8>,
    ) -> Self {
        let mut public = fingerprint.to_vec();
        public.extend_from_slice(&path.to_bytes());
        Self {
            id,
            kind: OperationType::SignInput,
            curve,
            public,
            extra: message,
        }
    }

    pub fn sign_output(id: Uuid, curve: Curve, public: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            id,
            kind: OperationType::SignOutput,
            curve,
            public,
            extra: signature,
        }
    }

    pub fn public_hex(&self) -> String {
        hex::encode(&self.public)
    }

    /// Chain code of a keygen output
    pub fn chain_code(&self) -> Option<[u8; 32]> {
        if self.kind != OperationType::KeygenOutput {
            return None;
        }
        self.extra.get(1..1 + CHAIN_CODE_LEN)?.try_into().ok()
    }

    /// Key fingerprint and derivation path of a sign input
    pub fn signing_target(&self) -> Result<([u8; FINGERPRINT_LEN], DerivationPath), CodecError> {
        if self.kind != OperationType::SignInput || self.public.len() < FINGERPRINT_LEN {
            return Err(malformed("not a sign input"));
        }
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&self.public[..FINGERPRINT_LEN]);
        let path = DerivationPath::from_bytes(&self.public[FINGERPRINT_LEN..])
            .map_err(|e| malformed(e.to_string()))?;
        Ok((fingerprint, path))
    }

    /// Whether `response` answers this operation
    pub fn is_answered_by(&self, response: &Operation) -> bool {
        self.kind.response() == Some(response.kind)
            && self.id == response.id
            && self.curve == response.curve
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        let curve = self.curve;
        match self.kind {
            OperationType::KeygenInput => {
                expect_len("public", &self.public, 0)?;
            }
            OperationType::KeygenOutput => {
                expect_len("public", &self.public, curve.public_key_len())?;
                expect_len("extra", &self.extra, curve.keygen_extra_len())?;
                if self.extra[0] != ROLE_SIGNER {
                    return Err(malformed(format!("unexpected role byte {}", self.extra[0])));
                }
            }
            OperationType::SignInput => {
                self.signing_target()?;
                if self.extra.is_empty() {
                    return Err(malformed("empty message"));
                }
                if curve.scheme() == Scheme::Ecdsa {
                    expect_len("extra", &self.extra, 32)?;
                }
            }
            OperationType::SignOutput => {
                expect_len("public", &self.public, curve.public_key_len())?;
                expect_len("extra", &self.extra, SIGNATURE_LEN)?;
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        Envelope::from(self.clone()).encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::try_from(Envelope::decode(bytes)?)
    }
}

fn expect_len(field: &str, value: &[u8], expected: usize) -> Result<(), CodecError> {
    if value.len() != expected {
        return Err(malformed(format!(
            "{} length {} does not match expected {}",
            field,
            value.len(),
            expected
        )));
    }
    Ok(())
}

impl From<Operation> for Envelope {
    fn from(op: Operation) -> Self {
        Self {
            tag: op.kind.tag(),
            curve: op.curve,
            id: op.id,
            public: op.public,
            extra: op.extra,
        }
    }
}

impl TryFrom<Envelope> for Operation {
    type Error = CodecError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let op = Operation {
            id: envelope.id,
            kind: OperationType::from_tag(envelope.tag)?,
            curve: envelope.curve,
            public: envelope.public,
            extra: envelope.extra,
        };
        op.validate()?;
        Ok(op)
    }
}
