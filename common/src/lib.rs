//! Shared building blocks for safe keeper and signer nodes
//!
//! - [`operation`]: binary operation envelope exchanged over the group bus
//! - [`crypto`]: memo encryption and sealed round messages
//! - [`derivation`]: non-hardened child keys for threshold shares
//! - [`bus`]: the group bus collaborator and its in-memory/HTTP forms
//! - [`verify`]: per-curve signature verification

pub mod bus;
pub mod crypto;
pub mod curve;
pub mod derivation;
pub mod ids;
pub mod logging;
pub mod operation;
pub mod verify;

pub use bus::{BusError, BusFrame, GroupBus, HttpBus, MemoryBus, SessionMessage, Transfer};
pub use crypto::{CryptoError, OperationCipher, TransportKey};
pub use curve::{Chain, Curve, CurveError, Scheme};
pub use derivation::{derive_public, fingerprint, DerivationError, DerivationPath, DerivedKey};
pub use operation::{CodecError, Envelope, Operation, OperationType};
pub use verify::{verify_signature, SignatureError};
