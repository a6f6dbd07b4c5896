//! Threshold signer node for safe custody
//!
//! A fixed group of signer nodes holds shares of every custody key. The
//! keeper asks the group for keys and signatures by sending sealed
//! operations over the group bus; each node runs the same session and
//! answers with the same result.
//!
//! # Architecture
//!
//! - FROST DKG and signing for BIP340 Schnorr and Ed25519 keys
//! - threshold ECDSA (cait-sith) for secp256k1 chain keys
//! - non-hardened child keys for any derivation path, signed by shifting
//!   every share by the path tweak
//! - encrypted key shares on disk, one file per group key
//!
//! # Usage
//!
//! ```bash
//! safe-signer run --config config/signer-1.toml
//! ```

pub mod config;
pub mod dkg;
pub mod ecdsa;
pub mod keystore;
pub mod node;
pub mod server;
pub mod session;
pub mod signing;
pub mod types;

pub use config::{ConfigError, SignerConfig};
pub use keystore::{KeyRing, KeyShare, Keystore, KeystoreError, StoredKey};
pub use node::{SignerError, SignerNode};
pub use server::{create_router, AppState};
pub use session::{Round, Session, SessionContext, SessionError};
pub use types::*;
