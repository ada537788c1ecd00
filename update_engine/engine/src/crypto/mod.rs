//! Signer/Verifier capability: Ed25519 ECU keys and canonical-JSON signatures.

pub mod keys;
pub mod signing;

pub use keys::{EcuKey, PublicKey};
pub use signing::{SignatureEntry, canonical_json, sign_bytes, verify_signature};
