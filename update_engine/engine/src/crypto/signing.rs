//! Canonical encoding, signing and signature verification of JSON bodies.

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{EcuKey, PublicKey};
use crate::error::UpdateError;

pub const SIGNATURE_METHOD: &str = "ed25519";

/// One entry of a signed envelope's `signatures` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub keyid: String,
    pub method: String,
    /// Hex-encoded 64-byte signature.
    pub sig: String,
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
pub fn canonical_json<T: Serialize>(body: &T) -> Result<Vec<u8>, UpdateError> {
    // serde_json's Map is ordered by key unless `preserve_order` is enabled.
    let value = serde_json::to_value(body)?;
    Ok(serde_json::to_vec(&value)?)
}

pub fn sign_bytes(key: &EcuKey, message: &[u8]) -> SignatureEntry {
    SignatureEntry {
        keyid: key.keyid(),
        method: SIGNATURE_METHOD.to_string(),
        sig: hex::encode(key.sign(message).to_bytes()),
    }
}

/// Verify a signature entry against a message and public key.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    entry: &SignatureEntry,
) -> Result<(), UpdateError> {
    if entry.keyid != public_key.keyid() {
        return Err(UpdateError::Signature(format!(
            "signature keyid {} does not match key {}",
            entry.keyid,
            public_key.keyid()
        )));
    }

    let bytes = hex::decode(&entry.sig)
        .map_err(|e| UpdateError::Signature(format!("signature is not hex: {e}")))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|e| UpdateError::Signature(format!("invalid signature format: {e}")))?;

    if public_key.verify(message, &signature) {
        Ok(())
    } else {
        Err(UpdateError::Signature(format!(
            "signature by {} does not match the signed body",
            entry.keyid
        )))
    }
}
