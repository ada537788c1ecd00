//! Signed envelopes and the ECU / vehicle manifests carried in them.
//!
//! Every envelope has the shape `{signed: <body>, signatures: [{keyid, method, sig}]}`.
//! The signature covers the canonical JSON of `signed`, so any mutation of the
//! body without re-signing is detected by [`verify`].

pub mod ecu;
pub mod vehicle;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{EcuKey, PublicKey};
use crate::crypto::signing::{SIGNATURE_METHOD, SignatureEntry, canonical_json, sign_bytes, verify_signature};
use crate::error::UpdateError;

pub use ecu::{EcuManifest, build_ecu_manifest};
pub use vehicle::{VehicleManifest, build_vehicle_manifest};

/// A body that can be carried in a [`Signable`].
pub trait SignedBody: Serialize + DeserializeOwned {
    /// Name used in schema errors.
    const SCHEMA: &'static str;

    fn check_schema(&self) -> Result<(), UpdateError>;
}

/// Signed envelope. Immutable once produced: mutating `signed` invalidates
/// the enclosed signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signable<T> {
    pub signed: T,
    pub signatures: Vec<SignatureEntry>,
}

impl<T: SignedBody> Signable<T> {
    /// Schema-checks `body` and signs it with `key`.
    pub fn sign(body: T, key: &EcuKey) -> Result<Self, UpdateError> {
        body.check_schema()?;
        let message = canonical_json(&body)?;
        Ok(Signable {
            signatures: vec![sign_bytes(key, &message)],
            signed: body,
        })
    }

    /// Parses an untyped payload, failing with a schema error if it does not
    /// have the expected shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self, UpdateError> {
        let signable: Self = serde_json::from_value(value)
            .map_err(|e| UpdateError::Schema(format!("malformed {}: {e}", T::SCHEMA)))?;
        signable.check_schema()?;
        Ok(signable)
    }

    pub fn to_value(&self) -> Result<serde_json::Value, UpdateError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn check_schema(&self) -> Result<(), UpdateError> {
        if self.signatures.is_empty() {
            return Err(UpdateError::Schema(format!("{} carries no signatures", T::SCHEMA)));
        }
        for entry in &self.signatures {
            let keyid_ok = entry.keyid.len() == 64 && hex::decode(&entry.keyid).is_ok();
            let sig_ok = entry.sig.len() == 128 && hex::decode(&entry.sig).is_ok();
            if !keyid_ok || !sig_ok || entry.method != SIGNATURE_METHOD {
                return Err(UpdateError::Schema(format!(
                    "{} has a malformed signature entry (keyid {:?}, method {:?})",
                    T::SCHEMA,
                    entry.keyid,
                    entry.method
                )));
            }
        }
        self.signed.check_schema()
    }
}

/// Public keys indexed by keyid.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, PublicKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: PublicKey) {
        self.keys.insert(key.keyid(), key);
    }

    pub fn get(&self, keyid: &str) -> Option<&PublicKey> {
        self.keys.get(keyid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<PublicKey> for KeyRing {
    fn from_iter<I: IntoIterator<Item = PublicKey>>(iter: I) -> Self {
        let mut ring = KeyRing::new();
        for key in iter {
            ring.insert(key);
        }
        ring
    }
}

/// Whose signature [`verify`] requires.
#[derive(Debug, Clone, Copy)]
pub enum ExpectedSigner<'a> {
    /// Exactly this key.
    Key(&'a PublicKey),
    /// Any key in the ring.
    AnyOf(&'a KeyRing),
}

/// Structural and cryptographic check of a signed envelope. Nonce freshness
/// is the caller's concern.
pub fn verify<T: SignedBody>(
    signable: &Signable<T>,
    expected: ExpectedSigner<'_>,
) -> Result<(), UpdateError> {
    signable.check_schema()?;
    let message = canonical_json(&signable.signed)?;

    let mut last_error = None;
    for entry in &signable.signatures {
        let key = match expected {
            ExpectedSigner::Key(key) if key.keyid() == entry.keyid => key,
            ExpectedSigner::Key(_) => continue,
            ExpectedSigner::AnyOf(ring) => match ring.get(&entry.keyid) {
                Some(key) => key,
                None => continue,
            },
        };
        match verify_signature(key, &message, entry) {
            Ok(()) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        UpdateError::Signature(format!(
            "{} is not signed by an expected key",
            T::SCHEMA
        ))
    }))
}
