//! Time attestation capability. A Secondary proves freshness by getting its
//! current nonce signed, together with the time, by a pinned time server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{EcuKey, PublicKey};
use crate::error::UpdateError;
use crate::manifest::{ExpectedSigner, Signable, SignedBody, verify};
use crate::types::{EcuSerial, Nonce};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeAttestation {
    pub time: DateTime<Utc>,
    pub nonces: Vec<Nonce>,
}

impl SignedBody for TimeAttestation {
    const SCHEMA: &'static str = "time attestation";

    fn check_schema(&self) -> Result<(), UpdateError> {
        if self.nonces.is_empty() {
            return Err(UpdateError::Schema("time attestation lists no nonces".into()));
        }
        Ok(())
    }
}

/// A Secondary's request to have its current nonce attested. Signed with the
/// ECU key, so only the registered Secondary can move its own expected nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRequest {
    pub ecu_serial: EcuSerial,
    pub nonce: Nonce,
}

impl SignedBody for TimeRequest {
    const SCHEMA: &'static str = "time attestation request";

    fn check_schema(&self) -> Result<(), UpdateError> {
        if self.ecu_serial.0.is_empty() {
            return Err(UpdateError::Schema("time attestation request has an empty serial".into()));
        }
        Ok(())
    }
}

pub fn build_time_request(ecu_serial: &EcuSerial, nonce: Nonce, key: &EcuKey) -> Result<Signable<TimeRequest>, UpdateError> {
    Signable::sign(
        TimeRequest {
            ecu_serial: ecu_serial.clone(),
            nonce,
        },
        key,
    )
}

pub trait TimeServer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// Signs the current time together with `nonces`.
    fn attest(&self, nonces: &[Nonce]) -> Result<Signable<TimeAttestation>, UpdateError>;
}

/// Time server backed by the local clock and an Ed25519 key.
pub struct LocalTimeServer {
    key: EcuKey,
}

impl LocalTimeServer {
    pub fn new(key: EcuKey) -> Self {
        LocalTimeServer { key }
    }
}

impl TimeServer for LocalTimeServer {
    fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    fn attest(&self, nonces: &[Nonce]) -> Result<Signable<TimeAttestation>, UpdateError> {
        Signable::sign(
            TimeAttestation {
                time: Utc::now(),
                nonces: nonces.to_vec(),
            },
            &self.key,
        )
    }
}

/// Checks an attestation against the pinned time server key, the nonce the
/// caller sent, and the caller's clock. Returns the attested time.
pub fn verify_attestation(
    attestation: &Signable<TimeAttestation>,
    timeserver_key: &PublicKey,
    nonce: Nonce,
    not_before: DateTime<Utc>,
) -> Result<DateTime<Utc>, UpdateError> {
    verify(attestation, ExpectedSigner::Key(timeserver_key))?;

    if !attestation.signed.nonces.contains(&nonce) {
        return Err(UpdateError::StaleNonce(format!(
            "time attestation does not include nonce {nonce}"
        )));
    }
    if attestation.signed.time < not_before {
        return Err(UpdateError::TimeRegression(format!(
            "attested time {} is earlier than the ECU clock {}",
            attestation.signed.time, not_before
        )));
    }
    Ok(attestation.signed.time)
}
