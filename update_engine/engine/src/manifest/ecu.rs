use serde::{Deserialize, Serialize};

use crate::crypto::keys::EcuKey;
use crate::error::UpdateError;
use crate::manifest::{Signable, SignedBody};
use crate::types::{EcuSerial, Nonce, TargetInfo};

/// What one ECU reports about itself, bound to the nonce of the current round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcuManifest {
    pub ecu_serial: EcuSerial,
    pub installed_image: TargetInfo,
    /// Free-form log of attacks the ECU believes it has seen.
    pub attacks_detected: String,
    pub nonce: Nonce,
}

impl SignedBody for EcuManifest {
    const SCHEMA: &'static str = "ECU version manifest";

    fn check_schema(&self) -> Result<(), UpdateError> {
        if self.ecu_serial.0.is_empty() {
            return Err(UpdateError::Schema("ECU manifest has an empty serial".into()));
        }
        self.installed_image.check_schema()
    }
}

/// Builds and signs an ECU manifest. Deterministic for identical inputs.
pub fn build_ecu_manifest(
    ecu_serial: &EcuSerial,
    firmware: &TargetInfo,
    attacks_detected: &str,
    nonce: Nonce,
    key: &EcuKey,
) -> Result<Signable<EcuManifest>, UpdateError> {
    Signable::sign(
        EcuManifest {
            ecu_serial: ecu_serial.clone(),
            installed_image: firmware.clone(),
            attacks_detected: attacks_detected.to_string(),
            nonce,
        },
        key,
    )
}
