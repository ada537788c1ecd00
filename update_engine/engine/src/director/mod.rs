//! Director context: the ECU registry and the vehicle manifests it accepted.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{error, info};

use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::crypto::keys::PublicKey;
use crate::error::UpdateError;
use crate::manifest::{ExpectedSigner, Signable, VehicleManifest, verify};
use crate::registry::{EcuRegistry, RegistrationOutcome, RegistrationPolicy};
use crate::types::{EcuSerial, Vin};

pub struct Director {
    registry: EcuRegistry,
    vehicle_manifests: RwLock<HashMap<Vin, Signable<VehicleManifest>>>,
    audit: AuditTracker,
}

impl Director {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Director {
            registry: EcuRegistry::new(policy),
            vehicle_manifests: RwLock::new(HashMap::new()),
            audit: AuditTracker::default(),
        }
    }

    pub fn registry(&self) -> &EcuRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditTracker {
        &self.audit
    }

    pub fn register_ecu_serial(
        &self,
        serial: &EcuSerial,
        public_key: PublicKey,
    ) -> Result<RegistrationOutcome, UpdateError> {
        let result = self.registry.register_ecu_serial(serial.clone(), public_key, None);
        let message = match &result {
            Ok(outcome) => format!("keyid {} ({outcome:?})", public_key.keyid()),
            Err(e) => format!("refused keyid {}: {e}", public_key.keyid()),
        };
        self.audit.log(AuditRecord::new(
            AuditEventType::Registration,
            serial.to_string(),
            message,
        ));
        result
    }

    /// Accepts the whole vehicle manifest or none of it.
    pub fn receive_vehicle_manifest(
        &self,
        vin: &Vin,
        primary_serial: &EcuSerial,
        signed_manifest: Value,
    ) -> Result<(), UpdateError> {
        match self.check_vehicle_manifest(vin, primary_serial, signed_manifest) {
            Ok(manifest) => {
                info!(%vin, %primary_serial, ecu_manifests = manifest.signed.ecu_manifest_count(), "accepted vehicle manifest");
                self.audit.log(AuditRecord::new(
                    AuditEventType::ManifestAccepted,
                    vin.to_string(),
                    format!(
                        "vehicle manifest from Primary {primary_serial} with {} ECU manifests",
                        manifest.signed.ecu_manifest_count()
                    ),
                ));
                self.vehicle_manifests
                    .write()
                    .map_err(|_| UpdateError::poisoned("vehicle manifests"))?
                    .insert(vin.clone(), manifest);
                Ok(())
            }
            Err(e) => {
                error!(%vin, %primary_serial, error = %e, "rejected vehicle manifest");
                self.audit.log(AuditRecord::new(
                    AuditEventType::ManifestRejected,
                    vin.to_string(),
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }

    fn check_vehicle_manifest(
        &self,
        vin: &Vin,
        primary_serial: &EcuSerial,
        signed_manifest: Value,
    ) -> Result<Signable<VehicleManifest>, UpdateError> {
        let manifest = Signable::<VehicleManifest>::from_value(signed_manifest)?;

        let primary_key = self.registry.public_key(primary_serial)?;
        verify(&manifest, ExpectedSigner::Key(&primary_key))?;

        if &manifest.signed.vin != vin || &manifest.signed.primary_ecu_serial != primary_serial {
            return Err(UpdateError::Schema(format!(
                "vehicle manifest body names vehicle {} and Primary {}, submitted as {vin} / {primary_serial}",
                manifest.signed.vin, manifest.signed.primary_ecu_serial
            )));
        }

        for (serial, ecu_manifests) in &manifest.signed.ecu_version_manifests {
            let ecu_key = self.registry.public_key(serial)?;
            for ecu_manifest in ecu_manifests {
                verify(ecu_manifest, ExpectedSigner::Key(&ecu_key))?;
            }
        }
        Ok(manifest)
    }

    pub fn latest_vehicle_manifest(&self, vin: &Vin) -> Result<Option<Signable<VehicleManifest>>, UpdateError> {
        Ok(self
            .vehicle_manifests
            .read()
            .map_err(|_| UpdateError::poisoned("vehicle manifests"))?
            .get(vin)
            .cloned())
    }
}
