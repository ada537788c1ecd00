use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::EcuKey;
use crate::error::UpdateError;
use crate::manifest::{EcuManifest, Signable, SignedBody};
use crate::types::{EcuSerial, Vin};

/// The Primary's signed aggregate of the ECU manifests it collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleManifest {
    pub vin: Vin,
    pub primary_ecu_serial: EcuSerial,
    #[serde(default)]
    pub ecu_version_manifests: BTreeMap<EcuSerial, Vec<Signable<EcuManifest>>>,
}

impl VehicleManifest {
    pub fn ecu_manifest_count(&self) -> usize {
        self.ecu_version_manifests.values().map(Vec::len).sum()
    }
}

impl SignedBody for VehicleManifest {
    const SCHEMA: &'static str = "vehicle version manifest";

    fn check_schema(&self) -> Result<(), UpdateError> {
        if self.vin.0.is_empty() || self.primary_ecu_serial.0.is_empty() {
            return Err(UpdateError::Schema(
                "vehicle manifest needs a VIN and a Primary serial".into(),
            ));
        }
        for (serial, manifests) in &self.ecu_version_manifests {
            for manifest in manifests {
                manifest.check_schema()?;
                if &manifest.signed.ecu_serial != serial {
                    return Err(UpdateError::Schema(format!(
                        "manifest from ECU {} filed under {serial}",
                        manifest.signed.ecu_serial
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Groups `ecu_manifests` by serial and signs the result as the Primary.
pub fn build_vehicle_manifest(
    vin: &Vin,
    primary_serial: &EcuSerial,
    ecu_manifests: impl IntoIterator<Item = Signable<EcuManifest>>,
    key: &EcuKey,
) -> Result<Signable<VehicleManifest>, UpdateError> {
    let mut grouped: BTreeMap<EcuSerial, Vec<Signable<EcuManifest>>> = BTreeMap::new();
    for manifest in ecu_manifests {
        grouped
            .entry(manifest.signed.ecu_serial.clone())
            .or_default()
            .push(manifest);
    }
    Signable::sign(
        VehicleManifest {
            vin: vin.clone(),
            primary_ecu_serial: primary_serial.clone(),
            ecu_version_manifests: grouped,
        },
        key,
    )
}
