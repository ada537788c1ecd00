use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::crypto::keys::PublicKey;
use crate::error::UpdateError;
use crate::registry::RegistrationOutcome;
use crate::types::EcuSerial;

/// A Secondary attached to this Primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryRecord {
    pub ecu_serial: EcuSerial,
    /// Needed to verify the Secondary's manifests. Registration may omit it.
    pub public_key: Option<PublicKey>,
    pub registered_at: DateTime<Utc>,
}

/// Primary-side registry of Secondaries, used to route manifest relaying and
/// target distribution.
#[derive(Default)]
pub struct SecondaryRegistry {
    secondaries: RwLock<HashMap<EcuSerial, SecondaryRecord>>,
}

impl SecondaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `serial` is attached. A key, once known, cannot be swapped.
    pub fn register_secondary(
        &self,
        serial: EcuSerial,
        public_key: Option<PublicKey>,
    ) -> Result<RegistrationOutcome, UpdateError> {
        let mut secondaries = self
            .secondaries
            .write()
            .map_err(|_| UpdateError::poisoned("secondary registry"))?;

        let outcome = match secondaries.get_mut(&serial) {
            None => RegistrationOutcome::New,
            Some(record) => match (record.public_key, public_key) {
                (Some(known), Some(offered)) if known != offered => {
                    return Err(UpdateError::IdentityConflict(serial.0));
                }
                (None, Some(offered)) => {
                    record.public_key = Some(offered);
                    return Ok(RegistrationOutcome::Replaced);
                }
                _ => return Ok(RegistrationOutcome::Unchanged),
            },
        };

        info!(ecu_serial = %serial, has_key = public_key.is_some(), "attached Secondary");
        secondaries.insert(
            serial.clone(),
            SecondaryRecord {
                ecu_serial: serial,
                public_key,
                registered_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    pub fn is_registered(&self, serial: &EcuSerial) -> Result<bool, UpdateError> {
        Ok(self.get(serial)?.is_some())
    }

    pub fn get(&self, serial: &EcuSerial) -> Result<Option<SecondaryRecord>, UpdateError> {
        let secondaries = self
            .secondaries
            .read()
            .map_err(|_| UpdateError::poisoned("secondary registry"))?;
        Ok(secondaries.get(serial).cloned())
    }

    pub fn serials(&self) -> Result<Vec<EcuSerial>, UpdateError> {
        let secondaries = self
            .secondaries
            .read()
            .map_err(|_| UpdateError::poisoned("secondary registry"))?;
        let mut serials: Vec<EcuSerial> = secondaries.keys().cloned().collect();
        serials.sort();
        Ok(serials)
    }

    /// Panics on another thread while holding the write lock.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = self.secondaries.write();
                    panic!("poisoning the secondary registry");
                })
                .join();
        });
    }
}
