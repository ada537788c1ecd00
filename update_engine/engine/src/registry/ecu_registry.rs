/// This module will:
///     Bind ECU serials to their public keys at the Director
///     Hand out keys for manifest authorship checks
///     Refuse key substitution after first registration (unless configured to overwrite)

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::keys::PublicKey;
use crate::error::UpdateError;
use crate::manifest::KeyRing;
use crate::registry::RegistrationOutcome;
use crate::types::{EcuIdentity, EcuSerial, Vin};

/// What to do when a serial is registered again with a different key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationPolicy {
    /// Idempotent: the first key bound to a serial is kept and a conflicting
    /// key is refused.
    #[default]
    FirstWins,
    /// Every registration replaces the stored key. Whoever controls the
    /// registration channel can take over an identity.
    Overwrite,
}

impl fmt::Display for RegistrationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationPolicy::FirstWins => f.write_str("first-wins"),
            RegistrationPolicy::Overwrite => f.write_str("overwrite"),
        }
    }
}

impl FromStr for RegistrationPolicy {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-wins" => Ok(RegistrationPolicy::FirstWins),
            "overwrite" => Ok(RegistrationPolicy::Overwrite),
            other => Err(UpdateError::Config(format!(
                "unknown registration policy {other:?} (expected first-wins or overwrite)"
            ))),
        }
    }
}

/// Director-side registry (thread-safe)
#[derive(Clone)]
pub struct EcuRegistry {
    policy: RegistrationPolicy,
    ecus: Arc<RwLock<HashMap<EcuSerial, EcuIdentity>>>,
}

impl EcuRegistry {
    pub fn new(policy: RegistrationPolicy) -> Self {
        EcuRegistry {
            policy,
            ecus: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    /// Bind `serial` to `public_key`.
    pub fn register_ecu_serial(
        &self,
        serial: EcuSerial,
        public_key: PublicKey,
        vin: Option<Vin>,
    ) -> Result<RegistrationOutcome, UpdateError> {
        let mut ecus = self
            .ecus
            .write()
            .map_err(|_| UpdateError::poisoned("ECU registry"))?;

        let outcome = match ecus.get(&serial) {
            None => RegistrationOutcome::New,
            Some(existing) if existing.public_key == public_key => {
                return Ok(RegistrationOutcome::Unchanged);
            }
            Some(_) if self.policy == RegistrationPolicy::FirstWins => {
                warn!(ecu_serial = %serial, "refused re-registration with a different key");
                return Err(UpdateError::IdentityConflict(serial.0));
            }
            Some(_) => {
                warn!(ecu_serial = %serial, "overwriting registered ECU key");
                RegistrationOutcome::Replaced
            }
        };

        info!(ecu_serial = %serial, keyid = %public_key.keyid(), "registered ECU");
        ecus.insert(
            serial.clone(),
            EcuIdentity {
                vin,
                ecu_serial: serial,
                public_key,
            },
        );
        Ok(outcome)
    }

    pub fn get_identity(&self, serial: &EcuSerial) -> Result<Option<EcuIdentity>, UpdateError> {
        let ecus = self
            .ecus
            .read()
            .map_err(|_| UpdateError::poisoned("ECU registry"))?;
        Ok(ecus.get(serial).cloned())
    }

    /// Public key for `serial`, or [`UpdateError::UnknownEcu`].
    pub fn public_key(&self, serial: &EcuSerial) -> Result<PublicKey, UpdateError> {
        self.get_identity(serial)?
            .map(|identity| identity.public_key)
            .ok_or_else(|| UpdateError::UnknownEcu(serial.0.clone()))
    }

    pub fn keyring(&self) -> Result<KeyRing, UpdateError> {
        let ecus = self
            .ecus
            .read()
            .map_err(|_| UpdateError::poisoned("ECU registry"))?;
        Ok(ecus.values().map(|identity| identity.public_key).collect())
    }

    pub fn len(&self) -> Result<usize, UpdateError> {
        let ecus = self
            .ecus
            .read()
            .map_err(|_| UpdateError::poisoned("ECU registry"))?;
        Ok(ecus.len())
    }

    pub fn is_empty(&self) -> Result<bool, UpdateError> {
        Ok(self.len()? == 0)
    }

    /// Panics on another thread while holding the write lock.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = self.ecus.write();
                    panic!("poisoning the ECU registry");
                })
                .join();
        });
    }
}
