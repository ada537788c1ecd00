//! Primary ECU context: talks to both repositories, validates and collects
//! Secondary manifests, and reports the vehicle to the Director.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::config::EcuConfig;
use crate::crypto::keys::{EcuKey, PublicKey};
use crate::error::UpdateError;
use crate::manifest::{
    EcuManifest, ExpectedSigner, Signable, VehicleManifest, build_vehicle_manifest, verify,
};
use crate::nonce::NonceLedger;
use crate::orchestrator::cycle::{FirmwareOutcome, UpdateCycle, UpdateCycleReport};
use crate::registry::{RegistrationOutcome, SecondaryRegistry};
use crate::repository::Updater;
use crate::rpc::{RelayPayload, RpcRequest, Transport, call_expecting_ack};
use crate::timeserver::{TimeAttestation, TimeRequest, TimeServer};
use crate::types::{EcuSerial, Nonce, TargetInfo, Vin};

#[derive(Default)]
struct PrimaryInner {
    ledger: NonceLedger,
    ecu_manifests: BTreeMap<EcuSerial, Vec<Signable<EcuManifest>>>,
    last_vehicle_manifest: Option<Signable<VehicleManifest>>,
    last_cycle: Option<UpdateCycleReport>,
    firmware: Option<TargetInfo>,
}

pub struct PrimaryEcu {
    config: EcuConfig,
    key: EcuKey,
    director_repo: Arc<dyn Updater>,
    image_repo: Arc<dyn Updater>,
    timeserver: Arc<dyn TimeServer>,
    secondaries: SecondaryRegistry,
    inner: Mutex<PrimaryInner>,
    audit: AuditTracker,
}

impl PrimaryEcu {
    pub fn new(
        config: EcuConfig,
        key: EcuKey,
        director_repo: Arc<dyn Updater>,
        image_repo: Arc<dyn Updater>,
        timeserver: Arc<dyn TimeServer>,
    ) -> Self {
        PrimaryEcu {
            config,
            key,
            director_repo,
            image_repo,
            timeserver,
            secondaries: SecondaryRegistry::new(),
            inner: Mutex::new(PrimaryInner::default()),
            audit: AuditTracker::default(),
        }
    }

    pub fn vin(&self) -> &Vin {
        &self.config.vin
    }

    pub fn serial(&self) -> &EcuSerial {
        &self.config.ecu_serial
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn config(&self) -> &EcuConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditTracker {
        &self.audit
    }

    pub fn secondaries(&self) -> &SecondaryRegistry {
        &self.secondaries
    }

    /// Registers the Primary's own serial and key with the Director.
    pub async fn register_with_director(&self, director: &dyn Transport) -> Result<(), UpdateError> {
        call_expecting_ack(
            director,
            RpcRequest::RegisterEcuSerial {
                serial: self.config.ecu_serial.clone(),
                public_key: self.key.public_key(),
            },
        )
        .await?;
        self.audit.log(AuditRecord::new(
            AuditEventType::Registration,
            self.config.ecu_serial.to_string(),
            "registered with the Director",
        ));
        Ok(())
    }

    pub fn register_secondary(
        &self,
        serial: &EcuSerial,
        public_key: Option<PublicKey>,
    ) -> Result<RegistrationOutcome, UpdateError> {
        let outcome = self.secondaries.register_secondary(serial.clone(), public_key)?;
        if outcome != RegistrationOutcome::Unchanged {
            self.audit.log(AuditRecord::new(
                AuditEventType::Registration,
                serial.to_string(),
                format!("Secondary attached ({outcome:?})"),
            ));
        }
        Ok(outcome)
    }

    /// Records the nonce in `signed_request` as the one `serial` must present
    /// with its next manifest and returns a time attestation over it. The
    /// request must be signed by the Secondary's registered key; anything else
    /// leaves the expected nonce untouched.
    pub async fn request_time_attestation(
        &self,
        serial: &EcuSerial,
        signed_request: Value,
    ) -> Result<Signable<TimeAttestation>, UpdateError> {
        let nonce = match self.check_time_request(serial, signed_request) {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(%serial, error = %e, "refused time attestation request");
                self.audit.log(AuditRecord::new(
                    AuditEventType::TimeAttestation,
                    serial.to_string(),
                    format!("refused request: {e}"),
                ));
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        inner.ledger.expect(serial, nonce)?;
        let attestation = self.timeserver.attest(&[nonce])?;
        self.audit.log(AuditRecord::new(
            AuditEventType::TimeAttestation,
            serial.to_string(),
            format!("attested time {} for nonce {nonce}", attestation.signed.time),
        ));
        Ok(attestation)
    }

    fn check_time_request(&self, serial: &EcuSerial, signed_request: Value) -> Result<Nonce, UpdateError> {
        let record = self
            .secondaries
            .get(serial)?
            .ok_or_else(|| UpdateError::UnknownEcu(serial.to_string()))?;
        let request = Signable::<TimeRequest>::from_value(signed_request)?;
        if &request.signed.ecu_serial != serial {
            return Err(UpdateError::Schema(format!(
                "time request names ECU {} but was sent for {serial}",
                request.signed.ecu_serial
            )));
        }
        let public_key = record.public_key.ok_or_else(|| {
            UpdateError::Signature(format!("no public key is registered for Secondary {serial}"))
        })?;
        verify(&request, ExpectedSigner::Key(&public_key))?;
        Ok(request.signed.nonce)
    }

    /// Validates a Secondary's submission and keeps it for the next vehicle
    /// manifest. The nonce is consumed only once the signature checks out, so
    /// a forged submission cannot burn a legitimate ECU's nonce.
    pub async fn register_ecu_manifest(
        &self,
        vin: &Vin,
        serial: &EcuSerial,
        nonce: Nonce,
        signed_manifest: Value,
    ) -> Result<(), UpdateError> {
        let result = self.check_and_store(vin, serial, nonce, signed_manifest).await;
        match &result {
            Ok(()) => {
                info!(%serial, %nonce, "accepted ECU manifest");
                self.audit.log(AuditRecord::new(
                    AuditEventType::ManifestAccepted,
                    serial.to_string(),
                    format!("ECU manifest with nonce {nonce}"),
                ));
            }
            Err(e) => {
                error!(%serial, %nonce, error = %e, "rejected ECU manifest");
                self.audit.log(AuditRecord::new(
                    AuditEventType::ManifestRejected,
                    serial.to_string(),
                    e.to_string(),
                ));
            }
        }
        result
    }

    async fn check_and_store(
        &self,
        vin: &Vin,
        serial: &EcuSerial,
        nonce: Nonce,
        signed_manifest: Value,
    ) -> Result<(), UpdateError> {
        if vin != &self.config.vin {
            return Err(UpdateError::Schema(format!(
                "manifest for vehicle {vin} submitted to the Primary of vehicle {}",
                self.config.vin
            )));
        }
        let manifest = Signable::<EcuManifest>::from_value(signed_manifest)?;

        let record = self
            .secondaries
            .get(serial)?
            .ok_or_else(|| UpdateError::UnknownEcu(serial.to_string()))?;
        if &manifest.signed.ecu_serial != serial {
            return Err(UpdateError::Schema(format!(
                "manifest body names ECU {} but was submitted by {serial}",
                manifest.signed.ecu_serial
            )));
        }
        if manifest.signed.nonce != nonce {
            return Err(UpdateError::StaleNonce(format!(
                "manifest is bound to nonce {} but was submitted with {nonce}",
                manifest.signed.nonce
            )));
        }
        let public_key = record.public_key.ok_or_else(|| {
            UpdateError::Signature(format!("no public key is registered for Secondary {serial}"))
        })?;
        verify(&manifest, ExpectedSigner::Key(&public_key))?;

        let mut inner = self.inner.lock().await;
        inner.ledger.consume(serial, nonce)?;
        inner.ecu_manifests.entry(serial.clone()).or_default().push(manifest);
        Ok(())
    }

    /// Signs a vehicle manifest over every ECU manifest collected since the
    /// last successful submission to the Director.
    pub async fn generate_signed_vehicle_manifest(&self) -> Result<Signable<VehicleManifest>, UpdateError> {
        let mut inner = self.inner.lock().await;
        let manifests: Vec<_> = inner.ecu_manifests.values().flatten().cloned().collect();
        let vehicle_manifest =
            build_vehicle_manifest(&self.config.vin, &self.config.ecu_serial, manifests, &self.key)?;
        inner.last_vehicle_manifest = Some(vehicle_manifest.clone());
        Ok(vehicle_manifest)
    }

    /// Sends the last generated vehicle manifest to the Director. On
    /// acceptance the collected ECU manifests are cleared.
    pub async fn submit_vehicle_manifest(&self, director: &dyn Transport) -> Result<(), UpdateError> {
        let mut inner = self.inner.lock().await;
        let manifest = match &inner.last_vehicle_manifest {
            Some(manifest) => manifest.clone(),
            None => return Err(UpdateError::InvalidState("no vehicle manifest has been generated".into())),
        };
        self.send_vehicle_manifest(director, manifest.to_value()?).await?;

        for (serial, reported) in &manifest.signed.ecu_version_manifests {
            if let Some(pending) = inner.ecu_manifests.get_mut(serial) {
                pending.retain(|m| !reported.contains(m));
            }
        }
        inner.ecu_manifests.retain(|_, pending| !pending.is_empty());
        Ok(())
    }

    /// Sends an arbitrary signed vehicle manifest, as produced elsewhere.
    pub async fn submit_signed_vehicle_manifest(
        &self,
        director: &dyn Transport,
        signed_manifest: Value,
    ) -> Result<(), UpdateError> {
        self.send_vehicle_manifest(director, signed_manifest).await
    }

    async fn send_vehicle_manifest(&self, director: &dyn Transport, signed_manifest: Value) -> Result<(), UpdateError> {
        let result = call_expecting_ack(
            director,
            RpcRequest::SubmitVehicleManifest {
                vin: self.config.vin.clone(),
                serial: self.config.ecu_serial.clone(),
                signed_manifest,
            },
        )
        .await;
        match &result {
            Ok(()) => info!(vin = %self.config.vin, "vehicle manifest accepted by the Director"),
            Err(e) => error!(vin = %self.config.vin, error = %e, "vehicle manifest rejected by the Director"),
        }
        result
    }

    pub async fn pending_ecu_manifests(&self) -> usize {
        self.inner.lock().await.ecu_manifests.values().map(Vec::len).sum()
    }

    pub async fn last_vehicle_manifest(&self) -> Option<Signable<VehicleManifest>> {
        self.inner.lock().await.last_vehicle_manifest.clone()
    }

    pub async fn last_cycle(&self) -> Option<UpdateCycleReport> {
        self.inner.lock().await.last_cycle.clone()
    }

    pub async fn firmware(&self) -> Option<TargetInfo> {
        self.inner.lock().await.firmware.clone()
    }

    /// Refresh, consensus and confined download into the Primary's jail.
    pub async fn update_cycle(&self) -> Result<UpdateCycleReport, UpdateError> {
        let cycle = UpdateCycle::new(
            self.director_repo.as_ref(),
            self.image_repo.as_ref(),
            self.config.targets_dir(),
            &self.config.firmware_filename,
        );
        let report = cycle.run()?;

        for failure in report.consensus.failures() {
            warn!(error = %failure, "target failed consensus");
            self.audit.log(AuditRecord::new(
                AuditEventType::ConsensusFailure,
                self.config.ecu_serial.to_string(),
                failure.to_string(),
            ));
        }

        let mut inner = self.inner.lock().await;
        match &report.firmware {
            FirmwareOutcome::Installed(target) => inner.firmware = Some(target.clone()),
            FirmwareOutcome::Rejected { filepath, .. } => {
                self.audit.log(AuditRecord::new(
                    AuditEventType::FirmwareRejected,
                    self.config.ecu_serial.to_string(),
                    format!("{filepath} not installed"),
                ));
            }
            FirmwareOutcome::NotDirected => {}
        }
        inner.last_cycle = Some(report.clone());
        Ok(report)
    }

    /// Pushes metadata or an image to an attached Secondary.
    pub async fn relay_to_secondary(
        &self,
        serial: &EcuSerial,
        secondary: &dyn Transport,
        payload: RelayPayload,
    ) -> Result<(), UpdateError> {
        if !self.secondaries.is_registered(serial)? {
            return Err(UpdateError::UnknownEcu(serial.to_string()));
        }
        let description = format!("{:?} {}", payload.kind, payload.filepath);
        call_expecting_ack(secondary, RpcRequest::RelayFromPrimary { payload }).await?;
        self.audit.log(AuditRecord::new(
            AuditEventType::Relay,
            serial.to_string(),
            format!("relayed {description}"),
        ));
        Ok(())
    }
}
