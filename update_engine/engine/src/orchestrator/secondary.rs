//! Secondary ECU context: identity, nonce pair, clock, installed firmware and
//! the most recent manifest, all behind one lock.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::config::EcuConfig;
use crate::crypto::keys::{EcuKey, PublicKey};
use crate::error::UpdateError;
use crate::manifest::{EcuManifest, Signable, build_ecu_manifest};
use crate::nonce::{NonceManager, NoncePair};
use crate::orchestrator::cycle::{FirmwareOutcome, UpdateCycle, UpdateCycleReport};
use crate::repository::Updater;
use crate::rpc::{RelayPayload, RpcRequest, RpcResponse, Transport, call_expecting_ack};
use crate::timeserver::{TimeAttestation, build_time_request, verify_attestation};
use crate::types::{EcuSerial, Nonce, TargetInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryState {
    Uninitialized,
    Registered,
    TimeSynced,
    ManifestReady,
    Submitted,
}

impl fmt::Display for SecondaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecondaryState::Uninitialized => "UNINITIALIZED",
            SecondaryState::Registered => "REGISTERED",
            SecondaryState::TimeSynced => "TIME_SYNCED",
            SecondaryState::ManifestReady => "MANIFEST_READY",
            SecondaryState::Submitted => "SUBMITTED",
        };
        f.write_str(name)
    }
}

struct SecondaryInner {
    state: SecondaryState,
    nonces: NonceManager,
    clock: DateTime<Utc>,
    // Nonce covered by the last verified time attestation.
    attested: Option<Nonce>,
    firmware: TargetInfo,
    attacks_detected: String,
    last_manifest: Option<Signable<EcuManifest>>,
}

pub struct SecondaryEcu {
    config: EcuConfig,
    key: EcuKey,
    timeserver_key: PublicKey,
    director_repo: Arc<dyn Updater>,
    image_repo: Arc<dyn Updater>,
    // Held for the whole of build-then-submit, not just the mutation.
    inner: Mutex<SecondaryInner>,
    inbox: StdMutex<Vec<RelayPayload>>,
    audit: AuditTracker,
}

impl SecondaryEcu {
    /// `factory_firmware` is the fileinfo reported until an update installs.
    pub fn new(
        config: EcuConfig,
        key: EcuKey,
        timeserver_key: PublicKey,
        director_repo: Arc<dyn Updater>,
        image_repo: Arc<dyn Updater>,
        factory_firmware: TargetInfo,
    ) -> Self {
        SecondaryEcu {
            config,
            key,
            timeserver_key,
            director_repo,
            image_repo,
            inner: Mutex::new(SecondaryInner {
                state: SecondaryState::Uninitialized,
                nonces: NonceManager::issue(),
                clock: Utc::now(),
                attested: None,
                firmware: factory_firmware,
                attacks_detected: String::new(),
                last_manifest: None,
            }),
            inbox: StdMutex::new(Vec::new()),
            audit: AuditTracker::default(),
        }
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

    pub async fn state(&self) -> SecondaryState {
        self.inner.lock().await.state
    }

    pub async fn current_nonce(&self) -> Nonce {
        self.inner.lock().await.nonces.current_nonce()
    }

    pub async fn nonce_pair(&self) -> NoncePair {
        self.inner.lock().await.nonces.pair()
    }

    pub async fn firmware(&self) -> TargetInfo {
        self.inner.lock().await.firmware.clone()
    }

    pub async fn clock(&self) -> DateTime<Utc> {
        self.inner.lock().await.clock
    }

    pub async fn attacks_detected(&self) -> String {
        self.inner.lock().await.attacks_detected.clone()
    }

    pub async fn last_manifest(&self) -> Option<Signable<EcuManifest>> {
        self.inner.lock().await.last_manifest.clone()
    }

    /// Registers with the Primary and the Director and loads both
    /// repositories' roots of trust. Only valid once, from `UNINITIALIZED`.
    pub async fn clean_slate(&self, primary: &dyn Transport, director: &dyn Transport) -> Result<(), UpdateError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SecondaryState::Uninitialized {
            return Err(UpdateError::InvalidState(format!(
                "clean slate requested in state {}",
                inner.state
            )));
        }

        let serial = self.config.ecu_serial.clone();
        let public_key = self.key.public_key();

        call_expecting_ack(
            primary,
            RpcRequest::RegisterNewSecondary {
                serial: serial.clone(),
                public_key: Some(public_key),
            },
        )
        .await?;
        call_expecting_ack(
            director,
            RpcRequest::RegisterEcuSerial {
                serial: serial.clone(),
                public_key,
            },
        )
        .await?;

        self.director_repo.refresh()?;
        self.image_repo.refresh()?;

        inner.state = SecondaryState::Registered;
        self.audit.log(AuditRecord::new(
            AuditEventType::Registration,
            serial.to_string(),
            format!("registered with Primary and Director as keyid {}", public_key.keyid()),
        ));
        Ok(())
    }

    /// Asks the Primary for a time attestation over the current nonce and
    /// advances the clock to the attested time.
    pub async fn update_time(&self, primary: &dyn Transport) -> Result<DateTime<Utc>, UpdateError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SecondaryState::Uninitialized {
            return Err(UpdateError::InvalidState("time sync before registration".into()));
        }
        let time = self.attest_locked(&mut inner, primary).await?;
        inner.state = SecondaryState::TimeSynced;
        Ok(time)
    }

    async fn attest_locked(&self, inner: &mut SecondaryInner, primary: &dyn Transport) -> Result<DateTime<Utc>, UpdateError> {
        let nonce = inner.nonces.current_nonce();
        let signed_request = build_time_request(&self.config.ecu_serial, nonce, &self.key)?.to_value()?;
        let response = primary
            .call(RpcRequest::RequestTimeAttestation {
                serial: self.config.ecu_serial.clone(),
                signed_request,
            })
            .await?;
        let value = match response {
            RpcResponse::TimeAttestation(value) => value,
            RpcResponse::Fault(fault) => return Err(fault.into_error()),
            RpcResponse::Ack => {
                return Err(UpdateError::Transport(
                    "Primary acknowledged a time attestation request without an attestation".into(),
                ));
            }
        };

        let attestation = Signable::<TimeAttestation>::from_value(value)?;
        let time = match verify_attestation(&attestation, &self.timeserver_key, nonce, inner.clock) {
            Ok(time) => time,
            Err(e) => {
                self.record_attack(inner, &format!("rejected time attestation: {e}"));
                return Err(e);
            }
        };

        inner.clock = time;
        inner.attested = Some(nonce);
        self.audit.log(AuditRecord::new(
            AuditEventType::TimeAttestation,
            self.config.ecu_serial.to_string(),
            format!("clock set to {time} for nonce {nonce}"),
        ));
        Ok(time)
    }

    /// Signs a manifest over the installed firmware bound to the current nonce.
    pub async fn generate_signed_ecu_manifest(&self) -> Result<Signable<EcuManifest>, UpdateError> {
        let mut inner = self.inner.lock().await;
        self.generate_locked(&mut inner)
    }

    fn generate_locked(&self, inner: &mut SecondaryInner) -> Result<Signable<EcuManifest>, UpdateError> {
        if !matches!(inner.state, SecondaryState::TimeSynced | SecondaryState::ManifestReady) {
            return Err(UpdateError::InvalidState(format!(
                "manifest generation requires a time sync first (state {})",
                inner.state
            )));
        }
        let manifest = self.build_manifest(inner)?;
        inner.last_manifest = Some(manifest.clone());
        inner.state = SecondaryState::ManifestReady;
        Ok(manifest)
    }

    fn build_manifest(&self, inner: &SecondaryInner) -> Result<Signable<EcuManifest>, UpdateError> {
        build_ecu_manifest(
            &self.config.ecu_serial,
            &inner.firmware,
            &inner.attacks_detected,
            inner.nonces.current_nonce(),
            &self.key,
        )
    }

    /// Submits the most recently generated manifest.
    pub async fn submit_ecu_manifest(&self, primary: &dyn Transport) -> Result<(), UpdateError> {
        let mut inner = self.inner.lock().await;
        let manifest = match &inner.last_manifest {
            Some(manifest) if manifest.signed.nonce == inner.nonces.current_nonce() => manifest.to_value()?,
            Some(manifest) => {
                return Err(UpdateError::InvalidState(format!(
                    "manifest is bound to nonce {} but the current nonce is {}",
                    manifest.signed.nonce,
                    inner.nonces.current_nonce()
                )));
            }
            None => return Err(UpdateError::InvalidState("no manifest has been generated".into())),
        };
        self.submit_locked(&mut inner, primary, manifest).await
    }

    /// Submits an arbitrary signed payload under the current nonce. The
    /// regular path is [`SecondaryEcu::submit_ecu_manifest`]; this one lets a
    /// caller present a manifest it obtained elsewhere.
    pub async fn submit_signed_manifest(&self, primary: &dyn Transport, signed_manifest: Value) -> Result<(), UpdateError> {
        let mut inner = self.inner.lock().await;
        self.submit_locked(&mut inner, primary, signed_manifest).await
    }

    /// Builds and submits without releasing the lock in between.
    pub async fn generate_and_submit(&self, primary: &dyn Transport) -> Result<(), UpdateError> {
        let mut inner = self.inner.lock().await;
        let manifest = self.generate_locked(&mut inner)?.to_value()?;
        self.submit_locked(&mut inner, primary, manifest).await
    }

    async fn submit_locked(
        &self,
        inner: &mut SecondaryInner,
        primary: &dyn Transport,
        signed_manifest: Value,
    ) -> Result<(), UpdateError> {
        if inner.state != SecondaryState::ManifestReady {
            return Err(UpdateError::InvalidState(format!(
                "submission requires a generated manifest (state {})",
                inner.state
            )));
        }

        let nonce = inner.nonces.current_nonce();
        // The Primary only expects a nonce it has attested for us.
        if inner.attested != Some(nonce) {
            self.attest_locked(inner, primary).await?;
        }

        let result = call_expecting_ack(
            primary,
            RpcRequest::SubmitEcuManifest {
                vin: self.config.vin.clone(),
                serial: self.config.ecu_serial.clone(),
                nonce,
                signed_manifest,
            },
        )
        .await;

        match result {
            Ok(()) => {
                inner.nonces.mark_consumed();
                inner.nonces.rotate()?;
                inner.state = SecondaryState::Submitted;
                info!(serial = %self.config.ecu_serial, %nonce, "ECU manifest accepted by the Primary");
                self.audit.log(AuditRecord::new(
                    AuditEventType::ManifestAccepted,
                    self.config.ecu_serial.to_string(),
                    format!("manifest with nonce {nonce} accepted"),
                ));
                Ok(())
            }
            Err(e) if e.is_definitive_rejection() => {
                // The round is over; the retry goes out under the next nonce,
                // re-signed and re-attested.
                inner.nonces.mark_consumed();
                inner.nonces.rotate()?;
                match self.build_manifest(inner) {
                    Ok(manifest) => inner.last_manifest = Some(manifest),
                    Err(_) => {
                        inner.last_manifest = None;
                        inner.state = SecondaryState::TimeSynced;
                    }
                }
                error!(serial = %self.config.ecu_serial, %nonce, error = %e, "ECU manifest rejected by the Primary");
                self.audit.log(AuditRecord::new(
                    AuditEventType::ManifestRejected,
                    self.config.ecu_serial.to_string(),
                    format!("manifest with nonce {nonce} rejected: {e}"),
                ));
                Err(e)
            }
            Err(e) => {
                warn!(serial = %self.config.ecu_serial, %nonce, error = %e, "submission did not complete; nonce kept for retry");
                Err(e)
            }
        }
    }

    /// Full-verification update cycle. A verified firmware image becomes the
    /// fileinfo reported in later manifests.
    pub async fn update_cycle(&self) -> Result<UpdateCycleReport, UpdateError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SecondaryState::Uninitialized {
            return Err(UpdateError::InvalidState("update cycle before registration".into()));
        }

        let cycle = UpdateCycle::new(
            self.director_repo.as_ref(),
            self.image_repo.as_ref(),
            self.config.targets_dir(),
            &self.config.firmware_filename,
        );
        let report = cycle.run()?;

        for failure in report.consensus.failures() {
            self.audit.log(AuditRecord::new(
                AuditEventType::ConsensusFailure,
                self.config.ecu_serial.to_string(),
                failure.to_string(),
            ));
        }

        match &report.firmware {
            FirmwareOutcome::Installed(target) => {
                info!(filepath = %target.filepath, "installed firmware");
                inner.firmware = target.clone();
            }
            FirmwareOutcome::Rejected { filepath, .. } => {
                self.record_attack(
                    &mut inner,
                    &format!("firmware {filepath} rejected: no mirror provided a trustworthy image"),
                );
                self.audit.log(AuditRecord::new(
                    AuditEventType::FirmwareRejected,
                    self.config.ecu_serial.to_string(),
                    format!("{filepath} not installed"),
                ));
            }
            FirmwareOutcome::NotDirected => {}
        }
        Ok(report)
    }

    /// Stores a payload pushed by the Primary.
    pub fn receive_relay(&self, payload: RelayPayload) -> Result<(), UpdateError> {
        info!(serial = %self.config.ecu_serial, filepath = %payload.filepath, kind = ?payload.kind, "received relay from Primary");
        self.audit.log(AuditRecord::new(
            AuditEventType::Relay,
            self.config.ecu_serial.to_string(),
            format!("{:?} {} ({} bytes)", payload.kind, payload.filepath, payload.content.len()),
        ));
        self.inbox
            .lock()
            .map_err(|_| UpdateError::poisoned("relay inbox"))?
            .push(payload);
        Ok(())
    }

    pub fn inbox(&self) -> Result<Vec<RelayPayload>, UpdateError> {
        Ok(self
            .inbox
            .lock()
            .map_err(|_| UpdateError::poisoned("relay inbox"))?
            .clone())
    }

    fn record_attack(&self, inner: &mut SecondaryInner, description: &str) {
        if !inner.attacks_detected.is_empty() {
            inner.attacks_detected.push_str("; ");
        }
        inner.attacks_detected.push_str(description);
    }
}
