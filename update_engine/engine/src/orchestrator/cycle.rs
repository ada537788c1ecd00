//! One update cycle: refresh both repositories, fetch the Director's targets,
//! run consensus, and download each verified target into the jail.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::consensus::{ConsensusReport, validate_consensus};
use crate::error::UpdateError;
use crate::jail::confine;
use crate::repository::{RepositoryError, Updater};
use crate::types::TargetInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Downloaded { target: TargetInfo, path: PathBuf },
    Failed {
        filepath: String,
        mirror_errors: BTreeMap<String, String>,
    },
}

/// What happened to the ECU's own firmware this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareOutcome {
    /// No verified target names this ECU's firmware file.
    NotDirected,
    /// Downloaded and verified; the ECU now reports this fileinfo.
    Installed(TargetInfo),
    /// Both repositories agreed, but no mirror served a trustworthy image.
    /// Firmware was not updated.
    Rejected {
        filepath: String,
        mirror_errors: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone)]
pub struct UpdateCycleReport {
    pub cycle_id: Uuid,
    pub directed: Vec<TargetInfo>,
    pub consensus: ConsensusReport,
    pub downloads: Vec<DownloadOutcome>,
    pub firmware: FirmwareOutcome,
}

impl UpdateCycleReport {
    pub fn verified_targets(&self) -> Vec<TargetInfo> {
        self.consensus.verified_targets()
    }

    /// A valid terminal outcome, not an error.
    pub fn no_updates_required(&self) -> bool {
        self.verified_targets().is_empty()
    }
}

pub struct UpdateCycle<'a> {
    director: &'a dyn Updater,
    image: &'a dyn Updater,
    targets_dir: PathBuf,
    firmware_filename: &'a str,
}

impl<'a> UpdateCycle<'a> {
    pub fn new(
        director: &'a dyn Updater,
        image: &'a dyn Updater,
        targets_dir: impl Into<PathBuf>,
        firmware_filename: &'a str,
    ) -> Self {
        UpdateCycle {
            director,
            image,
            targets_dir: targets_dir.into(),
            firmware_filename,
        }
    }

    pub fn refresh_metadata(&self) -> Result<(), UpdateError> {
        self.director.refresh()?;
        self.image.refresh()?;
        Ok(())
    }

    /// The Director's instructions, not yet validated against the Image repository.
    pub fn fetch_directed_targets(&self) -> Result<Vec<TargetInfo>, UpdateError> {
        Ok(self.director.targets()?)
    }

    pub fn validate_consensus(&self, directed: &[TargetInfo]) -> ConsensusReport {
        let filepaths: Vec<String> = directed.iter().map(|t| t.filepath.clone()).collect();
        validate_consensus(&filepaths, self.director, self.image)
    }

    /// Downloads each verified target. A path escape aborts the cycle; mirror
    /// failures are recorded per target.
    pub fn download_verified(&self, verified: &[TargetInfo]) -> Result<Vec<DownloadOutcome>, UpdateError> {
        let mut outcomes = Vec::with_capacity(verified.len());
        for target in verified {
            let destination = confine(target.relative_path(), &self.targets_dir)?;
            if destination.exists() {
                fs::remove_file(&destination)?;
            }

            match self.download(target, &destination) {
                Ok(()) => {
                    info!(filepath = %target.filepath, "downloaded a trustworthy image");
                    outcomes.push(DownloadOutcome::Downloaded {
                        target: target.clone(),
                        path: destination,
                    });
                }
                Err(mirror_errors) => {
                    warn!(filepath = %target.filepath, ?mirror_errors, "no mirror provided a trustworthy image");
                    outcomes.push(DownloadOutcome::Failed {
                        filepath: target.filepath.clone(),
                        mirror_errors,
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Image repository first, then the Director.
    fn download(&self, target: &TargetInfo, destination: &Path) -> Result<(), BTreeMap<String, String>> {
        let mut mirror_errors = BTreeMap::new();
        for updater in [self.image, self.director] {
            match updater.download_target(target, destination) {
                Ok(()) => return Ok(()),
                Err(RepositoryError::NoWorkingMirror { mirror_errors: errors, .. }) => {
                    for (mirror, error) in errors {
                        mirror_errors.insert(format!("{}/{mirror}", updater.name()), error);
                    }
                }
                Err(other) => {
                    mirror_errors.insert(updater.name().to_string(), other.to_string());
                }
            }
        }
        Err(mirror_errors)
    }

    pub fn run(&self) -> Result<UpdateCycleReport, UpdateError> {
        let cycle_id = Uuid::new_v4();
        let _span = info_span!("update_cycle", %cycle_id).entered();

        self.refresh_metadata()?;
        let directed = self.fetch_directed_targets()?;
        if directed.is_empty() {
            info!("the Director lists no updates to install");
        }

        let consensus = self.validate_consensus(&directed);
        let verified = consensus.verified_targets();
        let downloads = self.download_verified(&verified)?;
        let firmware = self.firmware_outcome(&downloads);

        if verified.is_empty() {
            info!("no updates are required: the Director and Image repository did not agree on any");
        }

        Ok(UpdateCycleReport {
            cycle_id,
            directed,
            consensus,
            downloads,
            firmware,
        })
    }

    fn firmware_outcome(&self, downloads: &[DownloadOutcome]) -> FirmwareOutcome {
        if self.firmware_filename.is_empty() {
            return FirmwareOutcome::NotDirected;
        }
        for outcome in downloads {
            match outcome {
                DownloadOutcome::Downloaded { target, .. } if target.is_file(self.firmware_filename) => {
                    return FirmwareOutcome::Installed(target.clone());
                }
                DownloadOutcome::Failed { filepath, mirror_errors }
                    if filepath.trim_start_matches('/') == self.firmware_filename.trim_start_matches('/') =>
                {
                    warn!(%filepath, "firmware rejected: mirrors provided only untrustworthy images; not installed");
                    return FirmwareOutcome::Rejected {
                        filepath: filepath.clone(),
                        mirror_errors: mirror_errors.clone(),
                    };
                }
                _ => {}
            }
        }
        FirmwareOutcome::NotDirected
    }
}
