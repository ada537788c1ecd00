//! Dual-repository target consensus.
//!
//! A directed target is trusted only when the Director and the Image
//! repository both resolve it and agree bit-for-bit on its fileinfo. The
//! `custom` field is ignored: the Director fills it with ECU assignments the
//! Image repository cannot know.

use tracing::{info, warn};

use crate::error::UpdateError;
use crate::repository::{RepositoryError, Updater};
use crate::types::{FileInfo, TargetInfo};

/// Per-target result. Expected per-item failures are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutcome {
    /// Both repositories agree. Carries the Director's descriptor.
    Agreed(TargetInfo),
    /// One side could not resolve the filepath.
    Unvalidated { filepath: String, reason: String },
    /// Both resolved it with different fileinfo.
    Mismatch {
        filepath: String,
        director: FileInfo,
        image: FileInfo,
    },
}

impl ConsensusOutcome {
    pub fn filepath(&self) -> &str {
        match self {
            ConsensusOutcome::Agreed(target) => &target.filepath,
            ConsensusOutcome::Unvalidated { filepath, .. }
            | ConsensusOutcome::Mismatch { filepath, .. } => filepath,
        }
    }

    /// The error signalled for this entry, if it failed.
    pub fn error(&self) -> Option<UpdateError> {
        match self {
            ConsensusOutcome::Agreed(_) => None,
            ConsensusOutcome::Unvalidated { filepath, reason } => Some(UpdateError::UnvalidatedTarget {
                filepath: filepath.clone(),
                reason: reason.clone(),
            }),
            ConsensusOutcome::Mismatch { filepath, .. } => Some(UpdateError::ConsensusMismatch {
                filepath: filepath.clone(),
            }),
        }
    }
}

/// Outcomes in the Director's order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsensusReport {
    pub outcomes: Vec<ConsensusOutcome>,
}

impl ConsensusReport {
    /// The Verified Target Set.
    pub fn verified_targets(&self) -> Vec<TargetInfo> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                ConsensusOutcome::Agreed(target) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<UpdateError> {
        self.outcomes.iter().filter_map(ConsensusOutcome::error).collect()
    }
}

/// Reconciles `directed` filepaths against both repositories, in order.
/// Never caches: call once per update cycle.
pub fn validate_consensus(directed: &[String], director: &dyn Updater, image: &dyn Updater) -> ConsensusReport {
    let outcomes = directed
        .iter()
        .map(|filepath| validate_one(filepath, director, image))
        .collect();
    let report = ConsensusReport { outcomes };

    info!(
        directed = directed.len(),
        verified = report.verified_targets().len(),
        "consensus validation complete"
    );
    report
}

fn validate_one(filepath: &str, director: &dyn Updater, image: &dyn Updater) -> ConsensusOutcome {
    let from_director = match director.target(filepath) {
        Ok(target) => target,
        Err(e) => return unvalidated(filepath, e),
    };
    let from_image = match image.target(filepath) {
        Ok(target) => target,
        Err(e) => return unvalidated(filepath, e),
    };

    if from_director.is_consistent_with(&from_image) {
        ConsensusOutcome::Agreed(from_director)
    } else {
        warn!(%filepath, "Director and Image repository disagree on fileinfo; skipping target");
        ConsensusOutcome::Mismatch {
            filepath: filepath.to_string(),
            director: from_director.fileinfo,
            image: from_image.fileinfo,
        }
    }
}

fn unvalidated(filepath: &str, error: RepositoryError) -> ConsensusOutcome {
    warn!(%filepath, %error, "directed target is not validated by both repositories; it will not be downloaded");
    ConsensusOutcome::Unvalidated {
        filepath: filepath.to_string(),
        reason: error.to_string(),
    }
}
