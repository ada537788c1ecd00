//! The Updater capability: one verified view of one metadata repository
//! (Director or Image). Signature chains, delegations and mirrors live behind
//! this trait.

pub mod memory;

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::types::TargetInfo;

pub use memory::{MemoryRepository, Mirror};

#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The repository's verified metadata does not list this target.
    #[error("{repository} does not list target {filepath}")]
    UnknownTarget { repository: String, filepath: String },
    /// Metadata failed the repository's own verification.
    #[error("{repository} metadata failed verification: {reason}")]
    MetadataVerification { repository: String, reason: String },
    /// Every mirror was unreachable or served an untrustworthy image.
    #[error("no working mirror in {repository} for {filepath}")]
    NoWorkingMirror {
        repository: String,
        filepath: String,
        mirror_errors: BTreeMap<String, String>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A repository client whose results have already passed the repository's
/// internal signature-chain verification.
pub trait Updater: Send + Sync {
    fn name(&self) -> &str;

    /// Updates top-level metadata (root, timestamp, snapshot, targets).
    fn refresh(&self) -> Result<(), RepositoryError>;

    /// Every target the repository's verified metadata lists, in listing order.
    fn targets(&self) -> Result<Vec<TargetInfo>, RepositoryError>;

    /// Verified descriptor for one filepath.
    fn target(&self, filepath: &str) -> Result<TargetInfo, RepositoryError>;

    /// Tries each mirror until one serves content matching `target.fileinfo`
    /// and writes it to `destination`, which the caller has already confined.
    fn download_target(&self, target: &TargetInfo, destination: &Path) -> Result<(), RepositoryError>;
}
