//! Centralized update engine error types.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::repository::RepositoryError;

/// Coarse classification used by callers to decide what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Schema or signature mismatch. Always rejected, never retried.
    Validation,
    /// Director and Image repository disagree about one target.
    Consensus,
    /// Mirrors, timeouts, unreachable peers.
    Transport,
    /// Path escapes, identity conflicts, out-of-order nonce rotation.
    Integrity,
    /// Stale or replayed nonces, time going backwards.
    Freshness,
    /// Local failures (I/O, serialization, poisoned locks, configuration).
    Internal,
}

#[derive(Error, Debug)]
pub enum UpdateError {
    /// A repository-supplied path resolved outside its jail.
    #[error("path {path:?} escapes {base:?}")]
    PathEscape { path: String, base: String },
    /// An ECU serial is already bound to a different public key.
    #[error("identity conflict: ECU {0} is already registered with a different key")]
    IdentityConflict(String),
    /// Nonce rotation attempted before the current nonce was consumed.
    #[error("nonce rotation out of order: current nonce has not been consumed")]
    RotationOutOfOrder,
    #[error("stale nonce: {0}")]
    StaleNonce(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("target {filepath} is not validated by both repositories: {reason}")]
    UnvalidatedTarget { filepath: String, reason: String },
    #[error("Director and Image repository disagree on fileinfo for {filepath}")]
    ConsensusMismatch { filepath: String },
    /// Every mirror produced an untrustworthy or unreachable artifact.
    #[error("no working mirror for {filepath}: {mirror_errors:?}")]
    NoWorkingMirror {
        filepath: String,
        mirror_errors: BTreeMap<String, String>,
    },
    #[error("unknown ECU: {0}")]
    UnknownEcu(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("time regression: {0}")]
    TimeRegression(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl UpdateError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            UpdateError::Schema(_) | UpdateError::Signature(_) | UpdateError::UnknownEcu(_) => {
                ErrorCategory::Validation
            }
            UpdateError::UnvalidatedTarget { .. } | UpdateError::ConsensusMismatch { .. } => {
                ErrorCategory::Consensus
            }
            UpdateError::NoWorkingMirror { .. }
            | UpdateError::Transport(_)
            | UpdateError::Timeout(_) => ErrorCategory::Transport,
            UpdateError::PathEscape { .. }
            | UpdateError::IdentityConflict(_)
            | UpdateError::RotationOutOfOrder => ErrorCategory::Integrity,
            UpdateError::StaleNonce(_) | UpdateError::TimeRegression(_) => ErrorCategory::Freshness,
            UpdateError::InvalidState(_)
            | UpdateError::Config(_)
            | UpdateError::Repository(_)
            | UpdateError::Io(_)
            | UpdateError::Serde(_)
            | UpdateError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// True when a remote party definitively answered, as opposed to the call
    /// never completing. Only definitive answers consume a nonce.
    pub fn is_definitive_rejection(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation | ErrorCategory::Freshness | ErrorCategory::Integrity
        )
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        UpdateError::Internal(format!("{what} lock poisoned"))
    }
}
