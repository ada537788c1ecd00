//! Shared data types for the update engine: vehicle and ECU identifiers,
//! nonces, and target descriptors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::crypto::keys::PublicKey;
use crate::error::UpdateError;

/// Vehicle identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vin(pub String);

/// ECU serial, unique within a vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EcuSerial(pub String);

/// Single-use freshness token issued by a Secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(pub u64);

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EcuSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Vin {
    fn from(value: &str) -> Self {
        Vin(value.to_string())
    }
}

impl From<&str> for EcuSerial {
    fn from(value: &str) -> Self {
        EcuSerial(value.to_string())
    }
}

/// Hash algorithms this engine can check downloaded images against.
pub const SUPPORTED_HASHES: [&str; 2] = ["sha256", "sha512"];

/// Hashes and length of a target file. Two descriptors are consistent iff
/// this is equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileInfo {
    pub hashes: BTreeMap<String, String>,
    pub length: u64,
}

impl FileInfo {
    /// Computes sha256 and sha512 fileinfo for `content`.
    pub fn from_bytes(content: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), hex::encode(Sha256::digest(content)));
        hashes.insert("sha512".to_string(), hex::encode(Sha512::digest(content)));
        FileInfo {
            hashes,
            length: content.len() as u64,
        }
    }

    /// Checks `content` against the length and every listed hash.
    pub fn check_content(&self, content: &[u8]) -> Result<(), String> {
        if content.len() as u64 != self.length {
            return Err(format!(
                "length mismatch: expected {}, got {}",
                self.length,
                content.len()
            ));
        }
        for (algorithm, expected) in &self.hashes {
            let actual = match algorithm.as_str() {
                "sha256" => hex::encode(Sha256::digest(content)),
                "sha512" => hex::encode(Sha512::digest(content)),
                other => return Err(format!("unsupported hash algorithm {other}")),
            };
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(format!("{algorithm} mismatch"));
            }
        }
        Ok(())
    }

    pub fn check_schema(&self) -> Result<(), UpdateError> {
        if self.hashes.is_empty() {
            return Err(UpdateError::Schema("fileinfo lists no hashes".into()));
        }
        for (algorithm, digest) in &self.hashes {
            if algorithm.is_empty() || digest.is_empty() || hex::decode(digest).is_err() {
                return Err(UpdateError::Schema(format!(
                    "malformed {algorithm:?} digest {digest:?}"
                )));
            }
        }
        Ok(())
    }
}

/// A target as listed by one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetInfo {
    pub filepath: String,
    pub fileinfo: FileInfo,
    /// Per-repository metadata, excluded from consistency checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

impl TargetInfo {
    pub fn new(filepath: impl Into<String>, fileinfo: FileInfo) -> Self {
        TargetInfo {
            filepath: filepath.into(),
            fileinfo,
            custom: None,
        }
    }

    pub fn is_consistent_with(&self, other: &TargetInfo) -> bool {
        self.fileinfo == other.fileinfo
    }

    /// The filepath with any leading `/` removed, ready for confinement.
    pub fn relative_path(&self) -> &str {
        self.filepath.trim_start_matches('/')
    }

    /// Whether this target is the file named `filename`, with or without a leading `/`.
    pub fn is_file(&self, filename: &str) -> bool {
        self.relative_path() == filename.trim_start_matches('/')
    }

    pub fn check_schema(&self) -> Result<(), UpdateError> {
        if self.relative_path().is_empty() {
            return Err(UpdateError::Schema("target filepath is empty".into()));
        }
        self.fileinfo.check_schema()
    }
}

/// Identity bound at registration time and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<Vin>,
    pub ecu_serial: EcuSerial,
    pub public_key: PublicKey,
}
