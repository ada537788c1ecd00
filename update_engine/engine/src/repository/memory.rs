//! In-memory repository used by tests and by the `ecu` CLI, which loads one
//! from a JSON snapshot file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use tracing::debug;

use crate::jail::confine;
use crate::repository::{RepositoryError, Updater};
use crate::types::{FileInfo, TargetInfo};

/// A named source of image bytes, keyed by target filepath.
#[derive(Debug, Clone, Default)]
pub struct Mirror {
    pub name: String,
    pub files: BTreeMap<String, Vec<u8>>,
}

impl Mirror {
    pub fn new(name: impl Into<String>) -> Self {
        Mirror {
            name: name.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, filepath: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(filepath.into(), content.into());
        self
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    /// Insertion order is listing order.
    targets: Vec<TargetInfo>,
    mirrors: Vec<Mirror>,
    /// Filepaths whose metadata fails verification.
    untrusted: BTreeSet<String>,
    refreshed: bool,
}

pub struct MemoryRepository {
    name: String,
    state: RwLock<RepositoryState>,
}

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    name: String,
    #[serde(default)]
    targets: Vec<TargetInfo>,
    #[serde(default)]
    mirrors: Vec<SnapshotMirror>,
}

#[derive(Debug, Deserialize)]
struct SnapshotMirror {
    name: String,
    /// Directory holding the image files, relative to the snapshot file.
    dir: PathBuf,
}

impl MemoryRepository {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryRepository {
            name: name.into(),
            state: RwLock::new(RepositoryState::default()),
        }
    }

    /// Loads `{name, targets: [...], mirrors: [{name, dir}]}`. Mirror files are
    /// read through the jail, so a snapshot cannot pull files from outside its
    /// mirror directories.
    pub fn from_snapshot_file(path: &Path) -> Result<Self, RepositoryError> {
        let raw = fs::read_to_string(path)?;
        let snapshot: SnapshotFile = serde_json::from_str(&raw).map_err(|e| {
            RepositoryError::MetadataVerification {
                repository: path.display().to_string(),
                reason: format!("malformed snapshot: {e}"),
            }
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let repository = MemoryRepository::new(snapshot.name);
        for entry in snapshot.mirrors {
            let dir = base.join(&entry.dir);
            let mut mirror = Mirror::new(entry.name);
            for target in &snapshot.targets {
                let Ok(file) = confine(target.relative_path(), &dir) else {
                    continue;
                };
                if let Ok(content) = fs::read(&file) {
                    mirror.files.insert(target.filepath.clone(), content);
                }
            }
            repository.add_mirror(mirror);
        }
        for target in snapshot.targets {
            repository.add_target(target);
        }
        Ok(repository)
    }

    /// Lists `target`, replacing any existing entry for the same filepath.
    pub fn add_target(&self, target: TargetInfo) {
        let mut state = self.write();
        match state.targets.iter_mut().find(|t| t.filepath == target.filepath) {
            Some(existing) => *existing = target,
            None => state.targets.push(target),
        }
    }

    /// Lists `content` under `filepath` and hosts it on the first mirror.
    pub fn publish(&self, filepath: &str, content: &[u8], custom: Option<serde_json::Value>) -> TargetInfo {
        let target = TargetInfo {
            filepath: filepath.to_string(),
            fileinfo: FileInfo::from_bytes(content),
            custom,
        };
        self.add_target(target.clone());
        let mut state = self.write();
        if state.mirrors.is_empty() {
            state.mirrors.push(Mirror::new(format!("{}-mirror", self.name)));
        }
        state.mirrors[0]
            .files
            .insert(filepath.to_string(), content.to_vec());
        target
    }

    pub fn add_mirror(&self, mirror: Mirror) {
        self.write().mirrors.push(mirror);
    }

    pub fn remove_target(&self, filepath: &str) {
        self.write().targets.retain(|t| t.filepath != filepath);
    }

    /// Makes metadata for `filepath` fail verification from now on.
    pub fn mark_untrusted(&self, filepath: &str) {
        self.write().untrusted.insert(filepath.to_string());
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RepositoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RepositoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn require_refreshed(&self, state: &RepositoryState) -> Result<(), RepositoryError> {
        if state.refreshed {
            Ok(())
        } else {
            Err(RepositoryError::MetadataVerification {
                repository: self.name.clone(),
                reason: "top-level metadata has not been refreshed".into(),
            })
        }
    }
}

impl Updater for MemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn refresh(&self) -> Result<(), RepositoryError> {
        self.write().refreshed = true;
        debug!(repository = %self.name, "refreshed top-level metadata");
        Ok(())
    }

    fn targets(&self) -> Result<Vec<TargetInfo>, RepositoryError> {
        let state = self.read();
        self.require_refreshed(&state)?;
        Ok(state
            .targets
            .iter()
            .filter(|t| !state.untrusted.contains(&t.filepath))
            .cloned()
            .collect())
    }

    fn target(&self, filepath: &str) -> Result<TargetInfo, RepositoryError> {
        let state = self.read();
        self.require_refreshed(&state)?;
        if state.untrusted.contains(filepath) {
            return Err(RepositoryError::MetadataVerification {
                repository: self.name.clone(),
                reason: format!("metadata delegating {filepath} is not trusted"),
            });
        }
        state
            .targets
            .iter()
            .find(|t| t.filepath == filepath)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownTarget {
                repository: self.name.clone(),
                filepath: filepath.to_string(),
            })
    }

    fn download_target(&self, target: &TargetInfo, destination: &Path) -> Result<(), RepositoryError> {
        let state = self.read();
        let mut mirror_errors = BTreeMap::new();

        for mirror in &state.mirrors {
            let Some(content) = mirror.files.get(&target.filepath) else {
                mirror_errors.insert(mirror.name.clone(), "not hosted".to_string());
                continue;
            };
            if let Err(reason) = target.fileinfo.check_content(content) {
                mirror_errors.insert(mirror.name.clone(), reason);
                continue;
            }
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(destination, content)?;
            debug!(repository = %self.name, mirror = %mirror.name, filepath = %target.filepath, "downloaded target");
            return Ok(());
        }

        if state.mirrors.is_empty() {
            mirror_errors.insert(self.name.clone(), "no mirrors configured".to_string());
        }
        Err(RepositoryError::NoWorkingMirror {
            repository: self.name.clone(),
            filepath: target.filepath.clone(),
            mirror_errors,
        })
    }
}
