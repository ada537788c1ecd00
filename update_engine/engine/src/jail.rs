//! Download-path confinement.
//!
//! Target filepaths come from repositories and are attacker-influenced. Every
//! filesystem write derived from one goes through [`confine`] first.

use std::env;
use std::path::{Component, Path, PathBuf};

use crate::error::UpdateError;

/// Resolves `relative_path` against `base_dir` and returns the absolute
/// result, or [`UpdateError::PathEscape`] when it does not land strictly
/// inside `base_dir`.
///
/// Pure path arithmetic: symlinks are not followed and nothing is created.
pub fn confine(relative_path: &str, base_dir: &Path) -> Result<PathBuf, UpdateError> {
    let base = absolute(base_dir)?;
    let resolved = normalize(&base.join(relative_path));

    // Path::starts_with compares whole components, so "/a/targets2" is not
    // inside "/a/targets".
    if resolved == base || !resolved.starts_with(&base) {
        return Err(UpdateError::PathEscape {
            path: relative_path.to_string(),
            base: base.display().to_string(),
        });
    }
    Ok(resolved)
}

fn absolute(path: &Path) -> Result<PathBuf, UpdateError> {
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(&env::current_dir()?.join(path)))
    }
}

/// Lexically removes `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
