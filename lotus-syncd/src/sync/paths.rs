use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::key::SyncableKey;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("key is empty")]
    Empty,
    #[error("key contains unsupported component")]
    UnsupportedComponent,
    #[error("key ends with the reserved `{PARTIAL_SUFFIX}` suffix")]
    ReservedSuffix,
}

/// Suffix of in-progress downloads next to their target file.
pub const PARTIAL_SUFFIX: &str = ".partial";

pub fn payload_path_for(payload_root: &Path, key: &SyncableKey) -> PathBuf {
    // Keys are validated relative POSIX-like paths; map them under the root.
    let mut out = payload_root.to_path_buf();
    for part in key.as_str().split('/') {
        out.push(part);
    }
    out
}

/// Inverse of [`payload_path_for`]. Transfer leftovers (`*.partial`) and
/// paths outside the root have no key, since neither is a valid key.
pub fn key_for_path(payload_root: &Path, path: &Path) -> Option<SyncableKey> {
    let relative = path.strip_prefix(payload_root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    SyncableKey::new(parts.join("/")).ok()
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}{}",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default(),
        &PARTIAL_SUFFIX[1..]
    ))
}
