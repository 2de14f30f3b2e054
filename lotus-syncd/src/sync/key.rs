use std::fmt;

use serde::{Deserialize, Serialize};

use super::paths::{PARTIAL_SUFFIX, PathError};

/// Stable identifier for one unit of remotely synced content, e.g.
/// `journal/2024-05-01`. It doubles as the relative path of the backing file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncableKey(String);

impl SyncableKey {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let value = value.into();
        if value.is_empty() {
            return Err(PathError::Empty);
        }
        if value.starts_with('/') || value.contains('\\') {
            return Err(PathError::UnsupportedComponent);
        }
        for part in value.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(PathError::UnsupportedComponent);
            }
        }
        // Would collide with the download temp file of the key without it.
        if value.ends_with(PARTIAL_SUFFIX) {
            return Err(PathError::ReservedSuffix);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SyncableKey {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SyncableKey> for String {
    fn from(key: SyncableKey) -> Self {
        key.0
    }
}

/// Ordering matters: `Immediate > Deferred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Deferred,
    Immediate,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Deferred => "deferred",
            Priority::Immediate => "immediate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deferred" => Some(Priority::Deferred),
            "immediate" => Some(Priority::Immediate),
            _ => None,
        }
    }

    pub fn is_retry_eligible(self) -> bool {
        matches!(self, Priority::Immediate)
    }
}
