//! Seams to the two external collaborators: the local record store and the
//! remote cloud store. The engine only sees these traits.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use super::index::IndexError;
use super::key::SyncableKey;
use super::transfer::TransferError;

/// A record as stored remotely and mirrored locally.
///
/// `identifier` is the caller-defined unique id (a day, a habit id, ...);
/// duplicates share it. `record_name` is assigned by the store and is unique
/// per physical record, so a specific duplicate can be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub identifier: Option<String>,
    pub record_name: String,
    pub payload: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RemoteRecord {
    pub fn new(
        identifier: Option<String>,
        record_name: impl Into<String>,
        payload: Vec<u8>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            identifier,
            record_name: record_name.into(),
            payload,
            created_at,
            updated_at: created_at,
        }
    }

    /// Advances `updated_at` strictly, even when `now` lags behind it.
    pub fn touch(&mut self, now: OffsetDateTime) {
        let floor = self.updated_at + time::Duration::microseconds(1);
        self.updated_at = now.max(floor);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub identifier: Option<String>,
    pub updated_since: Option<OffsetDateTime>,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            updated_since: None,
        }
    }

    pub fn matches(&self, record: &RemoteRecord) -> bool {
        if let Some(identifier) = &self.identifier
            && record.identifier.as_deref() != Some(identifier.as_str())
        {
            return false;
        }
        if let Some(since) = self.updated_since
            && record.updated_at < since
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordSort {
    #[default]
    UpdatedDescending,
    UpdatedAscending,
    Identifier,
}

impl RecordSort {
    pub fn apply(self, records: &mut [RemoteRecord]) {
        match self {
            RecordSort::UpdatedDescending => records.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.record_name.cmp(&b.record_name))
            }),
            RecordSort::UpdatedAscending => records.sort_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.record_name.cmp(&b.record_name))
            }),
            RecordSort::Identifier => records.sort_by(|a, b| {
                a.identifier
                    .cmp(&b.identifier)
                    .then_with(|| a.record_name.cmp(&b.record_name))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    NotPresent,
    PlaceholderOnly,
    Materializing,
    FullyPresent,
}

impl AvailabilityState {
    pub fn as_str(self) -> &'static str {
        match self {
            AvailabilityState::NotPresent => "not_present",
            AvailabilityState::PlaceholderOnly => "placeholder_only",
            AvailabilityState::Materializing => "materializing",
            AvailabilityState::FullyPresent => "fully_present",
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("remote rejected request: {0}")]
    Rejected(String),
    #[error("cloud api error: {0}")]
    Cloud(#[from] lotus_cloud::CloudError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("invalid record timestamp: {0}")]
    Time(#[from] time::error::Parse),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Unavailable(_) => true,
            RemoteError::Rejected(_) => false,
            RemoteError::Cloud(err) => err.is_retryable(),
            RemoteError::Transfer(err) => err.is_transient(),
            RemoteError::Time(_) => false,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RemoteError::Cloud(err) => err.retry_after_secs(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("record not found: {0}")]
    MissingRecord(String),
    #[error("record already exists: {0}")]
    DuplicateRecordName(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque key/blob store with record listing.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload(&self, key: &SyncableKey, bytes: &[u8]) -> Result<(), RemoteError>;

    async fn fetch(&self, query: &RecordQuery) -> Result<Vec<RemoteRecord>, RemoteError>;

    async fn availability_status(
        &self,
        key: &SyncableKey,
    ) -> Result<AvailabilityState, RemoteError>;

    /// Hint only; completion is observed through `availability_status`.
    async fn request_materialization(&self, key: &SyncableKey);

    /// `true` while the store itself is writing, or has just written,
    /// `key`'s local file. Watcher events for it are then not user edits.
    async fn recently_materialized(&self, _key: &SyncableKey) -> bool {
        false
    }
}

/// CRUD surface of the local record store. Mutations are staged until
/// `commit`.
#[async_trait]
pub trait LocalRecordStore: Send + Sync {
    async fn insert(&self, record: RemoteRecord) -> Result<(), StoreError>;

    async fn update(&self, record: RemoteRecord) -> Result<(), StoreError>;

    async fn delete(&self, record: &RemoteRecord) -> Result<(), StoreError>;

    async fn query(
        &self,
        query: &RecordQuery,
        sort: RecordSort,
    ) -> Result<Vec<RemoteRecord>, StoreError>;

    async fn has_uncommitted_changes(&self) -> bool;

    async fn commit(&self) -> Result<(), StoreError>;
}
