//! Counting fakes for the store traits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lotus_cloud::CloudError;
use reqwest::StatusCode;

use super::key::SyncableKey;
use super::store::{
    AvailabilityState, LocalRecordStore, RecordQuery, RecordSort, RemoteError, RemoteRecord,
    RemoteStore, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    Transient,
    Permanent,
    /// A 429 carrying this many seconds of `Retry-After`.
    Throttled(u64),
}

#[derive(Default)]
pub struct FakeRemote {
    uploads: Mutex<Vec<(SyncableKey, Vec<u8>)>>,
    attempts: Mutex<HashMap<SyncableKey, usize>>,
    failures: Mutex<HashMap<SyncableKey, UploadFailure>>,
    upload_delay: Mutex<Option<Duration>>,
    materialized: Mutex<HashSet<SyncableKey>>,
    records: Mutex<Vec<RemoteRecord>>,
    fetch_failure: Mutex<bool>,
    states: Mutex<VecDeque<Result<AvailabilityState, ()>>>,
    steady_state: Mutex<Option<AvailabilityState>>,
    pub status_calls: AtomicUsize,
    pub materialize_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self, key: &SyncableKey, failure: UploadFailure) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.clone(), failure);
    }

    /// Every upload sleeps this long before answering.
    pub fn delay_uploads(&self, delay: Option<Duration>) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    /// `recently_materialized` reports `key` as freshly downloaded.
    pub fn mark_materialized(&self, key: &SyncableKey) {
        self.materialized.lock().unwrap().insert(key.clone());
    }

    pub fn heal(&self, key: &SyncableKey) {
        self.failures.lock().unwrap().remove(key);
    }

    pub fn attempts(&self, key: &SyncableKey) -> usize {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn uploaded_keys(&self) -> HashSet<SyncableKey> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn uploaded_bytes(&self, key: &SyncableKey) -> Option<Vec<u8>> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(uploaded, _)| uploaded == key)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn set_records(&self, records: Vec<RemoteRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn fail_fetch(&self, fail: bool) {
        *self.fetch_failure.lock().unwrap() = fail;
    }

    /// Scripted answers for `availability_status`; `Err(())` yields a
    /// transient error. Once drained, `steady` is answered forever.
    pub fn script_states(
        &self,
        states: impl IntoIterator<Item = Result<AvailabilityState, ()>>,
        steady: AvailabilityState,
    ) {
        *self.states.lock().unwrap() = states.into_iter().collect();
        *self.steady_state.lock().unwrap() = Some(steady);
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn upload(&self, key: &SyncableKey, bytes: &[u8]) -> Result<(), RemoteError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default() += 1;
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().get(key).copied();
        match failure {
            Some(UploadFailure::Transient) => {
                Err(RemoteError::Unavailable(format!("{key} offline")))
            }
            Some(UploadFailure::Permanent) => {
                Err(RemoteError::Rejected(format!("{key} rejected")))
            }
            Some(UploadFailure::Throttled(secs)) => Err(RemoteError::Cloud(CloudError::Api {
                status: StatusCode::TOO_MANY_REQUESTS,
                body: "slow down".into(),
                retry_after: Some(secs),
            })),
            None => {
                self.uploads
                    .lock()
                    .unwrap()
                    .push((key.clone(), bytes.to_vec()));
                Ok(())
            }
        }
    }

    async fn fetch(&self, query: &RecordQuery) -> Result<Vec<RemoteRecord>, RemoteError> {
        if *self.fetch_failure.lock().unwrap() {
            return Err(RemoteError::Unavailable("fetch offline".into()));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }

    async fn availability_status(
        &self,
        _key: &SyncableKey,
    ) -> Result<AvailabilityState, RemoteError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.states.lock().unwrap().pop_front();
        match next {
            Some(Ok(state)) => Ok(state),
            Some(Err(())) => Err(RemoteError::Unavailable("status offline".into())),
            None => Ok(self
                .steady_state
                .lock()
                .unwrap()
                .unwrap_or(AvailabilityState::FullyPresent)),
        }
    }

    async fn request_materialization(&self, _key: &SyncableKey) {
        self.materialize_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn recently_materialized(&self, key: &SyncableKey) -> bool {
        self.materialized.lock().unwrap().contains(key)
    }
}

#[derive(Debug, Clone)]
enum Staged {
    Put(RemoteRecord),
    Delete(String),
}

/// In-memory [`LocalRecordStore`] with the same staging semantics as the
/// SQLite index.
#[derive(Default)]
pub struct MemoryRecordStore {
    committed: Mutex<HashMap<String, RemoteRecord>>,
    staged: Mutex<Vec<Staged>>,
    failing_deletes: Mutex<HashSet<String>>,
    pub commits: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn with_records(records: impl IntoIterator<Item = RemoteRecord>) -> Self {
        let store = Self::default();
        *store.committed.lock().unwrap() = records
            .into_iter()
            .map(|record| (record.record_name.clone(), record))
            .collect();
        store
    }

    pub fn fail_delete(&self, record_name: &str, fail: bool) {
        let mut failing = self.failing_deletes.lock().unwrap();
        if fail {
            failing.insert(record_name.to_string());
        } else {
            failing.remove(record_name);
        }
    }

    pub fn committed(&self) -> Vec<RemoteRecord> {
        let mut records: Vec<_> = self.committed.lock().unwrap().values().cloned().collect();
        RecordSort::Identifier.apply(&mut records);
        records
    }

    fn view(&self) -> HashMap<String, RemoteRecord> {
        let mut view = self.committed.lock().unwrap().clone();
        for op in self.staged.lock().unwrap().iter() {
            match op {
                Staged::Put(record) => {
                    view.insert(record.record_name.clone(), record.clone());
                }
                Staged::Delete(name) => {
                    view.remove(name);
                }
            }
        }
        view
    }
}

#[async_trait]
impl LocalRecordStore for MemoryRecordStore {
    async fn insert(&self, record: RemoteRecord) -> Result<(), StoreError> {
        if self.view().contains_key(&record.record_name) {
            return Err(StoreError::DuplicateRecordName(record.record_name));
        }
        self.staged.lock().unwrap().push(Staged::Put(record));
        Ok(())
    }

    async fn update(&self, record: RemoteRecord) -> Result<(), StoreError> {
        if !self.view().contains_key(&record.record_name) {
            return Err(StoreError::MissingRecord(record.record_name));
        }
        self.staged.lock().unwrap().push(Staged::Put(record));
        Ok(())
    }

    async fn delete(&self, record: &RemoteRecord) -> Result<(), StoreError> {
        if self
            .failing_deletes
            .lock()
            .unwrap()
            .contains(&record.record_name)
        {
            return Err(StoreError::Unavailable("store locked".into()));
        }
        if !self.view().contains_key(&record.record_name) {
            return Err(StoreError::MissingRecord(record.record_name.clone()));
        }
        self.staged
            .lock()
            .unwrap()
            .push(Staged::Delete(record.record_name.clone()));
        Ok(())
    }

    async fn query(
        &self,
        query: &RecordQuery,
        sort: RecordSort,
    ) -> Result<Vec<RemoteRecord>, StoreError> {
        let mut records: Vec<_> = self
            .view()
            .into_values()
            .filter(|record| query.matches(record))
            .collect();
        sort.apply(&mut records);
        Ok(records)
    }

    async fn has_uncommitted_changes(&self) -> bool {
        !self.staged.lock().unwrap().is_empty()
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let view = self.view();
        *self.committed.lock().unwrap() = view;
        self.staged.lock().unwrap().clear();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
