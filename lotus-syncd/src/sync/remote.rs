use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lotus_cloud::{CloudClient, RecordEntry, RecordFilter};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::key::SyncableKey;
use super::payload::PayloadDir;
use super::store::{AvailabilityState, RecordQuery, RemoteError, RemoteRecord, RemoteStore};
use super::transfer::TransferClient;

const PAGE_SIZE: u32 = 100;
/// How long after a download its watcher events are attributed to it.
const MATERIALIZED_ECHO_WINDOW: Duration = Duration::from_secs(5);

/// [`RemoteStore`] over the cloud REST API. Payloads materialize into the
/// local payload root.
#[derive(Clone)]
pub struct HttpRemoteStore {
    cloud: CloudClient,
    transfer: TransferClient,
    payloads: PayloadDir,
    materializing: Arc<Mutex<HashSet<SyncableKey>>>,
    materialized: Arc<Mutex<HashMap<SyncableKey, Instant>>>,
}

impl HttpRemoteStore {
    pub fn new(cloud: CloudClient, transfer: TransferClient, payloads: PayloadDir) -> Self {
        Self {
            cloud,
            transfer,
            payloads,
            materializing: Arc::new(Mutex::new(HashSet::new())),
            materialized: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn materialize(&self, key: &SyncableKey) -> Result<(), RemoteError> {
        let blob = self.cloud.get_blob(key.as_str()).await?;
        let link = self.cloud.get_download_link(key.as_str()).await?;
        self.transfer
            .download_to_path_checked(&link.href, &self.payloads.path_for(key), blob.md5.as_deref())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upload(&self, key: &SyncableKey, bytes: &[u8]) -> Result<(), RemoteError> {
        let link = self.cloud.get_upload_link(key.as_str(), true).await?;
        self.transfer
            .upload_bytes(&link.href, &link.method, bytes)
            .await?;
        debug!(key = %key, bytes = bytes.len(), "payload uploaded");
        Ok(())
    }

    async fn fetch(&self, query: &RecordQuery) -> Result<Vec<RemoteRecord>, RemoteError> {
        let updated_since = match query.updated_since {
            Some(since) => Some(
                since
                    .format(&Rfc3339)
                    .map_err(|err| RemoteError::Rejected(err.to_string()))?,
            ),
            None => None,
        };
        let filter = RecordFilter {
            identifier: query.identifier.clone(),
            updated_since,
        };
        let entries = self.cloud.list_records_all(&filter, PAGE_SIZE).await?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let record_name = entry.record_name.clone();
            let record = match record_from_entry(entry) {
                Ok(record) => record,
                Err(err) => {
                    warn!(record = %record_name, error = %err, "skipping malformed record");
                    continue;
                }
            };
            if query.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn availability_status(
        &self,
        key: &SyncableKey,
    ) -> Result<AvailabilityState, RemoteError> {
        if self.materializing.lock().await.contains(key) {
            return Ok(AvailabilityState::Materializing);
        }
        // Local copy wins: it is either synced or carries unsynced edits.
        if self.payloads.exists(key).await {
            return Ok(AvailabilityState::FullyPresent);
        }
        match self.cloud.get_blob(key.as_str()).await {
            Ok(_) => Ok(AvailabilityState::PlaceholderOnly),
            Err(err) if err.is_not_found() => Ok(AvailabilityState::NotPresent),
            Err(err) => Err(err.into()),
        }
    }

    async fn request_materialization(&self, key: &SyncableKey) {
        if !self.materializing.lock().await.insert(key.clone()) {
            return;
        }
        let store = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match store.materialize(&key).await {
                Ok(()) => {
                    info!(key = %key, "payload materialized");
                    store
                        .materialized
                        .lock()
                        .await
                        .insert(key.clone(), Instant::now());
                }
                Err(err) => warn!(key = %key, error = %err, "materialization failed"),
            }
            store.materializing.lock().await.remove(&key);
        });
    }

    async fn recently_materialized(&self, key: &SyncableKey) -> bool {
        if self.materializing.lock().await.contains(key) {
            return true;
        }
        let mut materialized = self.materialized.lock().await;
        materialized.retain(|_, at| at.elapsed() <= MATERIALIZED_ECHO_WINDOW);
        materialized.contains_key(key)
    }
}

fn record_from_entry(entry: RecordEntry) -> Result<RemoteRecord, RemoteError> {
    let created_at = OffsetDateTime::parse(&entry.created, &Rfc3339)?;
    let updated_at = OffsetDateTime::parse(&entry.modified, &Rfc3339)?;
    Ok(RemoteRecord {
        identifier: entry.identifier,
        record_name: entry.record_name,
        payload: entry.payload,
        created_at,
        // Remote clocks may skew; keep the record invariant intact.
        updated_at: updated_at.max(created_at),
    })
}
