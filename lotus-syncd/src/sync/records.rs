//! Applies [`reconcile`] to the local record store: once after migrating
//! records from another store, and periodically as a garbage collector.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::reconcile::{DiscardReason, Reconciliation, reconcile};
use super::store::{
    LocalRecordStore, RecordQuery, RecordSort, RemoteError, RemoteRecord, RemoteStore, StoreError,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
    #[error("remote fetch failed: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub survivors: usize,
    pub deleted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub touched: usize,
    pub missing_identifier: usize,
    /// Deletions that failed and will be retried on the next run.
    pub pending_deletions: usize,
}

pub struct RecordReconciler {
    store: Arc<dyn LocalRecordStore>,
    remote: Arc<dyn RemoteStore>,
    pending_deletions: Mutex<HashMap<String, RemoteRecord>>,
}

impl RecordReconciler {
    pub fn new(store: Arc<dyn LocalRecordStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            remote,
            pending_deletions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn pending_deletions(&self) -> usize {
        self.pending_deletions.lock().await.len()
    }

    /// Fetches remote records, merges them into the local store and returns
    /// the reconciled local view of `query`.
    pub async fn pull(&self, query: &RecordQuery) -> Result<Vec<RemoteRecord>, ReconcileError> {
        let remote = self.remote.fetch(query).await?;
        let local = self.store.query(query, RecordSort::Identifier).await?;
        self.merge_after_migration(local, remote).await?;
        Ok(self.store.query(query, RecordSort::Identifier).await?)
    }

    /// Reconciles the union of `local` (already in the store) and `remote`:
    /// local losers are deleted, remote survivors are inserted or replace
    /// their older local version.
    pub async fn merge_after_migration(
        &self,
        local: Vec<RemoteRecord>,
        remote: Vec<RemoteRecord>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        self.retry_pending_deletions(&mut report).await;

        let local_by_name: HashMap<String, RemoteRecord> = local
            .iter()
            .map(|record| (record.record_name.clone(), record.clone()))
            .collect();
        let result = reconcile(local.into_iter().chain(remote));
        report.survivors = result.survivors.len();
        report.missing_identifier = count_missing_identifier(&result);

        for discard in &result.discards {
            if local_by_name.contains_key(&discard.record.record_name) {
                self.delete_or_defer(&discard.record, &mut report).await;
            }
        }

        for survivor in result.survivors {
            match local_by_name.get(&survivor.record_name) {
                Some(existing) if *existing == survivor => {}
                Some(_) => {
                    self.store.update(survivor).await?;
                    report.updated += 1;
                }
                None => {
                    self.store.insert(survivor).await?;
                    report.inserted += 1;
                }
            }
        }

        self.finish(&mut report).await?;
        info!(
            survivors = report.survivors,
            deleted = report.deleted,
            inserted = report.inserted,
            updated = report.updated,
            "records merged"
        );
        Ok(report)
    }

    /// Removes duplicates accumulated in the local store and touches the
    /// records that won a duplicate group.
    pub async fn collect_garbage(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        self.retry_pending_deletions(&mut report).await;

        let records = self
            .store
            .query(&RecordQuery::all(), RecordSort::Identifier)
            .await?;
        let result = reconcile(records);
        report.survivors = result.survivors.len();
        report.missing_identifier = count_missing_identifier(&result);

        for discard in &result.discards {
            self.delete_or_defer(&discard.record, &mut report).await;
        }

        let now = OffsetDateTime::now_utc();
        for survivor in result.contested_survivors() {
            let mut survivor = survivor.clone();
            survivor.touch(now);
            self.store.update(survivor).await?;
            report.touched += 1;
        }

        self.finish(&mut report).await?;
        if report.deleted > 0 || report.pending_deletions > 0 {
            info!(
                deleted = report.deleted,
                touched = report.touched,
                pending = report.pending_deletions,
                "garbage collected"
            );
        } else {
            debug!(survivors = report.survivors, "no duplicate records");
        }
        Ok(report)
    }

    async fn finish(&self, report: &mut ReconcileReport) -> Result<(), ReconcileError> {
        if self.store.has_uncommitted_changes().await {
            self.store.commit().await?;
        }
        report.pending_deletions = self.pending_deletions.lock().await.len();
        Ok(())
    }

    async fn retry_pending_deletions(&self, report: &mut ReconcileReport) {
        let pending: Vec<RemoteRecord> = {
            let mut guard = self.pending_deletions.lock().await;
            guard.drain().map(|(_, record)| record).collect()
        };
        for record in pending {
            self.delete_or_defer(&record, report).await;
        }
    }

    async fn delete_or_defer(&self, record: &RemoteRecord, report: &mut ReconcileReport) {
        match self.store.delete(record).await {
            Ok(()) => report.deleted += 1,
            // Already gone.
            Err(StoreError::MissingRecord(_)) => {}
            Err(err) => {
                warn!(record = %record.record_name, error = %err, "record deletion deferred");
                self.pending_deletions
                    .lock()
                    .await
                    .insert(record.record_name.clone(), record.clone());
            }
        }
    }
}

fn count_missing_identifier(result: &Reconciliation) -> usize {
    let names: HashSet<&str> = result
        .discards
        .iter()
        .filter(|discard| discard.reason == DiscardReason::MissingIdentifier)
        .map(|discard| discard.record.record_name.as_str())
        .collect();
    names.len()
}
