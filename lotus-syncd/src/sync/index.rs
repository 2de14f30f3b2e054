use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions, sqlite::SqliteRow};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::key::{Priority, SyncableKey};
use super::store::{LocalRecordStore, RecordQuery, RecordSort, RemoteRecord, StoreError};
use super::tracker::PendingEntry;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid priority: {0}")]
    InvalidPriority(String),
    #[error("invalid pending key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone)]
enum StagedOp {
    Insert(RemoteRecord),
    Update(RemoteRecord),
    Delete(String),
}

impl StagedOp {
    fn record_name(&self) -> &str {
        match self {
            StagedOp::Insert(record) | StagedOp::Update(record) => &record.record_name,
            StagedOp::Delete(name) => name,
        }
    }
}

/// SQLite-backed local record store. Mutations are staged in memory and
/// written in one transaction on [`LocalRecordStore::commit`].
pub struct RecordIndex {
    pool: SqlitePool,
    staged: Mutex<Vec<StagedOp>>,
}

impl RecordIndex {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            staged: Mutex::new(Vec::new()),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let index = Self::from_pool(pool);
        index.init().await?;
        Ok(index)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    async fn committed_by_name(&self, name: &str) -> Result<Option<RemoteRecord>, IndexError> {
        let row = sqlx::query(
            "SELECT record_name, identifier, payload, created_at_us, updated_at_us
             FROM records WHERE record_name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn committed_matching(&self, query: &RecordQuery) -> Result<Vec<RemoteRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT record_name, identifier, payload, created_at_us, updated_at_us
             FROM records
             WHERE (?1 IS NULL OR identifier = ?1)
               AND (?2 IS NULL OR updated_at_us >= ?2)",
        )
        .bind(query.identifier.as_deref())
        .bind(query.updated_since.map(to_micros))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(record_from_row(&row)?);
        }
        Ok(out)
    }

    /// Whether `name` exists once staged operations are taken into account.
    async fn visible(&self, staged: &[StagedOp], name: &str) -> Result<bool, IndexError> {
        match staged.iter().rev().find(|op| op.record_name() == name) {
            Some(StagedOp::Delete(_)) => Ok(false),
            Some(_) => Ok(true),
            None => Ok(self.committed_by_name(name).await?.is_some()),
        }
    }

    /// Replaces the persisted pending set with `entries`, keeping their order.
    pub async fn save_pending(&self, entries: &[PendingEntry]) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_keys")
            .execute(&mut *tx)
            .await?;
        for (seq, entry) in entries.iter().enumerate() {
            sqlx::query("INSERT INTO pending_keys (key, priority, seq) VALUES (?1, ?2, ?3)")
                .bind(entry.key.as_str())
                .bind(entry.priority.as_str())
                .bind(seq as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_pending(&self) -> Result<Vec<PendingEntry>, IndexError> {
        let rows = sqlx::query("SELECT key, priority FROM pending_keys ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let priority: String = row.try_get("priority")?;
            let priority =
                Priority::parse(&priority).ok_or(IndexError::InvalidPriority(priority))?;
            let key = SyncableKey::new(key.clone()).map_err(|_| IndexError::InvalidKey(key))?;
            out.push(PendingEntry::new(key, priority));
        }
        Ok(out)
    }
}

#[async_trait]
impl LocalRecordStore for RecordIndex {
    async fn insert(&self, record: RemoteRecord) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().await;
        if self.visible(&staged, &record.record_name).await? {
            return Err(StoreError::DuplicateRecordName(record.record_name));
        }
        staged.push(StagedOp::Insert(record));
        Ok(())
    }

    async fn update(&self, record: RemoteRecord) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().await;
        if !self.visible(&staged, &record.record_name).await? {
            return Err(StoreError::MissingRecord(record.record_name));
        }
        staged.push(StagedOp::Update(record));
        Ok(())
    }

    async fn delete(&self, record: &RemoteRecord) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().await;
        if !self.visible(&staged, &record.record_name).await? {
            return Err(StoreError::MissingRecord(record.record_name.clone()));
        }
        staged.push(StagedOp::Delete(record.record_name.clone()));
        Ok(())
    }

    async fn query(
        &self,
        query: &RecordQuery,
        sort: RecordSort,
    ) -> Result<Vec<RemoteRecord>, StoreError> {
        let staged = self.staged.lock().await;
        let mut view: HashMap<String, RemoteRecord> = self
            .committed_matching(query)
            .await?
            .into_iter()
            .map(|record| (record.record_name.clone(), record))
            .collect();

        for op in staged.iter() {
            match op {
                StagedOp::Insert(record) | StagedOp::Update(record) => {
                    if query.matches(record) {
                        view.insert(record.record_name.clone(), record.clone());
                    } else {
                        view.remove(&record.record_name);
                    }
                }
                StagedOp::Delete(name) => {
                    view.remove(name);
                }
            }
        }

        let mut records: Vec<RemoteRecord> = view.into_values().collect();
        sort.apply(&mut records);
        Ok(records)
    }

    async fn has_uncommitted_changes(&self) -> bool {
        !self.staged.lock().await.is_empty()
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().await;
        if staged.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(IndexError::from)?;
        for op in staged.iter() {
            match op {
                StagedOp::Insert(record) | StagedOp::Update(record) => {
                    sqlx::query(
                        "INSERT INTO records (record_name, identifier, payload, created_at_us, updated_at_us)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(record_name) DO UPDATE SET
                            identifier = excluded.identifier,
                            payload = excluded.payload,
                            created_at_us = excluded.created_at_us,
                            updated_at_us = excluded.updated_at_us",
                    )
                    .bind(&record.record_name)
                    .bind(record.identifier.as_deref())
                    .bind(&record.payload)
                    .bind(to_micros(record.created_at))
                    .bind(to_micros(record.updated_at))
                    .execute(&mut *tx)
                    .await
                    .map_err(IndexError::from)?;
                }
                StagedOp::Delete(name) => {
                    sqlx::query("DELETE FROM records WHERE record_name = ?1")
                        .bind(name)
                        .execute(&mut *tx)
                        .await
                        .map_err(IndexError::from)?;
                }
            }
        }
        tx.commit().await.map_err(IndexError::from)?;
        staged.clear();
        Ok(())
    }
}

fn to_micros(at: OffsetDateTime) -> i64 {
    let micros = at.unix_timestamp_nanos() / 1_000;
    micros.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn from_micros(micros: i64) -> Result<OffsetDateTime, IndexError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|_| IndexError::InvalidTimestamp(micros))
}

fn record_from_row(row: &SqliteRow) -> Result<RemoteRecord, IndexError> {
    Ok(RemoteRecord {
        record_name: row.try_get("record_name")?,
        identifier: row.try_get("identifier")?,
        payload: row.try_get("payload")?,
        created_at: from_micros(row.try_get("created_at_us")?)?,
        updated_at: from_micros(row.try_get("updated_at_us")?)?,
    })
}
