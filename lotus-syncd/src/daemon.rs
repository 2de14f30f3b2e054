use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lotus_cloud::CloudClient;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::sync::backoff::Backoff;
use crate::sync::engine::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS, EngineConfig, SyncEngine};
use crate::sync::index::RecordIndex;
use crate::sync::loader::LoaderConfig;
use crate::sync::local_watcher::{LocalEvent, start_notify_watcher};
use crate::sync::payload::PayloadDir;
use crate::sync::records::RecordReconciler;
use crate::sync::remote::HttpRemoteStore;
use crate::sync::status::{SyncEvent, SyncStatus};
use crate::sync::store::RecordQuery;
use crate::sync::transfer::{TransferClient, TransferConfig};

const APP_DIR_NAME: &str = "lotus-planner";
const DEFAULT_CLOUD_URL: &str = "https://cloud.lotusplanner.app";
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_SECS: u64 = 30;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_GC_INTERVAL_SECS: u64 = 300;
const DEFAULT_MATERIALIZE_WAIT_MS: u64 = 10_000;
const DEFAULT_MATERIALIZE_POLL_MS: u64 = 250;
const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub payload_root: PathBuf,
    pub db_path: PathBuf,
    pub status_file: PathBuf,
    pub cloud_url: String,
    pub cloud_token: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub sync_interval: Duration,
    pub gc_interval: Duration,
    pub materialize_wait: Duration,
    pub materialize_poll: Duration,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(&home, default_data_root(), |name| std::env::var(name).ok())
    }

    fn from_lookup<F>(home: &Path, data_root: PathBuf, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let payload_root = lookup("LOTUS_PAYLOAD_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_root.join("payloads"));
        let db_path = lookup("LOTUS_DB_PATH")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_root.join("records.db"));
        let status_file = lookup("LOTUS_STATUS_FILE")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_root.join("status.json"));
        let cloud_url = lookup("LOTUS_CLOUD_URL").unwrap_or_else(|| DEFAULT_CLOUD_URL.to_string());
        let cloud_token = lookup("LOTUS_CLOUD_TOKEN")
            .filter(|value| !value.trim().is_empty())
            .context("LOTUS_CLOUD_TOKEN is not set")?;
        let read_u64 = |name: &str, default: u64| parse_positive_u64(lookup(name), default);

        Ok(Self {
            payload_root,
            db_path,
            status_file,
            cloud_url,
            cloud_token,
            batch_size: read_u64("LOTUS_BATCH_SIZE", DEFAULT_BATCH_SIZE as u64) as usize,
            max_attempts: read_u64("LOTUS_MAX_ATTEMPTS", u64::from(DEFAULT_MAX_ATTEMPTS))
                .min(u64::from(u32::MAX)) as u32,
            retry_base: Duration::from_millis(read_u64(
                "LOTUS_RETRY_BASE_MS",
                DEFAULT_RETRY_BASE_MS,
            )),
            sync_interval: Duration::from_secs(read_u64(
                "LOTUS_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            gc_interval: Duration::from_secs(read_u64(
                "LOTUS_GC_INTERVAL_SECS",
                DEFAULT_GC_INTERVAL_SECS,
            )),
            materialize_wait: Duration::from_millis(read_u64(
                "LOTUS_MATERIALIZE_WAIT_MS",
                DEFAULT_MATERIALIZE_WAIT_MS,
            )),
            materialize_poll: Duration::from_millis(read_u64(
                "LOTUS_MATERIALIZE_POLL_MS",
                DEFAULT_MATERIALIZE_POLL_MS,
            )),
            enable_local_watcher: parse_bool(lookup("LOTUS_ENABLE_LOCAL_WATCHER"), true),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let backoff = Backoff::new(
            self.retry_base,
            Duration::from_secs(DEFAULT_RETRY_MAX_SECS),
            false,
        );
        EngineConfig {
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            backoff,
            sync_interval: self.sync_interval,
            loader: LoaderConfig {
                materialize_wait: self.materialize_wait,
                poll_interval: self.materialize_poll,
                ..LoaderConfig::default()
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    #[serde(flatten)]
    status: SyncStatus,
    pending: usize,
    updated_at: String,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    index: Arc<RecordIndex>,
    reconciler: Arc<RecordReconciler>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.payload_root)
            .await
            .with_context(|| format!("failed to create payload root at {:?}", config.payload_root))?;
        let index = Arc::new(
            RecordIndex::open(&config.db_path)
                .await
                .context("failed to initialize record index")?,
        );

        let cloud = CloudClient::with_base_url(&config.cloud_url, config.cloud_token.clone())
            .context("invalid cloud url")?;
        let transfer = TransferClient::with_config(TransferConfig {
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            upload_concurrency: config.batch_size,
        });
        let payloads = PayloadDir::new(&config.payload_root);
        let remote = Arc::new(HttpRemoteStore::new(cloud, transfer, payloads.clone()));
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            payloads,
            config.engine_config(),
        ));
        let reconciler = Arc::new(RecordReconciler::new(index.clone(), remote));

        let pending = index
            .load_pending()
            .await
            .context("failed to load pending keys")?;
        engine.restore_pending(pending).await;

        Ok(Self {
            config,
            engine,
            index,
            reconciler,
        })
    }

    /// One forced sync plus record maintenance, then exit.
    pub async fn run_once(self) -> anyhow::Result<()> {
        let report = self
            .engine
            .force_sync_all()
            .await
            .context("forced sync failed")?;
        info!(
            synced = report.succeeded.len(),
            failed = report.failed.len(),
            "forced sync finished"
        );
        run_record_maintenance(&self.reconciler).await;
        persist_state(&self.engine, &self.index, &self.config.status_file).await;
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            payload_root = %self.config.payload_root.display(),
            batch_size = self.config.batch_size,
            local_watcher = self.config.enable_local_watcher,
            "started"
        );

        let scheduler = self.engine.start();

        let engine_for_status = Arc::clone(&self.engine);
        let index_for_status = Arc::clone(&self.index);
        let status_file = self.config.status_file.clone();
        let mut events = self.engine.subscribe();
        let status_handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        log_event(&event);
                        if !matches!(event, SyncEvent::SyncStarted { .. }) {
                            persist_state(&engine_for_status, &index_for_status, &status_file)
                                .await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status logger lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let reconciler = Arc::clone(&self.reconciler);
        let gc_interval = self.config.gc_interval;
        let gc_handle = tokio::spawn(async move {
            loop {
                run_record_maintenance(&reconciler).await;
                tokio::time::sleep(gc_interval).await;
            }
        });

        let (watcher, local_rx): (
            Option<notify::RecommendedWatcher>,
            Option<mpsc::UnboundedReceiver<LocalEvent>>,
        ) = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.payload_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let local_handle = local_rx.map(|mut rx| {
            let engine_for_local = Arc::clone(&self.engine);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    handle_local_event(&engine_for_local, event).await;
                }
            })
        });

        let _watcher = watcher;
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested");

        scheduler.stop().await;
        gc_handle.abort();
        if let Some(handle) = local_handle {
            handle.abort();
        }

        match self.engine.force_sync_all().await {
            Ok(report) => info!(
                synced = report.succeeded.len(),
                failed = report.failed.len(),
                "final sync finished"
            ),
            Err(err) => error!(error = %err, "final sync failed"),
        }
        status_handle.abort();
        persist_state(&self.engine, &self.index, &self.config.status_file).await;
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
