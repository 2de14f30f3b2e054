fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

fn parse_positive_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::SyncStarted { keys } => debug!(keys, "sync started"),
        SyncEvent::SyncCompleted { synced } => info!(synced, "sync completed"),
        SyncEvent::SyncPartialFailure { failed } => {
            warn!(failed = failed.len(), "sync partially failed")
        }
        SyncEvent::SyncFailed { reason } => error!(reason = %reason, "sync failed"),
    }
}

async fn handle_local_event(engine: &SyncEngine, event: LocalEvent) {
    match event {
        LocalEvent::Changed(key) => {
            // Directories and files already gone again are not payloads.
            if !engine.payloads().exists(&key).await {
                debug!(key = %key, "ignoring change without payload file");
                return;
            }
            engine.local_change(key).await;
        }
        LocalEvent::Removed(key) => engine.evict(&key).await,
    }
}

async fn run_record_maintenance(reconciler: &RecordReconciler) {
    if let Err(err) = reconciler.pull(&RecordQuery::all()).await {
        warn!(error = %err, "record pull failed");
    }
    if let Err(err) = reconciler.collect_garbage().await {
        warn!(error = %err, "garbage collection failed");
    }
}

async fn persist_state(engine: &SyncEngine, index: &RecordIndex, status_file: &Path) {
    let pending = engine.pending_snapshot().await;
    if let Err(err) = index.save_pending(&pending).await {
        error!(error = %err, "failed to persist pending keys");
    }
    if let Err(err) = write_status_file(status_file, engine.current_status(), pending.len()).await
    {
        warn!(error = %err, path = %status_file.display(), "failed to write status file");
    }
}

async fn write_status_file(path: &Path, status: SyncStatus, pending: usize) -> anyhow::Result<()> {
    let snapshot = StatusSnapshot {
        status,
        pending,
        updated_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
    };
    let json = serde_json::to_vec_pretty(&snapshot)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
