use super::*;
use crate::sync::key::{Priority, SyncableKey};
use crate::sync::testing::FakeRemote;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tempfile::tempdir;

fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn expands_tilde_to_home_payload_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Planner", &home),
        PathBuf::from("/tmp/home-user/Planner")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/abs", &home), PathBuf::from("/abs"));
}

#[test]
fn numeric_settings_fall_back_on_missing_invalid_or_zero() {
    assert_eq!(parse_positive_u64(None, 42), 42);
    assert_eq!(parse_positive_u64(Some("abc".into()), 42), 42);
    assert_eq!(parse_positive_u64(Some("0".into()), 42), 42);
    assert_eq!(parse_positive_u64(Some(" 7 ".into()), 42), 7);
}

#[test]
fn local_watcher_is_enabled_by_default() {
    assert!(parse_bool(None, true));
    assert!(!parse_bool(Some("off".into()), true));
    assert!(parse_bool(Some("YES".into()), false));
}

#[test]
fn config_defaults_live_under_data_root() {
    let home = PathBuf::from("/home/u");
    let data = PathBuf::from("/home/u/.local/share/lotus-planner");
    let config =
        DaemonConfig::from_lookup(&home, data.clone(), lookup_from(&[("LOTUS_CLOUD_TOKEN", "t")]))
            .unwrap();

    assert_eq!(config.payload_root, data.join("payloads"));
    assert_eq!(config.db_path, data.join("records.db"));
    assert_eq!(config.status_file, data.join("status.json"));
    assert_eq!(config.cloud_url, DEFAULT_CLOUD_URL);
    assert_eq!(config.batch_size, 5);
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.sync_interval, Duration::from_secs(30));
    assert_eq!(config.materialize_wait, Duration::from_secs(10));
    assert!(config.enable_local_watcher);
}

#[test]
fn config_reads_overrides() {
    let home = PathBuf::from("/home/u");
    let config = DaemonConfig::from_lookup(
        &home,
        PathBuf::from("/data"),
        lookup_from(&[
            ("LOTUS_CLOUD_TOKEN", "t"),
            ("LOTUS_PAYLOAD_DIR", "~/planner"),
            ("LOTUS_BATCH_SIZE", "8"),
            ("LOTUS_MAX_ATTEMPTS", "4"),
            ("LOTUS_MATERIALIZE_POLL_MS", "100"),
            ("LOTUS_RETRY_BASE_MS", "250"),
            ("LOTUS_ENABLE_LOCAL_WATCHER", "0"),
        ]),
    )
    .unwrap();

    assert_eq!(config.payload_root, PathBuf::from("/home/u/planner"));
    assert_eq!(config.batch_size, 8);
    let engine = config.engine_config();
    assert_eq!(engine.max_attempts, 4);
    assert_eq!(engine.loader.poll_interval, Duration::from_millis(100));
    assert!(!config.enable_local_watcher);
}

#[test]
fn retry_delays_are_exact_doublings_of_the_base() {
    let config = DaemonConfig::from_lookup(
        Path::new("/home/u"),
        PathBuf::from("/data"),
        lookup_from(&[("LOTUS_CLOUD_TOKEN", "t"), ("LOTUS_RETRY_BASE_MS", "250")]),
    )
    .unwrap();
    let backoff = config.engine_config().backoff;
    assert_eq!(backoff.delay(1), Duration::from_millis(250));
    assert_eq!(backoff.delay(2), Duration::from_millis(500));
    assert_eq!(backoff.delay(3), Duration::from_millis(1000));
    assert_eq!(backoff.delay(20), Duration::from_secs(DEFAULT_RETRY_MAX_SECS));
}

#[test]
fn missing_token_is_an_error() {
    let err = DaemonConfig::from_lookup(
        Path::new("/home/u"),
        PathBuf::from("/data"),
        lookup_from(&[("LOTUS_CLOUD_TOKEN", "  ")]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("LOTUS_CLOUD_TOKEN"));
}

#[tokio::test]
async fn local_events_mark_and_evict() {
    let dir = tempdir().unwrap();
    let engine = SyncEngine::new(
        Arc::new(FakeRemote::new()),
        PayloadDir::new(dir.path()),
        EngineConfig::default(),
    );
    let key = SyncableKey::new("journal/2024-05-01").unwrap();
    engine.payloads().write(&key, b"ink").await.unwrap();
    engine
        .cache()
        .put(key.clone(), b"ink".to_vec().into())
        .await;

    handle_local_event(&engine, LocalEvent::Changed(key.clone())).await;
    assert_eq!(
        engine.pending_snapshot().await[0].priority,
        Priority::Deferred
    );
    assert!(engine.cache().get(&key).await.is_none());

    engine
        .cache()
        .put(key.clone(), b"ink".to_vec().into())
        .await;
    handle_local_event(&engine, LocalEvent::Removed(key.clone())).await;
    assert!(engine.cache().get(&key).await.is_none());
}

#[tokio::test]
async fn outside_edit_is_served_fresh_by_next_load() {
    let dir = tempdir().unwrap();
    let engine = SyncEngine::new(
        Arc::new(FakeRemote::new()),
        PayloadDir::new(dir.path()),
        EngineConfig::default(),
    );
    let key = SyncableKey::new("journal/2024-05-02").unwrap();
    engine.save(key.clone(), b"draft".to_vec(), Priority::Deferred).await.unwrap();

    std::fs::write(dir.path().join("journal/2024-05-02"), b"edited elsewhere").unwrap();
    handle_local_event(&engine, LocalEvent::Changed(key.clone())).await;

    let loaded = engine.load(&key).await.unwrap().unwrap();
    assert_eq!(&loaded[..], b"edited elsewhere");
}

#[tokio::test]
async fn directory_events_do_not_become_pending_keys() {
    let dir = tempdir().unwrap();
    let engine = SyncEngine::new(
        Arc::new(FakeRemote::new()),
        PayloadDir::new(dir.path()),
        EngineConfig::default(),
    );
    std::fs::create_dir_all(dir.path().join("journal/2024")).unwrap();

    let folder = SyncableKey::new("journal/2024").unwrap();
    handle_local_event(&engine, LocalEvent::Changed(folder)).await;
    let vanished = SyncableKey::new("journal/gone").unwrap();
    handle_local_event(&engine, LocalEvent::Changed(vanished)).await;

    assert_eq!(engine.pending_len().await, 0);
}

#[tokio::test]
async fn materialized_download_is_not_queued_for_upload() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(FakeRemote::new());
    let engine = SyncEngine::new(
        remote.clone(),
        PayloadDir::new(dir.path()),
        EngineConfig::default(),
    );
    let key = SyncableKey::new("habits/log").unwrap();
    engine.payloads().write(&key, b"downloaded").await.unwrap();
    remote.mark_materialized(&key);

    handle_local_event(&engine, LocalEvent::Changed(key.clone())).await;

    assert_eq!(engine.pending_len().await, 0);
}

#[tokio::test]
async fn persisted_state_includes_pending_keys_and_status() {
    let dir = tempdir().unwrap();
    let engine = SyncEngine::new(
        Arc::new(FakeRemote::new()),
        PayloadDir::new(dir.path()),
        EngineConfig::default(),
    );
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let index = RecordIndex::from_pool(pool);
    index.init().await.unwrap();
    engine
        .mark_changed(SyncableKey::new("habits/log").unwrap(), Priority::Deferred)
        .await;

    let status_file = dir.path().join("state/status.json");
    persist_state(&engine, &index, &status_file).await;

    assert_eq!(index.load_pending().await.unwrap().len(), 1);
    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&status_file).unwrap()).unwrap();
    assert_eq!(json["state"], "idle");
    assert_eq!(json["pending"], 1);
    assert!(json["updated_at"].is_string());
}
