use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::key::SyncableKey;

/// Shared payload bytes as handed out by the cache and the loader.
pub type Payload = Arc<[u8]>;

/// In-memory map of the most recently loaded or saved payload per key.
///
/// Whoever touches a key's backing file and then its entry holds
/// [`lock_key`](Self::lock_key) across both steps, so a slow read can never
/// put older bytes over a newer save.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: Mutex<HashMap<SyncableKey, Payload>>,
    writers: Arc<std::sync::Mutex<HashMap<SyncableKey, Arc<Mutex<()>>>>>,
}

/// Exclusive access to one key. Released on drop.
pub struct KeyGuard {
    key: SyncableKey,
    guard: Option<OwnedMutexGuard<()>>,
    writers: Arc<std::sync::Mutex<HashMap<SyncableKey, Arc<Mutex<()>>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map still holds the lock: nobody waits on it.
        if writers
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            writers.remove(&self.key);
        }
    }
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_key(&self, key: &SyncableKey) -> KeyGuard {
        let lock = {
            let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
            writers.entry(key.clone()).or_default().clone()
        };
        KeyGuard {
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
            writers: self.writers.clone(),
        }
    }

    pub async fn get(&self, key: &SyncableKey) -> Option<Payload> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: SyncableKey, payload: Payload) {
        self.entries.lock().await.insert(key, payload);
    }

    pub async fn evict(&self, key: &SyncableKey) -> Option<Payload> {
        self.entries.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
