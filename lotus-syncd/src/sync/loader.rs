use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backoff::Backoff;
use super::cache::{LocalCache, Payload};
use super::key::SyncableKey;
use super::payload::{PayloadDir, PayloadError};
use super::store::{AvailabilityState, RemoteError, RemoteStore};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("materialization of {key} not finished after {waited:?}")]
    Timeout { key: SyncableKey, waited: Duration },
    #[error("remote status failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("payload read failed: {0}")]
    Payload(#[from] PayloadError),
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    /// Wall-clock cap on waiting for materialization, from the start of a load.
    pub materialize_wait: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            materialize_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(2), false),
        }
    }
}

/// Reads payloads through the cache, materializing placeholders first.
pub struct AvailabilityLoader {
    remote: Arc<dyn RemoteStore>,
    payloads: PayloadDir,
    cache: Arc<LocalCache>,
    config: LoaderConfig,
}

impl AvailabilityLoader {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        payloads: PayloadDir,
        cache: Arc<LocalCache>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            remote,
            payloads,
            cache,
            config,
        }
    }

    /// `Ok(None)` means the key exists neither locally nor remotely.
    pub async fn load(&self, key: &SyncableKey) -> Result<Option<Payload>, LoadError> {
        if let Some(hit) = self.cache.get(key).await {
            return Ok(Some(hit));
        }

        let deadline = Instant::now() + self.config.materialize_wait;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.load_once(key, deadline).await {
                Ok(found) => return Ok(found),
                Err(err) if attempt < max_attempts => {
                    let delay = self.config.backoff.delay(attempt);
                    warn!(key = %key, attempt, error = %err, delay_ms = delay.as_millis() as u64, "load failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(key = %key, attempt, error = %err, "load failed");
                    return Err(err);
                }
            }
        }
    }

    async fn load_once(
        &self,
        key: &SyncableKey,
        deadline: Instant,
    ) -> Result<Option<Payload>, LoadError> {
        let state = self.remote.availability_status(key).await?;
        debug!(key = %key, state = state.as_str(), "availability checked");
        match state {
            AvailabilityState::NotPresent => return Ok(None),
            AvailabilityState::FullyPresent => {}
            AvailabilityState::PlaceholderOnly | AvailabilityState::Materializing => {
                if state == AvailabilityState::PlaceholderOnly {
                    self.remote.request_materialization(key).await;
                }
                match self.wait_until_present(key, deadline).await {
                    Ok(AvailabilityState::NotPresent) => return Ok(None),
                    Ok(_) => {}
                    Err(err @ LoadError::Timeout { .. }) => {
                        warn!(key = %key, error = %err, "reading possibly stale payload");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.read_through(key).await.map(Some)
    }

    /// Reads the backing file into the cache while holding the key, so a
    /// concurrent save or delete is never overwritten by older bytes.
    async fn read_through(&self, key: &SyncableKey) -> Result<Payload, LoadError> {
        let _guard = self.cache.lock_key(key).await;
        if let Some(hit) = self.cache.get(key).await {
            return Ok(hit);
        }
        let payload = Payload::from(self.payloads.read(key).await?);
        self.cache.put(key.clone(), payload.clone()).await;
        Ok(payload)
    }

    async fn wait_until_present(
        &self,
        key: &SyncableKey,
        deadline: Instant,
    ) -> Result<AvailabilityState, LoadError> {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(LoadError::Timeout {
                    key: key.clone(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
            match self.remote.availability_status(key).await? {
                AvailabilityState::PlaceholderOnly | AvailabilityState::Materializing => continue,
                settled => return Ok(settled),
            }
        }
    }
}
