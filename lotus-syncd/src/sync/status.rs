use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::key::SyncableKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing {
        progress: SyncProgress,
    },
    PartialFailure {
        failed: Vec<SyncableKey>,
    },
    Error {
        message: String,
    },
}

impl SyncStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing { .. } => "syncing",
            SyncStatus::PartialFailure { .. } => "partial_failure",
            SyncStatus::Error { .. } => "error",
        }
    }
}

/// Lifecycle events, one `SyncStarted` and one terminal event per batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted { keys: usize },
    SyncCompleted { synced: usize },
    SyncPartialFailure { failed: Vec<SyncableKey> },
    SyncFailed { reason: String },
}

/// Holds the current status and fans lifecycle events out to subscribers.
pub struct StatusPublisher {
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
}

impl StatusPublisher {
    pub fn new(capacity: usize) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { status, events }
    }

    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn set_status(&self, status: SyncStatus) {
        self.status.send_replace(status);
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let publisher = StatusPublisher::default();
        let mut events = publisher.subscribe();

        publisher.emit(SyncEvent::SyncStarted { keys: 2 });
        publisher.emit(SyncEvent::SyncCompleted { synced: 2 });

        assert_eq!(events.recv().await.unwrap(), SyncEvent::SyncStarted { keys: 2 });
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::SyncCompleted { synced: 2 }
        );
    }

    #[tokio::test]
    async fn watchers_see_latest_status() {
        let publisher = StatusPublisher::default();
        let mut watcher = publisher.watch();
        assert_eq!(*watcher.borrow(), SyncStatus::Idle);

        publisher.set_status(SyncStatus::Syncing {
            progress: SyncProgress {
                completed: 1,
                total: 5,
            },
        });
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().label(), "syncing");
        assert_eq!(publisher.current().label(), "syncing");
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let status = SyncStatus::PartialFailure {
            failed: vec![SyncableKey::new("journal/2024-05-01").unwrap()],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "partial_failure");
        assert_eq!(json["failed"][0], "journal/2024-05-01");
    }
}
