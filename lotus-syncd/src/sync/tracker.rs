use std::collections::{HashMap, VecDeque};

use super::key::{Priority, SyncableKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub key: SyncableKey,
    pub priority: Priority,
}

impl PendingEntry {
    pub fn new(key: SyncableKey, priority: Priority) -> Self {
        Self { key, priority }
    }
}

/// Snapshot of pending keys taken at dispatch time. Membership is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<PendingEntry>,
}

impl Batch {
    pub fn entries(&self) -> &[PendingEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &SyncableKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    pub fn contains(&self, key: &SyncableKey) -> bool {
        self.keys().any(|candidate| candidate == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<PendingEntry>) -> Self {
        Self { entries }
    }
}

/// The PendingSet plus the batching policy: immediate keys first, FIFO
/// within a priority class, at most `batch_size` keys per batch.
///
/// Keys handed out in a batch stay tracked as in flight until they are
/// settled or requeued, so a snapshot never loses them.
#[derive(Debug)]
pub struct ChangeTracker {
    batch_size: usize,
    priorities: HashMap<SyncableKey, Priority>,
    immediate: VecDeque<SyncableKey>,
    deferred: VecDeque<SyncableKey>,
    in_flight: HashMap<SyncableKey, Priority>,
}

impl ChangeTracker {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            priorities: HashMap::new(),
            immediate: VecDeque::new(),
            deferred: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns `true` when the key became pending or was upgraded.
    pub fn mark_changed(&mut self, key: SyncableKey, priority: Priority) -> bool {
        match self.priorities.get(&key).copied() {
            Some(current) if current >= priority => false,
            Some(_) => {
                self.deferred.retain(|pending| pending != &key);
                self.priorities.insert(key.clone(), priority);
                self.immediate.push_back(key);
                true
            }
            None => {
                self.priorities.insert(key.clone(), priority);
                match priority {
                    Priority::Immediate => self.immediate.push_back(key),
                    Priority::Deferred => self.deferred.push_back(key),
                }
                true
            }
        }
    }

    pub fn next_batch(&mut self) -> Option<Batch> {
        self.take_batch(|_| true)
    }

    /// Like [`next_batch`](Self::next_batch), restricted to keys accepted by
    /// `eligible`. Skipped keys keep their queue position.
    pub fn take_batch(&mut self, eligible: impl Fn(&SyncableKey) -> bool) -> Option<Batch> {
        let mut entries = Vec::with_capacity(self.batch_size.min(self.priorities.len()));
        for queue in [&mut self.immediate, &mut self.deferred] {
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(key) = queue.pop_front() {
                if entries.len() < self.batch_size && eligible(&key) {
                    let priority = self
                        .priorities
                        .remove(&key)
                        .unwrap_or(Priority::Deferred);
                    self.in_flight.insert(key.clone(), priority);
                    entries.push(PendingEntry { key, priority });
                } else {
                    kept.push_back(key);
                }
            }
            *queue = kept;
        }
        if entries.is_empty() {
            None
        } else {
            Some(Batch { entries })
        }
    }

    /// Marks an in-flight key as done: synced or dropped for good.
    pub fn settle(&mut self, key: &SyncableKey) {
        self.in_flight.remove(key);
    }

    /// Returns every listed key that is still in flight to the PendingSet.
    /// Used when a batch is abandoned before it reported.
    pub fn release(&mut self, keys: impl IntoIterator<Item = SyncableKey>) {
        for key in keys {
            if let Some(priority) = self.in_flight.remove(&key) {
                self.mark_changed(key, priority);
            }
        }
    }

    /// Puts keys back after a failed sync. A key re-marked in the meantime
    /// keeps the higher of the two priorities.
    pub fn requeue(&mut self, entries: impl IntoIterator<Item = PendingEntry>) {
        for entry in entries {
            self.in_flight.remove(&entry.key);
            self.mark_changed(entry.key, entry.priority);
        }
    }

    pub fn forget(&mut self, key: &SyncableKey) -> bool {
        let Some(priority) = self.priorities.remove(key) else {
            return false;
        };
        match priority {
            Priority::Immediate => self.immediate.retain(|pending| pending != key),
            Priority::Deferred => self.deferred.retain(|pending| pending != key),
        }
        true
    }

    pub fn priority_of(&self, key: &SyncableKey) -> Option<Priority> {
        self.priorities.get(key).copied()
    }

    pub fn has_immediate(&self) -> bool {
        !self.immediate.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Queued entries in dispatch order, then in-flight keys not queued
    /// again, for persistence.
    pub fn snapshot(&self) -> Vec<PendingEntry> {
        let queued = self
            .immediate
            .iter()
            .chain(self.deferred.iter())
            .filter_map(|key| {
                self.priorities
                    .get(key)
                    .map(|priority| PendingEntry::new(key.clone(), *priority))
            });
        let mut in_flight: Vec<PendingEntry> = self
            .in_flight
            .iter()
            .filter(|(key, _)| !self.priorities.contains_key(*key))
            .map(|(key, priority)| PendingEntry::new(key.clone(), *priority))
            .collect();
        in_flight.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
        queued.chain(in_flight).collect()
    }

    /// Keys not yet confirmed synced, in flight included.
    pub fn len(&self) -> usize {
        self.priorities.len()
            + self
                .in_flight
                .keys()
                .filter(|key| !self.priorities.contains_key(*key))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
