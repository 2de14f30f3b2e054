use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use super::store::RemoteRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Lost its duplicate group to the record named `survivor`.
    Superseded { survivor: String },
    /// Corrupt record: no usable identifier. Never retried.
    MissingIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discard {
    pub record: RemoteRecord,
    pub reason: DiscardReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// One record per identifier, sorted by identifier.
    pub survivors: Vec<RemoteRecord>,
    /// Sorted by (identifier, record name).
    pub discards: Vec<Discard>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.discards.is_empty()
    }

    /// Survivors that beat at least one duplicate.
    pub fn contested_survivors(&self) -> impl Iterator<Item = &RemoteRecord> {
        let winners: Vec<&str> = self
            .discards
            .iter()
            .filter_map(|discard| match &discard.reason {
                DiscardReason::Superseded { survivor } => Some(survivor.as_str()),
                DiscardReason::MissingIdentifier => None,
            })
            .collect();
        self.survivors
            .iter()
            .filter(move |record| winners.contains(&record.record_name.as_str()))
    }
}

/// Last-writer-wins order: `updated_at`, then `created_at`, record name and
/// payload bytes so that the winner never depends on input order.
fn newer(a: &RemoteRecord, b: &RemoteRecord) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.record_name.cmp(&b.record_name))
        .then_with(|| a.payload.cmp(&b.payload))
}

fn usable_identifier(record: &RemoteRecord) -> Option<&str> {
    record
        .identifier
        .as_deref()
        .filter(|id| !id.trim().is_empty())
}

/// Selects one survivor per identifier and lists everything else for
/// deletion. Pure; running it on its own survivors yields no discards.
pub fn reconcile(records: impl IntoIterator<Item = RemoteRecord>) -> Reconciliation {
    // Entries sharing a record name are versions of one physical record
    // (e.g. the local and remote copy after a merge), not duplicates.
    let mut by_name: HashMap<String, RemoteRecord> = HashMap::new();
    for record in records {
        let replace = by_name
            .get(&record.record_name)
            .is_none_or(|existing| newer(existing, &record) == Ordering::Less);
        if replace {
            by_name.insert(record.record_name.clone(), record);
        }
    }

    let mut groups: BTreeMap<String, Vec<RemoteRecord>> = BTreeMap::new();
    let mut discards = Vec::new();
    for record in by_name.into_values() {
        match usable_identifier(&record) {
            Some(id) => groups.entry(id.to_string()).or_default().push(record),
            None => {
                warn!(
                    record = %record.record_name,
                    "discarding record without identifier"
                );
                discards.push(Discard {
                    record,
                    reason: DiscardReason::MissingIdentifier,
                });
            }
        }
    }

    let mut survivors = Vec::with_capacity(groups.len());
    for (_, mut group) in groups {
        group.sort_by(|a, b| newer(b, a));
        let mut members = group.into_iter();
        let Some(survivor) = members.next() else {
            continue;
        };
        for loser in members {
            discards.push(Discard {
                record: loser,
                reason: DiscardReason::Superseded {
                    survivor: survivor.record_name.clone(),
                },
            });
        }
        survivors.push(survivor);
    }

    discards.sort_by(|a, b| {
        a.record
            .identifier
            .cmp(&b.record.identifier)
            .then_with(|| a.record.record_name.cmp(&b.record.record_name))
    });

    Reconciliation {
        survivors,
        discards,
    }
}
