//! Bounded per-host apply history keyed by plan version.

use std::collections::BTreeMap;

use common::api::{ApplyHistoryEntry, ApplyStatus, Protocol};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The version already carried the same status, message, and protocol set.
    Unchanged,
    /// The version's entry was replaced.
    Updated,
    /// A new version was recorded, possibly evicting the oldest entry.
    Inserted { evicted: Option<u64> },
}

impl UpsertOutcome {
    pub fn recorded(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Fixed-capacity map of version to outcome. Eviction removes the entry recorded longest ago.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ApplyHistoryEntry>", into = "Vec<ApplyHistoryEntry>")]
pub struct ApplyHistory {
    entries: BTreeMap<u64, ApplyHistoryEntry>,
}

pub fn normalize_protocols(protocols: &[Protocol]) -> Vec<Protocol> {
    let mut sorted = protocols.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

impl ApplyHistory {
    pub fn upsert(&mut self, mut entry: ApplyHistoryEntry, capacity: usize) -> UpsertOutcome {
        entry.protocols = normalize_protocols(&entry.protocols);

        if let Some(existing) = self.entries.get_mut(&entry.version) {
            if existing.status == entry.status
                && existing.message == entry.message
                && existing.protocols == entry.protocols
            {
                return UpsertOutcome::Unchanged;
            }
            *existing = entry;
            return UpsertOutcome::Updated;
        }

        self.entries.insert(entry.version, entry);
        let mut evicted = None;
        while self.entries.len() > capacity.max(1) {
            evicted = self.evict_oldest();
        }
        UpsertOutcome::Inserted { evicted }
    }

    fn evict_oldest(&mut self) -> Option<u64> {
        let victim = self
            .entries
            .values()
            .min_by_key(|entry| (entry.at, entry.version))
            .map(|entry| entry.version)?;
        self.entries.remove(&victim);
        Some(victim)
    }

    pub fn get(&self, version: u64) -> Option<&ApplyHistoryEntry> {
        self.entries.get(&version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by recording time, newest first.
    pub fn newest_first(&self) -> Vec<ApplyHistoryEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| (b.at, b.version).cmp(&(a.at, a.version)));
        entries
    }

    pub fn failures(&self) -> Vec<ApplyHistoryEntry> {
        self.newest_first()
            .into_iter()
            .filter(|entry| entry.status == ApplyStatus::Failed)
            .collect()
    }
}

impl From<Vec<ApplyHistoryEntry>> for ApplyHistory {
    fn from(entries: Vec<ApplyHistoryEntry>) -> Self {
        let mut history = ApplyHistory::default();
        for entry in entries {
            history.entries.insert(entry.version, entry);
        }
        history
    }
}

impl From<ApplyHistory> for Vec<ApplyHistoryEntry> {
    fn from(history: ApplyHistory) -> Self {
        history.newest_first()
    }
}
