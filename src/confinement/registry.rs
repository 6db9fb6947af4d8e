//! Confinement registry
//!
//! The authoritative in-memory map of confined subjects. Every accepted
//! mutation gets a fresh revision and is handed to the [`PersistenceMirror`]
//! without waiting for it.

use crate::confinement::{ConfinementRecord, PersistenceMirror};
use crate::world::SubjectId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Registry of active confinements
#[derive(Clone, Default)]
pub struct ConfinementRegistry {
    records: Arc<DashMap<SubjectId, ConfinementRecord>>,
    revision: Arc<AtomicU64>,
    mirror: Option<PersistenceMirror>,
}

impl ConfinementRegistry {
    /// Create a registry with no durable mirror
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that mirrors every mutation
    pub fn with_mirror(mirror: PersistenceMirror) -> Self {
        Self {
            mirror: Some(mirror),
            ..Self::default()
        }
    }

    pub fn mirror(&self) -> Option<&PersistenceMirror> {
        self.mirror.as_ref()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn queue_save(&self, record: &ConfinementRecord) {
        if let Some(mirror) = &self.mirror {
            mirror.save_async(record.clone());
        }
    }

    /// Store a record, replacing and returning any previous one
    ///
    /// The revision is stamped and the write queued while the entry is
    /// locked, so both order against concurrent `modify` and `remove` calls
    /// for the same subject.
    pub fn put(&self, mut record: ConfinementRecord) -> Option<ConfinementRecord> {
        match self.records.entry(record.subject) {
            Entry::Occupied(mut entry) => {
                record.revision = self.next_revision();
                self.queue_save(&record);
                Some(entry.insert(record))
            }
            Entry::Vacant(entry) => {
                record.revision = self.next_revision();
                self.queue_save(&record);
                entry.insert(record);
                None
            }
        }
    }

    pub fn get(&self, subject: SubjectId) -> Option<ConfinementRecord> {
        self.records.get(&subject).map(|r| r.value().clone())
    }

    pub fn contains(&self, subject: SubjectId) -> bool {
        self.records.contains_key(&subject)
    }

    /// Remove a record; a second call for the same subject returns `None`
    pub fn remove(&self, subject: SubjectId) -> Option<ConfinementRecord> {
        match self.records.entry(subject) {
            Entry::Occupied(entry) => {
                let revision = self.next_revision();
                if let Some(mirror) = &self.mirror {
                    mirror.delete_async(subject, revision);
                }
                Some(entry.remove())
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Mutate a record in place
    ///
    /// `f` returns whether it changed anything; only then is the record
    /// restamped and mirrored. Returns the record as it is after `f`.
    pub fn modify(
        &self,
        subject: SubjectId,
        f: impl FnOnce(&mut ConfinementRecord) -> bool,
    ) -> Option<ConfinementRecord> {
        let mut entry = self.records.get_mut(&subject)?;
        if f(entry.value_mut()) {
            entry.revision = self.next_revision();
            self.queue_save(entry.value());
        }
        Some(entry.value().clone())
    }

    /// Snapshot of every record
    pub fn all(&self) -> Vec<ConfinementRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Load records read from durable storage without writing them back
    pub fn hydrate(&self, records: impl IntoIterator<Item = ConfinementRecord>) -> usize {
        let mut loaded = 0;
        for record in records {
            self.revision.fetch_max(record.revision, Ordering::SeqCst);
            self.records.insert(record.subject, record);
            loaded += 1;
        }
        loaded
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confinement::{ConfineRequest, MemoryStore, RetryPolicy};
    use chrono::{Duration, Utc};

    fn record(labor_required: u32) -> ConfinementRecord {
        let request = ConfineRequest {
            subject: SubjectId::random(),
            display_name: "Alex".to_string(),
            cell: "north".to_string(),
            staff: "Admin".to_string(),
            reason: "spam".to_string(),
            duration_ms: 10_000,
            labor_required,
        };
        ConfinementRecord::issued_at(&request, Utc::now())
    }

    #[test]
    fn test_put_get_round_trip() {
        let registry = ConfinementRegistry::new();
        let record = record(0);
        let subject = record.subject;

        assert!(registry.put(record.clone()).is_none());
        let stored = registry.get(subject).unwrap();
        assert_eq!(stored.expires_at, stored.created_at + Duration::milliseconds(10_000));
        assert_eq!(stored.cell, "north");
        assert_eq!(stored.revision, 1);
        assert!(registry.contains(subject));
    }

    #[test]
    fn test_put_replaces_existing_record() {
        let registry = ConfinementRegistry::new();
        let first = record(0);
        let mut second = record(4);
        second.subject = first.subject;

        registry.put(first.clone());
        let previous = registry.put(second).unwrap();
        assert_eq!(previous.labor_required, 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first.subject).unwrap().labor_required, 4);
    }

    #[test]
    fn test_remove_twice_is_noop() {
        let registry = ConfinementRegistry::new();
        let record = record(0);
        registry.put(record.clone());

        assert!(registry.remove(record.subject).is_some());
        assert!(registry.remove(record.subject).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_modify_only_restamps_changes() {
        let registry = ConfinementRegistry::new();
        let record = record(2);
        registry.put(record.clone());

        let unchanged = registry.modify(record.subject, |_| false).unwrap();
        assert_eq!(unchanged.revision, 1);

        let changed = registry
            .modify(record.subject, ConfinementRecord::add_labor)
            .unwrap();
        assert_eq!(changed.labor_progress, 1);
        assert_eq!(changed.revision, 2);

        assert!(registry.modify(SubjectId::random(), |_| true).is_none());
    }

    #[test]
    fn test_hydrate_continues_revisions() {
        let registry = ConfinementRegistry::new();
        let mut loaded = record(0);
        loaded.revision = 41;
        assert_eq!(registry.hydrate(vec![loaded.clone()]), 1);

        let updated = registry.modify(loaded.subject, |_| true).unwrap();
        assert_eq!(updated.revision, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_reach_durable_store() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConfinementRegistry::with_mirror(PersistenceMirror::new(
            store.clone(),
            RetryPolicy::default(),
        ));
        let record = record(3);
        let subject = record.subject;

        registry.put(record);
        registry.modify(subject, ConfinementRecord::add_labor);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.row(subject).unwrap().labor_progress, 1);

        registry.remove(subject);
        registry.remove(subject);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(store.row(subject).is_none());
        assert_eq!(store.delete_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_matches_memory_after_concurrent_put_and_modify() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConfinementRegistry::with_mirror(PersistenceMirror::new(
            store.clone(),
            RetryPolicy::default(),
        ));

        let mut subjects = Vec::new();
        for _ in 0..50 {
            let original = record(1000);
            let subject = original.subject;
            registry.put(original);

            let mut replacement = record(7);
            replacement.subject = subject;

            let laboring = registry.clone();
            let worker = tokio::task::spawn_blocking(move || {
                for _ in 0..20 {
                    laboring.modify(subject, ConfinementRecord::add_labor);
                }
            });
            let confining = registry.clone();
            let admin = tokio::task::spawn_blocking(move || {
                confining.put(replacement);
            });
            worker.await.unwrap();
            admin.await.unwrap();
            subjects.push(subject);
        }

        registry.mirror().unwrap().flush().await;
        for subject in subjects {
            assert_eq!(store.row(subject), registry.get(subject));
        }
    }

    #[test]
    fn test_put_after_modify_gets_newer_revision() {
        let registry = ConfinementRegistry::new();
        let first = record(2);
        let subject = first.subject;
        registry.put(first);
        let modified = registry.modify(subject, ConfinementRecord::add_labor).unwrap();

        let mut replacement = record(0);
        replacement.subject = subject;
        registry.put(replacement);
        assert!(registry.get(subject).unwrap().revision > modified.revision);
    }
}
