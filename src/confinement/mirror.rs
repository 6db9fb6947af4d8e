//! Asynchronous write-through to the durable store
//!
//! Memory is authoritative. The mirror copies every accepted mutation to the
//! [`DurableStore`] on background tasks, retrying transient failures, and
//! never feeds a failure back into the registry.
//!
//! Writes for one subject run one at a time under a per-subject lock that
//! also holds the revision watermark of the last applied write. A write that
//! is not newer than the watermark is skipped, so a late save cannot
//! overwrite a newer one or bring back a deleted row.
//!
//! The registry queues a write while it still holds the subject's entry, so
//! every older write has already taken a handle on the lock by the time a
//! delete is queued. Once a delete is the last applied write and no queued
//! write still holds the lock, the subject's watermark is dropped.

use crate::ERROR_TARGET;
use crate::confinement::{ConfinementRecord, DurableStore, StoreResult};
use crate::config::PersistenceConfig;
use crate::world::SubjectId;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A single durable operation
#[derive(Debug, Clone)]
enum Write {
    Save(ConfinementRecord),
    Delete(SubjectId),
}

impl Write {
    fn kind(&self) -> &'static str {
        match self {
            Self::Save(_) => "save",
            Self::Delete(_) => "delete",
        }
    }

    async fn apply(&self, store: &dyn DurableStore) -> StoreResult<()> {
        match self {
            Self::Save(record) => store.insert_or_replace(record).await,
            Self::Delete(subject) => store.delete(*subject).await,
        }
    }
}

/// Last applied revision for one subject
#[derive(Debug, Default)]
struct Watermark {
    revision: u64,
    /// The last applied write was a delete
    tombstone: bool,
}

/// Retry tuning for transient store failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }
}

/// Write-through adapter between the registry and the durable store
#[derive(Clone)]
pub struct PersistenceMirror {
    store: Arc<dyn DurableStore>,
    /// Per-subject lock guarding the last applied revision
    watermarks: Arc<DashMap<SubjectId, Arc<Mutex<Watermark>>>>,
    policy: RetryPolicy,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl PersistenceMirror {
    pub fn new(store: Arc<dyn DurableStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            watermarks: Arc::new(DashMap::new()),
            policy,
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Wait until every queued write has finished or given up
    pub async fn flush(&self) {
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Queue a whole-record write
    pub fn save_async(&self, record: ConfinementRecord) -> JoinHandle<()> {
        let subject = record.subject;
        let revision = record.revision;
        self.spawn(subject, revision, Write::Save(record))
    }

    /// Queue deletion of a subject's row at `revision`
    pub fn delete_async(&self, subject: SubjectId, revision: u64) -> JoinHandle<()> {
        self.spawn(subject, revision, Write::Delete(subject))
    }

    /// Read every durable row; used once at startup
    ///
    /// # Errors
    /// Returns the store error once retries for transient failures run out.
    pub async fn load_all(&self) -> StoreResult<Vec<ConfinementRecord>> {
        let mut attempt = 1;
        loop {
            match self.store.load_all().await {
                Ok(records) => {
                    for record in &records {
                        let lock = self.lock_for(record.subject);
                        if let Ok(mut watermark) = lock.try_lock() {
                            watermark.revision = watermark.revision.max(record.revision);
                        }
                    }
                    return Ok(records);
                }
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    warn!("Durable load failed on attempt {attempt}, retrying: {e}");
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Subjects with a tracked watermark
    pub fn tracked_subjects(&self) -> usize {
        self.watermarks.len()
    }

    fn lock_for(&self, subject: SubjectId) -> Arc<Mutex<Watermark>> {
        Arc::clone(
            self.watermarks
                .entry(subject)
                .or_insert_with(|| Arc::new(Mutex::new(Watermark::default())))
                .value(),
        )
    }

    fn spawn(&self, subject: SubjectId, revision: u64, write: Write) -> JoinHandle<()> {
        let lock = self.lock_for(subject);
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let in_flight = Arc::clone(&self.in_flight);
        let drained = Arc::clone(&self.drained);
        in_flight.fetch_add(1, Ordering::SeqCst);
        let watermarks = Arc::clone(&self.watermarks);
        tokio::spawn(async move {
            let tombstone =
                apply_if_newer(store.as_ref(), &lock, write, subject, revision, policy).await;
            if tombstone {
                // dropped only while the map and this task are the sole holders
                watermarks.remove_if(&subject, |_, current| {
                    Arc::ptr_eq(current, &lock) && Arc::strong_count(current) == 2
                });
            }
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        })
    }
}

/// Apply `write` unless a newer one already landed; returns whether the
/// subject's last applied write is a delete
async fn apply_if_newer(
    store: &dyn DurableStore,
    lock: &Mutex<Watermark>,
    write: Write,
    subject: SubjectId,
    revision: u64,
    policy: RetryPolicy,
) -> bool {
    let mut watermark = lock.lock().await;
    if revision <= watermark.revision {
        debug!(
            subject = %subject,
            revision,
            watermark = watermark.revision,
            op = write.kind(),
            "Skipping stale durable write"
        );
        return watermark.tombstone;
    }
    // the watermark moves even on failure so older writes stay skipped
    watermark.revision = revision;
    watermark.tombstone = matches!(write, Write::Delete(_));
    apply_with_retry(store, &write, subject, revision, policy).await;
    watermark.tombstone
}

async fn apply_with_retry(
    store: &dyn DurableStore,
    write: &Write,
    subject: SubjectId,
    revision: u64,
    policy: RetryPolicy,
) {
    let mut attempt = 1;
    loop {
        match write.apply(store).await {
            Ok(()) => {
                debug!(subject = %subject, revision, op = write.kind(), "Durable write applied");
                return;
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    subject = %subject,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Durable {} failed, retrying: {e}",
                    write.kind()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    target: ERROR_TARGET,
                    subject = %subject,
                    revision,
                    attempts = attempt,
                    op = write.kind(),
                    error = %e,
                    "Durability miss: durable {} abandoned, memory keeps the change",
                    write.kind()
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confinement::{ConfineRequest, MemoryStore, MockDurableStore, StoreError};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(revision: u64) -> ConfinementRecord {
        let request = ConfineRequest {
            subject: SubjectId::random(),
            display_name: "Alex".to_string(),
            cell: "north".to_string(),
            staff: "Admin".to_string(),
            reason: "spam".to_string(),
            duration_ms: 60_000,
            labor_required: 0,
        };
        let mut record = ConfinementRecord::issued_at(&request, Utc::now());
        record.revision = revision;
        record
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_store_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let mirror = PersistenceMirror::new(store.clone(), RetryPolicy::default());
        let record = record(1);

        store.fail_next(3);
        mirror.save_async(record.clone()).await.unwrap();

        assert_eq!(store.row(record.subject), Some(record));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_give_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut store = MockDurableStore::new();
        store.expect_insert_or_replace().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Busy("locked".to_string()))
        });

        let mirror = PersistenceMirror::new(Arc::new(store), RetryPolicy::default());
        mirror.save_async(record(1)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let mut store = MockDurableStore::new();
        store.expect_insert_or_replace().times(1).returning(|_| {
            Err(StoreError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )))
        });

        let mirror = PersistenceMirror::new(Arc::new(store), RetryPolicy::default());
        mirror.save_async(record(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_save_cannot_resurrect_deleted_row() {
        let store = Arc::new(MemoryStore::new());
        let mirror = PersistenceMirror::new(store.clone(), RetryPolicy::default());
        let record = record(1);
        let subject = record.subject;

        mirror.save_async(record.clone()).await.unwrap();
        store.fail_next(1);
        let delete = mirror.delete_async(subject, 3);

        // a save stamped before the delete arrives while it is retrying
        let mut late = record;
        late.revision = 2;
        let save = mirror.save_async(late);
        delete.await.unwrap();
        save.await.unwrap();

        assert!(store.row(subject).is_none());
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.delete_count(), 1);
        assert_eq!(mirror.tracked_subjects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_save_wins_over_older() {
        let store = Arc::new(MemoryStore::new());
        let mirror = PersistenceMirror::new(store.clone(), RetryPolicy::default());

        let mut newer = record(5);
        newer.labor_progress = 0;
        let mut older = newer.clone();
        older.revision = 4;

        mirror.save_async(newer.clone()).await.unwrap();
        mirror.save_async(older).await.unwrap();

        assert_eq!(store.row(newer.subject).unwrap().revision, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_all_sets_watermarks() {
        let store = Arc::new(MemoryStore::new());
        let loaded = record(9);
        store.insert_or_replace(&loaded).await.unwrap();

        let mirror = PersistenceMirror::new(store.clone(), RetryPolicy::default());
        assert_eq!(mirror.load_all().await.unwrap().len(), 1);

        let mut stale = loaded.clone();
        stale.revision = 8;
        stale.reason = "stale".to_string();
        mirror.save_async(stale).await.unwrap();
        assert_eq!(store.row(loaded.subject).unwrap().reason, "spam");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_retrying_writes() {
        let store = Arc::new(MemoryStore::new());
        let mirror = PersistenceMirror::new(store.clone(), RetryPolicy::default());
        let first = record(1);
        let second = record(1);

        store.fail_next(2);
        drop(mirror.save_async(first.clone()));
        drop(mirror.save_async(second.clone()));
        mirror.flush().await;

        assert_eq!(store.row(first.subject), Some(first));
        assert_eq!(store.row(second.subject), Some(second));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_applied_delete_drops_watermark() {
        let store = Arc::new(MemoryStore::new());
        let mirror = PersistenceMirror::new(store.clone(), RetryPolicy::default());
        let first = record(1);
        let subject = first.subject;

        mirror.save_async(first).await.unwrap();
        assert_eq!(mirror.tracked_subjects(), 1);
        mirror.delete_async(subject, 2).await.unwrap();
        assert_eq!(mirror.tracked_subjects(), 0);
        assert!(store.row(subject).is_none());

        // a later confinement of the same subject starts a fresh watermark
        let mut again = record(3);
        again.subject = subject;
        mirror.save_async(again.clone()).await.unwrap();
        assert_eq!(store.row(subject), Some(again));
        assert_eq!(mirror.tracked_subjects(), 1);
    }
}
