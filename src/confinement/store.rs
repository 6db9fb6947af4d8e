//! Durable confinement storage
//!
//! The engine only needs a key/value-by-subject table. [`DurableStore`] is
//! that contract; [`MemoryStore`] and [`YamlStore`] implement it.

use crate::confinement::{ConfinementRecord, StoreError, StoreResult};
use crate::world::SubjectId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Whole-record CRUD over the durable confinement table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write the full record, replacing any existing row for its subject
    async fn insert_or_replace(&self, record: &ConfinementRecord) -> StoreResult<()>;

    /// Delete the row for a subject; deleting a missing row succeeds
    async fn delete(&self, subject: SubjectId) -> StoreResult<()>;

    /// Every stored row
    async fn load_all(&self) -> StoreResult<Vec<ConfinementRecord>>;
}

/// In-memory store with injectable busy failures
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<DashMap<SubjectId, ConfinementRecord>>,
    busy_failures: Arc<AtomicU32>,
    writes: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with [`StoreError::Busy`]
    pub fn fail_next(&self, count: u32) {
        self.busy_failures.store(count, Ordering::SeqCst);
    }

    /// Stored row for a subject
    pub fn row(&self, subject: SubjectId) -> Option<ConfinementRecord> {
        self.rows.get(&subject).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of successful writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of successful deletes
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check_busy(&self) -> StoreResult<()> {
        let consumed = self
            .busy_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Busy("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_or_replace(&self, record: &ConfinementRecord) -> StoreResult<()> {
        self.check_busy()?;
        self.rows.insert(record.subject, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, subject: SubjectId) -> StoreResult<()> {
        self.check_busy()?;
        self.rows.remove(&subject);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<ConfinementRecord>> {
        self.check_busy()?;
        Ok(self.rows.iter().map(|r| r.value().clone()).collect())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct YamlDocument {
    #[serde(default)]
    confinements: Vec<ConfinementRecord>,
}

/// Store keeping every row in one YAML document
///
/// Each write rewrites the whole file through a temporary sibling and a
/// rename. A missing file reads as an empty table.
pub struct YamlStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl YamlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> StoreResult<YamlDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(YamlDocument::default()),
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(YamlDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, mut document: YamlDocument) -> StoreResult<()> {
        document.confinements.sort_by_key(|r| r.subject);
        let content = serde_yaml::to_string(&document)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            path = %self.path.display(),
            rows = document.confinements.len(),
            "Wrote confinement table"
        );
        Ok(())
    }
}

#[async_trait]
impl DurableStore for YamlStore {
    async fn insert_or_replace(&self, record: &ConfinementRecord) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        document.confinements.retain(|r| r.subject != record.subject);
        document.confinements.push(record.clone());
        self.write(document).await
    }

    async fn delete(&self, subject: SubjectId) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        let before = document.confinements.len();
        document.confinements.retain(|r| r.subject != subject);
        if document.confinements.len() == before {
            return Ok(());
        }
        self.write(document).await
    }

    async fn load_all(&self) -> StoreResult<Vec<ConfinementRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.confinements)
    }
}
