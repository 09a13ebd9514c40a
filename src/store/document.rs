//! JSON document store
//!
//! Keeps the record set in memory and rewrites the whole document on every
//! mutation (temp file + rename, so a crash never leaves a torn file).
//! A mutation is applied to a copy, written out, and only then swapped in;
//! a failed write leaves memory matching the file.

use super::memory::RecordSet;
use super::record::{EventFilter, EventId, EventRecord, EventStatus};
use super::{EventStore, StoreError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct DocumentStore {
    path: PathBuf,
    records: RwLock<RecordSet>,
}

impl DocumentStore {
    /// Open the document at `path`, loading existing records if it exists
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let records: Vec<EventRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            records = records.len(),
            "Opened event document store"
        );

        Ok(Self {
            path,
            records: RwLock::new(RecordSet::from_records(records)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &RecordSet) -> Result<(), StoreError> {
        let document = serde_json::to_vec_pretty(records.records())?;
        let temp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&temp_path, &document).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), bytes = document.len(), "Persisted event document");
        Ok(())
    }
}

#[async_trait]
impl EventStore for DocumentStore {
    async fn insert(&self, record: EventRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let mut candidate = records.clone();
        candidate.insert(record)?;
        self.persist(&candidate).await?;
        *records = candidate;
        Ok(())
    }

    async fn update(&self, id: EventId, status: EventStatus) -> Result<EventStatus, StoreError> {
        let mut records = self.records.write().await;
        let mut candidate = records.clone();
        let (status, changed) = candidate.update(id, status)?;
        if changed {
            self.persist(&candidate).await?;
            *records = candidate;
        }
        Ok(status)
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.records.read().await.query(filter))
    }

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.records.read().await.get(id))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().await.len())
    }
}
