//! Session metadata persistence.
//!
//! Writes are best effort from the controller's point of view: a failed write is
//! logged and reported to observers, and the session still ends.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::session::{SessionId, SessionRecord};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Called once while the controller initializes.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, record: &SessionRecord) -> Result<()>;
}

/// One pretty-printed JSON file per session, named after the session id.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_str()))
    }

    pub async fn read(&self, id: &SessionId) -> Result<SessionRecord> {
        let path = self.path_for(id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create metadata dir {}", self.dir.display()))
    }

    async fn write(&self, record: &SessionRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create metadata dir {}", self.dir.display()))?;

        let json = serde_json::to_vec_pretty(record).context("failed to serialize session")?;
        let path = self.path_for(&record.id);
        let tmp = path.with_extension("json.tmp");

        // Write-then-rename so readers never see a half-written file.
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {} into place", path.display()))?;

        debug!(session_id = %record.id, path = %path.display(), "session metadata written");
        Ok(())
    }
}

/// Keeps records in memory. Writes can be switched to fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<SessionRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn write(&self, record: &SessionRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("metadata store unavailable");
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EndReason;
    use chrono::Utc;

    fn record(id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: SessionId::new(id),
            capture_id: "sim-1".to_string(),
            started_at: now,
            ended_at: now,
            pause_intervals: Vec::new(),
            paused_ms: 0,
            active_ms: 0,
            frame_count: Some(12),
            capture_duration_ms: Some(400),
            max_duration_secs: None,
            end_reason: EndReason::Requested,
            error: None,
        }
    }

    #[tokio::test]
    async fn json_store_writes_one_file_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/sessions"));

        store.write(&record("session-a")).await.unwrap();
        store.write(&record("session-b")).await.unwrap();

        let back = store.read(&SessionId::new("session-a")).await.unwrap();
        assert_eq!(back, record_with_times(&back, "session-a"));
        assert!(store.path_for(&SessionId::new("session-b")).exists());
        assert!(!store.dir().join("session-a.json.tmp").exists());
    }

    fn record_with_times(existing: &SessionRecord, id: &str) -> SessionRecord {
        SessionRecord {
            started_at: existing.started_at,
            ended_at: existing.ended_at,
            ..record(id)
        }
    }

    #[tokio::test]
    async fn memory_store_can_fail() {
        let store = MemoryStore::new();
        store.write(&record("ok")).await.unwrap();

        store.set_fail_writes(true);
        assert!(store.write(&record("lost")).await.is_err());
        assert_eq!(store.records().len(), 1);
    }
}
