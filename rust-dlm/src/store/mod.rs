//! Durable job store.
//!
//! A single JSON document `{ "jobs": [...] }` with whole-collection
//! read/replace semantics. Every mutation goes through [`JobStore::mutate`],
//! which holds the writer lock across the full load, apply, save cycle so
//! interleaved mutations cannot lose updates.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;
use crate::job::Job;

/// Persisted document shape. No schema version: an unreadable file is
/// replaced with an empty document rather than migrated or surfaced.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsDocument {
    jobs: Vec<Job>,
}

/// File-backed job collection.
pub struct JobStore {
    path: PathBuf,
    /// Serializes mutations; readers go through it too, since a read racing
    /// a temp-file rename could observe a missing file.
    write_lock: Mutex<()>,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole collection.
    pub async fn get_all(&self) -> Result<Vec<Job>> {
        let _guard = self.write_lock.lock().await;
        self.load().await
    }

    /// Replace the whole collection.
    pub async fn save_all(&self, jobs: &[Job]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.persist(jobs).await
    }

    /// Single-writer transactional mutation: load, apply `f`, save.
    ///
    /// Returns whatever `f` returns, letting callers extract the jobs they
    /// touched without a second read.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Job>) -> T) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load().await?;
        let out = f(&mut jobs);
        self.persist(&jobs).await?;
        Ok(out)
    }

    async fn load(&self) -> Result<Vec<Job>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "job store file absent, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<JobsDocument>(&bytes) {
            Ok(doc) => Ok(doc.jobs),
            Err(e) => {
                // Corruption must never crash the engine: fall back to an
                // empty collection and overwrite with a fresh document.
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "job store unreadable, replacing with empty document"
                );
                self.persist(&[]).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn persist(&self, jobs: &[Job]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let doc = JobsDocument {
            jobs: jobs.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        // Write-then-rename so a crash mid-write cannot corrupt the store.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
