//! File-backed job store.
//!
//! All jobs live in one JSON document holding an ordered array of records.
//! Writers hold an exclusive advisory lock on a sibling `<document>.lock`
//! file and always re-read the document before merging, so two concurrent
//! updates can never overwrite each other, whether they come from one process
//! or from several processes sharing the data directory. Every write lands in
//! its own temporary sibling first and is renamed into place, which lets
//! readers take consistent snapshots without the lock.

use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::models::job::{Job, JobPatch, JobStatus, TransitionError};

pub struct JobStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes writers of this instance before they contend for the file lock.
    write_lock: Mutex<()>,
}

/// Exclusive hold on the document. Dropping it closes the lock file, which
/// releases the advisory lock.
struct WriteGuard<'a> {
    _file: File,
    _local: MutexGuard<'a, ()>,
}

impl JobStore {
    /// Open the document at `path`, creating an empty one if absent.
    ///
    /// A document that exists but cannot be parsed is reported as
    /// [`StoreError::Corrupt`] and left untouched.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let store = Self {
            path,
            lock_path: PathBuf::from(lock_path),
            write_lock: Mutex::new(()),
        };

        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        {
            let _guard = store.lock().await?;
            if !tokio::fs::try_exists(&store.path).await? {
                tracing::info!(path = %store.path.display(), "Initializing empty job store");
                store.write_all(&[]).await?;
            }
        }

        let jobs = store.load().await?;
        tracing::info!(path = %store.path.display(), jobs = jobs.len(), "Job store loaded");
        Ok(store)
    }

    /// Like [`JobStore::open`], but a corrupt document is moved aside and
    /// replaced by an empty one. Only used when the operator asks for it.
    pub async fn open_or_reinitialize(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        match Self::open(path.clone()).await {
            Err(StoreError::Corrupt { path: corrupt, source }) => {
                let backup = corrupt.with_extension(format!(
                    "json.corrupt-{}",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                tracing::warn!(
                    path = %corrupt.display(),
                    backup = %backup.display(),
                    error = %source,
                    "Job store is corrupt, moving it aside and reinitializing"
                );
                tokio::fs::rename(&corrupt, &backup).await?;
                Self::open(path).await
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record from the document, in insertion order.
    pub async fn load(&self) -> Result<Vec<Job>, StoreError> {
        let bytes = tokio::fs::read(&self.path).await?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the whole record set.
    pub async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let _guard = self.lock().await?;
        self.write_all(jobs).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.load().await?.into_iter().find(|job| job.id == id))
    }

    /// Append a new record. Ids are unique for the lifetime of the store.
    pub async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let _guard = self.lock().await?;
        let mut jobs = self.load().await?;
        if jobs.iter().any(|existing| existing.id == job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        jobs.push(job);
        self.write_all(&jobs).await
    }

    /// Merge `patch` into the record with `id` and persist the result.
    ///
    /// An unknown id is a silent no-op and yields `Ok(None)`. A patch that
    /// would break the job state machine is rejected and nothing is written.
    pub async fn upsert(&self, id: &str, patch: JobPatch) -> Result<Option<Job>, StoreError> {
        let _guard = self.lock().await?;
        let mut jobs = self.load().await?;

        let Some(job) = jobs.iter_mut().find(|job| job.id == id) else {
            tracing::debug!(job_id = %id, "Ignoring update for unknown job");
            return Ok(None);
        };

        let from = job.status;
        let to = patch.status.unwrap_or(from);
        job.apply(patch).map_err(|reason| StoreError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
            reason,
        })?;
        let updated = job.clone();

        self.write_all(&jobs).await?;
        Ok(Some(updated))
    }

    /// Take the document's write lock: first this instance's mutex, then the
    /// advisory lock on the lock file, which other instances and processes
    /// contend for too.
    async fn lock(&self) -> Result<WriteGuard<'_>, StoreError> {
        let local = self.write_lock.lock().await;
        let lock_path = self.lock_path.clone();
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(WriteGuard {
            _file: file,
            _local: local,
        })
    }

    /// Callers must hold [`JobStore::lock`].
    async fn write_all(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(jobs)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job id {0} already exists")]
    DuplicateId(String),

    #[error("Job {id} cannot move from {from} to {to}: {reason}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
        #[source]
        reason: TransitionError,
    },
}

pub mod queries;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{Aoi, JobInputs};

    fn sample_job() -> Job {
        Job::new(JobInputs {
            image_a_id: "a.tif".to_string(),
            image_b_id: "b.tif".to_string(),
            aoi: Aoi {
                north: 10.0,
                south: 0.0,
                east: 10.0,
                west: 0.0,
            },
        })
    }

    #[tokio::test]
    async fn test_open_initializes_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.json");
        let store = JobStore::open(&path).await.unwrap();

        assert!(store.load().await.unwrap().is_empty());
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.trim(), "[]");
    }

    #[tokio::test]
    async fn test_open_refuses_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JobStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        // The operator's data is left in place.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn test_reinitialize_moves_corrupt_document_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "garbage").unwrap();

        let store = JobStore::open_or_reinitialize(&path).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("jobs.json")).await.unwrap();
        let job = sample_job();

        store.insert(job.clone()).await.unwrap();
        assert_eq!(store.find_by_id(&job.id).await.unwrap(), Some(job.clone()));
        assert!(store.find_by_id("missing").await.unwrap().is_none());

        let err = store.insert(job).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_upsert_unknown_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("jobs.json")).await.unwrap();
        store.insert(sample_job()).await.unwrap();
        let before = store.load().await.unwrap();

        let result = store.upsert("nope", JobPatch::running()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.load().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_upsert_rejects_illegal_transition() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("jobs.json")).await.unwrap();
        let job = sample_job();
        store.insert(job.clone()).await.unwrap();
        store.upsert(&job.id, JobPatch::failed("boom")).await.unwrap();

        let err = store
            .upsert(&job.id, JobPatch::running())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Error,
                to: JobStatus::Running,
                ..
            }
        ));
        let stored = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_save_replaces_record_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("jobs.json")).await.unwrap();
        let jobs = vec![sample_job(), sample_job()];

        store.save(&jobs).await.unwrap();
        assert_eq!(store.load().await.unwrap(), jobs);

        let reopened = JobStore::open(store.path()).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), jobs);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JobStore::open(dir.path().join("jobs.json")).await.unwrap());
        let jobs: Vec<Job> = (0..16).map(|_| sample_job()).collect();
        for job in &jobs {
            store.insert(job.clone()).await.unwrap();
        }

        let tasks: Vec<_> = jobs
            .iter()
            .map(|job| {
                let store = store.clone();
                let id = job.id.clone();
                tokio::spawn(async move { store.upsert(&id, JobPatch::running()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = store.load().await.unwrap();
        assert_eq!(stored.len(), 16);
        assert!(stored.iter().all(|job| job.status == JobStatus::Running));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_instances_share_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let first = std::sync::Arc::new(JobStore::open(&path).await.unwrap());
        let second = std::sync::Arc::new(JobStore::open(&path).await.unwrap());

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let store = if i % 2 == 0 { first.clone() } else { second.clone() };
                tokio::spawn(async move { store.insert(sample_job()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(first.load().await.unwrap().len(), 40);
        assert_eq!(second.load().await.unwrap().len(), 40);

        // No temporary files are left next to the document.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "jobs.json" && name != "jobs.json.lock")
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
