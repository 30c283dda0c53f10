//! Durable job persistence.
//!
//! The engine saves the job after every status change and every row result,
//! so a crash loses at most the row that was in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::job::{BatchJob, valid_job_id};
use crate::error::ShipflowError;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &BatchJob) -> Result<(), ShipflowError>;

    /// Fails with [`ShipflowError::JobNotFound`] for unknown ids.
    async fn load(&self, job_id: &str) -> Result<BatchJob, ShipflowError>;

    /// All stored jobs, oldest first.
    async fn list(&self) -> Result<Vec<BatchJob>, ShipflowError>;
}

/// One JSON document per job under a state directory.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Ids come from the command line too; only plain names may reach the
    /// filesystem.
    fn path_for(&self, job_id: &str) -> Result<PathBuf, ShipflowError> {
        if !valid_job_id(job_id) {
            return Err(ShipflowError::InvalidJobId(job_id.to_string()));
        }
        Ok(self.dir.join(format!("{job_id}.json")))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &BatchJob) -> Result<(), ShipflowError> {
        let persist = |e: std::io::Error| {
            ShipflowError::Persistence(format!("saving job {}: {e}", job.id))
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(persist)?;

        let path = self.path_for(&job.id)?;
        let json = serde_json::to_vec_pretty(job)?;
        let tmp = path.with_extension("json.tmp");
        // Write then rename so a crash never leaves a half-written job.
        tokio::fs::write(&tmp, &json).await.map_err(persist)?;
        tokio::fs::rename(&tmp, &path).await.map_err(persist)?;
        trace!(job_id = %job.id, status = %job.status, "job checkpointed");
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<BatchJob, ShipflowError> {
        let path = self.path_for(job_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShipflowError::JobNotFound(job_id.to_string()));
            }
            Err(e) => {
                return Err(ShipflowError::Persistence(format!(
                    "reading job {job_id}: {e}"
                )));
            }
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list(&self) -> Result<Vec<BatchJob>, ShipflowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<BatchJob>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

/// In-process store for tests and one-shot sessions.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, BatchJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &BatchJob) -> Result<(), ShipflowError> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<BatchJob, ShipflowError> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
            .ok_or_else(|| ShipflowError::JobNotFound(job_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<BatchJob>, ShipflowError> {
        let mut jobs: Vec<BatchJob> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
