use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{BatchEvent, BatchObserver};

/// Appends one JSON line per lifecycle event to a file, so a batch's
/// history survives the process.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: BatchEvent) -> anyhow::Result<()> {
        let record = serde_json::to_value(&event)?;
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": record["event"],
            "data": record["data"],
        });
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl BatchObserver for AuditLog {
    async fn batch_started(&self, job_id: &str, total_rows: u32) -> anyhow::Result<()> {
        self.append(BatchEvent::BatchStarted {
            job_id: job_id.to_string(),
            total_rows,
        })
        .await
    }

    async fn row_completed(
        &self,
        job_id: &str,
        row_number: u32,
        tracking_number: &str,
        cost_cents: i64,
    ) -> anyhow::Result<()> {
        self.append(BatchEvent::RowCompleted {
            job_id: job_id.to_string(),
            row_number,
            tracking_number: tracking_number.to_string(),
            cost_cents,
        })
        .await
    }

    async fn row_failed(
        &self,
        job_id: &str,
        row_number: u32,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        self.append(BatchEvent::RowFailed {
            job_id: job_id.to_string(),
            row_number,
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
        })
        .await
    }

    async fn batch_completed(
        &self,
        job_id: &str,
        total_rows: u32,
        successful: u32,
        total_cost_cents: i64,
    ) -> anyhow::Result<()> {
        self.append(BatchEvent::BatchCompleted {
            job_id: job_id.to_string(),
            total_rows,
            successful,
            total_cost_cents,
        })
        .await
    }

    async fn batch_failed(
        &self,
        job_id: &str,
        error_code: &str,
        error_message: &str,
        processed: u32,
    ) -> anyhow::Result<()> {
        self.append(BatchEvent::BatchFailed {
            job_id: job_id.to_string(),
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            processed,
        })
        .await
    }

    async fn batch_interrupted(&self, job_id: &str, processed: u32) -> anyhow::Result<()> {
        self.append(BatchEvent::BatchInterrupted {
            job_id: job_id.to_string(),
            processed,
        })
        .await
    }
}
