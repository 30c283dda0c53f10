//! Label storage backends.
//!
//! Labels go through two phases: [`LabelStorage::save_staged`] while the
//! batch is still running, then [`LabelStorage::promote`] once the whole
//! batch succeeded. References are opaque strings (a filesystem path or a
//! `scheme://bucket/key` URI) handed back to the same backend later.

mod local;
mod object;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalLabelStorage;
pub use object::ObjectLabelStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("label file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store request failed: {0}")]
    Object(#[from] object_store::Error),

    #[error("label not found: {reference}")]
    NotFound { reference: String },

    #[error("label reference does not belong to this storage: {reference}")]
    InvalidReference { reference: String },
}

/// Lifecycle of a stored label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelState {
    Staged,
    Final,
}

/// Storage contract used by the batch engine.
#[async_trait]
pub trait LabelStorage: Send + Sync {
    /// Single-phase write straight to final storage.
    async fn save_final(
        &self,
        tracking_number: &str,
        pdf: &[u8],
        job_id: &str,
        row_number: u32,
    ) -> Result<String, StorageError>;

    /// Write a label for a row whose batch has not finished yet.
    async fn save_staged(
        &self,
        tracking_number: &str,
        pdf: &[u8],
        job_id: &str,
        row_number: u32,
    ) -> Result<String, StorageError>;

    /// Move a staged label to final storage and return the final reference.
    /// Fails with [`StorageError::NotFound`] if the staged label is gone,
    /// including when it was already promoted.
    async fn promote(&self, staged_ref: &str) -> Result<String, StorageError>;

    async fn exists(&self, reference: &str) -> bool;
}

/// Deterministic name for a row's label, so a retried write lands on the
/// same file and two jobs never collide.
pub fn label_filename(tracking_number: &str, job_id: &str, row_number: u32) -> String {
    let job_prefix: String = if job_id.is_empty() {
        "unknown".to_string()
    } else {
        job_id.chars().take(8).collect()
    };
    let tracking: String = tracking_number
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{job_prefix}_row{row_number:03}_{tracking}.pdf")
}

/// Which backend to build, as resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSettings {
    Local {
        dir: PathBuf,
    },
    S3 {
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
}

pub fn build_label_storage(
    settings: &StorageSettings,
) -> Result<Arc<dyn LabelStorage>, StorageError> {
    match settings {
        StorageSettings::Local { dir } => Ok(Arc::new(LocalLabelStorage::new(dir.clone()))),
        StorageSettings::S3 {
            bucket,
            prefix,
            region,
            endpoint,
        } => Ok(Arc::new(ObjectLabelStorage::s3(
            bucket,
            prefix,
            region.as_deref(),
            endpoint.as_deref(),
        )?)),
    }
}
