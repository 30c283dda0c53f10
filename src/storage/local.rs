use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{LabelStorage, StorageError, label_filename};

const STAGING_DIR: &str = "staging";

/// Labels on the local filesystem. Staged labels live under
/// `<base>/staging/<job_id>/` and are promoted into `<base>/` with a rename.
#[derive(Debug, Clone)]
pub struct LocalLabelStorage {
    base_dir: PathBuf,
}

impl LocalLabelStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn staging_root(&self) -> PathBuf {
        self.base_dir.join(STAGING_DIR)
    }

    async fn write(&self, dir: &Path, filename: &str, pdf: &[u8]) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(filename);
        tokio::fs::write(&path, pdf).await?;
        debug!(path = %path.display(), bytes = pdf.len(), "label written");
        Ok(path.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl LabelStorage for LocalLabelStorage {
    async fn save_final(
        &self,
        tracking_number: &str,
        pdf: &[u8],
        job_id: &str,
        row_number: u32,
    ) -> Result<String, StorageError> {
        let filename = label_filename(tracking_number, job_id, row_number);
        self.write(&self.base_dir, &filename, pdf).await
    }

    async fn save_staged(
        &self,
        tracking_number: &str,
        pdf: &[u8],
        job_id: &str,
        row_number: u32,
    ) -> Result<String, StorageError> {
        let filename = label_filename(tracking_number, job_id, row_number);
        let dir = self.staging_root().join(job_id);
        self.write(&dir, &filename, pdf).await
    }

    async fn promote(&self, staged_ref: &str) -> Result<String, StorageError> {
        let staged = PathBuf::from(staged_ref);
        if !staged.starts_with(self.staging_root()) {
            return Err(StorageError::InvalidReference {
                reference: staged_ref.to_string(),
            });
        }
        let Some(filename) = staged.file_name() else {
            return Err(StorageError::InvalidReference {
                reference: staged_ref.to_string(),
            });
        };
        if !tokio::fs::try_exists(&staged).await.unwrap_or(false) {
            return Err(StorageError::NotFound {
                reference: staged_ref.to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.base_dir).await?;
        let final_path = self.base_dir.join(filename);
        // Same filesystem, so the rename is atomic.
        tokio::fs::rename(&staged, &final_path).await?;
        debug!(from = %staged.display(), to = %final_path.display(), "label promoted");

        if let Some(job_dir) = staged.parent() {
            // Only succeeds once the job's staging directory is empty.
            let _ = tokio::fs::remove_dir(job_dir).await;
        }
        Ok(final_path.to_string_lossy().into_owned())
    }

    async fn exists(&self, reference: &str) -> bool {
        tokio::fs::try_exists(reference).await.unwrap_or(false)
    }
}
