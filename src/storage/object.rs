use std::sync::{Arc, Once};

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, warn};

use super::{LabelStorage, StorageError, label_filename};

static LIFECYCLE_WARNING: Once = Once::new();

/// Labels in an object store bucket. Staged labels sit under
/// `<prefix>/staging/<job_id>/`; promotion is copy then delete since object
/// stores have no rename.
pub struct ObjectLabelStorage {
    store: Arc<dyn ObjectStore>,
    scheme: String,
    bucket: String,
    prefix: String,
}

impl ObjectLabelStorage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        let bucket = bucket.into();
        let prefix = prefix.into().trim_matches('/').to_string();
        LIFECYCLE_WARNING.call_once(|| {
            warn!(
                bucket = %bucket,
                "staged labels from aborted batches are kept; configure a bucket lifecycle rule to expire '{}/staging/'",
                prefix
            );
        });
        Self {
            store,
            scheme: scheme.into(),
            bucket,
            prefix,
        }
    }

    /// S3 (or S3-compatible) bucket. Credentials come from the usual AWS
    /// environment variables.
    pub fn s3(
        bucket: &str,
        prefix: &str,
        region: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder.build()?;
        Ok(Self::new(Arc::new(store), "s3", bucket, prefix))
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = String::new();
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
        }
        for part in parts {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(part);
        }
        key
    }

    fn reference_for(&self, key: &str) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, key)
    }

    fn key_from_reference<'a>(&self, reference: &'a str) -> Result<&'a str, StorageError> {
        let root = format!("{}://{}/", self.scheme, self.bucket);
        reference
            .strip_prefix(root.as_str())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| StorageError::InvalidReference {
                reference: reference.to_string(),
            })
    }

    async fn put(&self, key: String, pdf: &[u8]) -> Result<String, StorageError> {
        let location = ObjectPath::from(key.as_str());
        self.store
            .put(&location, PutPayload::from(pdf.to_vec()))
            .await?;
        debug!(key = %key, bytes = pdf.len(), "label uploaded");
        Ok(self.reference_for(&key))
    }
}

fn not_found_or(err: object_store::Error, reference: &str) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound {
            reference: reference.to_string(),
        },
        other => StorageError::Object(other),
    }
}

#[async_trait]
impl LabelStorage for ObjectLabelStorage {
    async fn save_final(
        &self,
        tracking_number: &str,
        pdf: &[u8],
        job_id: &str,
        row_number: u32,
    ) -> Result<String, StorageError> {
        let filename = label_filename(tracking_number, job_id, row_number);
        self.put(self.key(&[&filename]), pdf).await
    }

    async fn save_staged(
        &self,
        tracking_number: &str,
        pdf: &[u8],
        job_id: &str,
        row_number: u32,
    ) -> Result<String, StorageError> {
        let filename = label_filename(tracking_number, job_id, row_number);
        self.put(self.key(&["staging", job_id, &filename]), pdf)
            .await
    }

    async fn promote(&self, staged_ref: &str) -> Result<String, StorageError> {
        let staged_key = self.key_from_reference(staged_ref)?;
        let staging_root = self.key(&["staging", ""]);
        let Some(filename) = staged_key
            .strip_prefix(staging_root.as_str())
            .and_then(|rest| rest.rsplit('/').next())
            .filter(|name| !name.is_empty())
        else {
            return Err(StorageError::InvalidReference {
                reference: staged_ref.to_string(),
            });
        };

        let from = ObjectPath::from(staged_key);
        self.store
            .head(&from)
            .await
            .map_err(|e| not_found_or(e, staged_ref))?;

        let final_key = self.key(&[filename]);
        let to = ObjectPath::from(final_key.as_str());
        self.store
            .copy(&from, &to)
            .await
            .map_err(|e| not_found_or(e, staged_ref))?;

        if let Err(err) = self.store.delete(&from).await {
            // Roll back so the label is not in both places.
            let _ = self.store.delete(&to).await;
            return Err(StorageError::Object(err));
        }
        debug!(from = %staged_key, to = %final_key, "label promoted");
        Ok(self.reference_for(&final_key))
    }

    async fn exists(&self, reference: &str) -> bool {
        let Ok(key) = self.key_from_reference(reference) else {
            return false;
        };
        self.store.head(&ObjectPath::from(key)).await.is_ok()
    }
}
