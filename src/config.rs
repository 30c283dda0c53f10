//! Shipflow configuration loaded from `shipflow.toml`.
//!
//! [`ShipflowConfig`] holds every tunable. Keys missing from the file fall
//! back to defaults. Environment variables take precedence over the file,
//! and [`ShipflowConfig::validate`] runs at startup so a bad setup fails
//! before the first carrier call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::carrier::WorkerCommand;
use crate::error::ShipflowError;
use crate::storage::StorageSettings;

pub const DEFAULT_CONFIG_FILE: &str = "shipflow.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ShipflowConfig {
    /// Carrier API client id, handed to the worker.
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// `test` or `production`.
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub account_number: Option<String>,

    /// Worker program, either a bare name looked up on `PATH` or a path.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,

    #[serde(default)]
    pub worker_args: Vec<String>,

    #[serde(default = "default_labels_dir")]
    pub labels_dir: PathBuf,

    /// Where job checkpoints and the audit log live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// `local` or `s3`.
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    #[serde(default)]
    pub s3_bucket: Option<String>,

    #[serde(default = "default_s3_prefix")]
    pub s3_prefix: String,

    #[serde(default)]
    pub s3_region: Option<String>,

    #[serde(default)]
    pub s3_endpoint: Option<String>,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Rows quoted individually in a preview; the rest are estimated.
    #[serde(default = "default_max_preview_rows")]
    pub max_preview_rows: usize,

    /// Retries for transient carrier errors before a row fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_environment() -> String {
    "test".to_string()
}

fn default_worker_command() -> String {
    "carrier-worker".to_string()
}

fn default_labels_dir() -> PathBuf {
    PathBuf::from("labels")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".shipflow")
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_s3_prefix() -> String {
    "labels".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_preview_rows() -> usize {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for ShipflowConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            environment: default_environment(),
            account_number: None,
            worker_command: default_worker_command(),
            worker_args: Vec::new(),
            labels_dir: default_labels_dir(),
            state_dir: default_state_dir(),
            storage_backend: default_storage_backend(),
            s3_bucket: None,
            s3_prefix: default_s3_prefix(),
            s3_region: None,
            s3_endpoint: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_preview_rows: default_max_preview_rows(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ShipflowConfig {
    /// Load from `path`, or `shipflow.toml` in the working directory when no
    /// path is given. A missing default file means defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<ShipflowConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else if explicit {
            anyhow::bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override fields from environment variables, read through `lookup`.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(v) = get("CARRIER_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = get("CARRIER_CLIENT_SECRET") {
            self.client_secret = v;
        }
        if let Some(v) = get("CARRIER_ENVIRONMENT") {
            self.environment = v;
        }
        if let Some(v) = get("CARRIER_ACCOUNT_NUMBER") {
            self.account_number = Some(v);
        }
        if let Some(v) = get("SHIPFLOW_WORKER_COMMAND") {
            self.worker_command = v;
        }
        if let Some(v) = get("LABELS_OUTPUT_DIR") {
            self.labels_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SHIPFLOW_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("LABEL_STORAGE_BACKEND") {
            self.storage_backend = v.to_lowercase();
        }
        if let Some(v) = get("LABEL_STORAGE_S3_BUCKET") {
            self.s3_bucket = Some(v);
        }
        if let Some(v) = get("LABEL_STORAGE_S3_PREFIX") {
            self.s3_prefix = v;
        }
        if let Some(v) = get("LABEL_STORAGE_S3_REGION") {
            self.s3_region = Some(v);
        }
        if let Some(v) = get("LABEL_STORAGE_S3_ENDPOINT") {
            self.s3_endpoint = Some(v);
        }
    }

    /// Fail fast on settings that would otherwise break at first use.
    pub fn validate(&self) -> Result<(), ShipflowError> {
        if self.worker_command.trim().is_empty() {
            return Err(ShipflowError::Configuration(
                "worker_command must not be empty".into(),
            ));
        }
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(ShipflowError::Configuration(
                "carrier credentials missing: set CARRIER_CLIENT_ID and CARRIER_CLIENT_SECRET"
                    .into(),
            ));
        }
        if !matches!(self.environment.as_str(), "test" | "production") {
            return Err(ShipflowError::Configuration(format!(
                "unknown carrier environment '{}': use 'test' or 'production'",
                self.environment
            )));
        }
        if self.max_preview_rows == 0 {
            return Err(ShipflowError::Configuration(
                "max_preview_rows must be at least 1".into(),
            ));
        }
        self.storage_settings()?;
        Ok(())
    }

    pub fn storage_settings(&self) -> Result<StorageSettings, ShipflowError> {
        match self.storage_backend.trim().to_lowercase().as_str() {
            "local" => Ok(StorageSettings::Local {
                dir: self.labels_dir.clone(),
            }),
            "s3" => {
                let bucket = non_empty(self.s3_bucket.clone()).ok_or_else(|| {
                    ShipflowError::Configuration(
                        "LABEL_STORAGE_BACKEND=s3 requires LABEL_STORAGE_S3_BUCKET".into(),
                    )
                })?;
                Ok(StorageSettings::S3 {
                    bucket,
                    prefix: self.s3_prefix.clone(),
                    region: non_empty(self.s3_region.clone()),
                    endpoint: non_empty(self.s3_endpoint.clone()),
                })
            }
            other => Err(ShipflowError::Configuration(format!(
                "unsupported label storage backend '{other}': use 'local' or 's3'"
            ))),
        }
    }

    /// The worker sees only its credentials and output directory.
    pub fn worker(&self) -> WorkerCommand {
        let mut command = WorkerCommand::new(self.worker_command.clone())
            .args(self.worker_args.iter().cloned())
            .env("CLIENT_ID", self.client_id.clone())
            .env("CLIENT_SECRET", self.client_secret.clone())
            .env("ENVIRONMENT", self.environment.clone())
            .env(
                "LABELS_OUTPUT_DIR",
                self.labels_dir.to_string_lossy().into_owned(),
            );
        if let Some(account) = &self.account_number {
            command = command.env("ACCOUNT_NUMBER", account.clone());
        }
        command
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }
}
