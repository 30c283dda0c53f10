use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::batch::JobStatus;
use crate::carrier::CarrierError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ShipflowError {
    #[error("Carrier error: {0}")]
    Carrier(#[from] CarrierError),

    #[error("Label storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Configuration(String),

    #[error("Execution mode is locked while a batch is running")]
    LockedMode,

    #[error("Another batch is already executing")]
    ExecutionInProgress,

    #[error("Job {job_id} must be previewed before it can run in confirm mode")]
    PreviewRequired { job_id: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is {status} and cannot be resumed")]
    NotResumable { job_id: String, status: JobStatus },

    #[error("Job {0} already exists")]
    JobExists(String),

    #[error("Invalid job id '{0}': use letters, digits, '-' or '_'")]
    InvalidJobId(String),

    #[error("Invalid row data: {0}")]
    InvalidRow(String),

    #[error("Observer is not registered")]
    ObserverNotRegistered,

    #[error("Job state could not be persisted: {0}")]
    Persistence(String),

    #[error("Batch was interrupted before finishing")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub mod codes {
    pub const DATA_ERROR: &str = "E-1001";
    pub const LOCKED_MODE: &str = "E-2001";
    pub const PREVIEW_REQUIRED: &str = "E-2002";
    pub const EXECUTION_IN_PROGRESS: &str = "E-2003";
    pub const NOT_RESUMABLE: &str = "E-2004";
    pub const INTERRUPTED: &str = "E-2005";
    pub const CANCELLED: &str = "E-2006";
    pub const NEEDS_REVIEW: &str = "E-2007";
    pub const WORKER_UNAVAILABLE: &str = "E-3001";
    pub const RATE_LIMITED: &str = "E-3002";
    pub const ADDRESS_REJECTED: &str = "E-3003";
    pub const AUTH_FAILED: &str = "E-3004";
    pub const CARRIER_REJECTED: &str = "E-3005";
    pub const MALFORMED_RESPONSE: &str = "E-3006";
    pub const INTERNAL: &str = "E-4001";
    pub const STORAGE: &str = "E-4002";
    pub const PERSISTENCE: &str = "E-4003";
    pub const CONFIGURATION: &str = "E-4004";
}

impl ShipflowError {
    /// Stable code shown to operators and recorded on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            ShipflowError::Carrier(err) => RowFailure::from_carrier(err).code_str(),
            ShipflowError::Storage(_) => codes::STORAGE,
            ShipflowError::Configuration(_) | ShipflowError::Toml(_) => codes::CONFIGURATION,
            ShipflowError::LockedMode => codes::LOCKED_MODE,
            ShipflowError::ExecutionInProgress => codes::EXECUTION_IN_PROGRESS,
            ShipflowError::PreviewRequired { .. } => codes::PREVIEW_REQUIRED,
            ShipflowError::NotResumable { .. } | ShipflowError::JobNotFound(_) => {
                codes::NOT_RESUMABLE
            }
            ShipflowError::InvalidJobId(_)
            | ShipflowError::InvalidRow(_)
            | ShipflowError::JobExists(_) => codes::DATA_ERROR,
            ShipflowError::Persistence(_) | ShipflowError::Io(_) | ShipflowError::Json(_) => {
                codes::PERSISTENCE
            }
            ShipflowError::Interrupted => codes::INTERRUPTED,
            ShipflowError::InvalidTransition { .. } | ShipflowError::ObserverNotRegistered => {
                codes::INTERNAL
            }
        }
    }
}

/// Why a single row failed, in a form safe to show and persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub code: String,
    pub message: String,
}

impl RowFailure {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn code_str(&self) -> &'static str {
        const ALL: &[&str] = &[
            codes::WORKER_UNAVAILABLE,
            codes::RATE_LIMITED,
            codes::ADDRESS_REJECTED,
            codes::AUTH_FAILED,
            codes::CARRIER_REJECTED,
            codes::MALFORMED_RESPONSE,
            codes::INTERNAL,
        ];
        ALL.iter()
            .copied()
            .find(|c| *c == self.code)
            .unwrap_or(codes::CARRIER_REJECTED)
    }

    pub fn from_carrier(err: &CarrierError) -> Self {
        match err {
            CarrierError::WorkerUnavailable(fault) => Self::new(
                codes::WORKER_UNAVAILABLE,
                format!("Carrier worker is unavailable: {fault}"),
            ),
            CarrierError::NotInitialized => Self::new(
                codes::INTERNAL,
                "Carrier client was used before the handshake completed",
            ),
            CarrierError::Protocol { code, message, .. } => Self::new(
                codes::CARRIER_REJECTED,
                format!("Carrier worker rejected the request ({code}): {message}"),
            ),
            CarrierError::MalformedResponse(detail) => Self::new(
                codes::MALFORMED_RESPONSE,
                format!("Carrier returned an unreadable response: {detail}"),
            ),
            CarrierError::EmptyResult { tool } => Self::new(
                codes::MALFORMED_RESPONSE,
                format!("Carrier returned an empty response for {tool}"),
            ),
            CarrierError::Tool { text, .. } => Self::from_tool_text(text),
        }
    }

    pub fn from_storage(err: &StorageError) -> Self {
        Self::new(codes::STORAGE, format!("Label could not be stored: {err}"))
    }

    /// Tool errors arrive as a JSON document
    /// `{"code", "message", "details": {"response": {"errors": [..]}}}` or
    /// as plain text. Pull out the carrier's own message and classify it.
    fn from_tool_text(text: &str) -> Self {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(doc) => carrier_message(&doc).unwrap_or_else(|| text.to_string()),
            Err(_) => text.to_string(),
        };
        let lower = format!("{text} {message}").to_lowercase();
        let code = if lower.contains("rate limit") || lower.contains("429") {
            codes::RATE_LIMITED
        } else if lower.contains("address") || lower.contains("postal") {
            codes::ADDRESS_REJECTED
        } else if lower.contains("auth") || lower.contains("401") || lower.contains("credential")
        {
            codes::AUTH_FAILED
        } else {
            codes::CARRIER_REJECTED
        };
        Self::new(code, message)
    }
}

fn carrier_message(doc: &Value) -> Option<String> {
    let detail = doc["details"]["response"]["errors"]
        .get(0)
        .and_then(|e| e["message"].as_str());
    let top = doc["message"].as_str();
    let code = doc["code"].as_str().or_else(|| {
        doc["details"]["response"]["errors"]
            .get(0)
            .and_then(|e| e["code"].as_str())
    });
    let message = detail.or(top)?;
    Some(match code {
        Some(code) if !code.is_empty() => format!("{message} (carrier code {code})"),
        _ => message.to_string(),
    })
}

impl std::fmt::Display for RowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
