//! Error types for the carrier protocol client.
//!
//! [`CarrierError`] separates the failure classes the batch engine reacts to
//! differently: the worker process being gone, usage errors, protocol-level
//! errors, and tool-level rejections reported by the carrier itself.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Why the worker process cannot be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFault {
    /// An explicit path was configured and nothing exists there.
    NotInstalled { path: String },
    /// A bare program name was configured and no `PATH` entry contains it.
    NotOnPath { program: String },
    /// The OS refused to spawn the process.
    Spawn(String),
    /// The worker closed its output or exited before answering.
    Exited,
    /// Reading from or writing to the worker failed.
    Io(String),
    /// The worker did not complete the handshake in time.
    HandshakeTimeout { after_ms: u64 },
    /// `start()` was never called, or the worker was shut down.
    NotStarted,
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFault::NotInstalled { path } => {
                write!(f, "worker runtime is not installed at {path}")
            }
            WorkerFault::NotOnPath { program } => {
                write!(f, "worker program '{program}' was not found on PATH")
            }
            WorkerFault::Spawn(reason) => write!(f, "failed to spawn worker: {reason}"),
            WorkerFault::Exited => write!(f, "worker exited before responding"),
            WorkerFault::Io(reason) => write!(f, "worker channel I/O failed: {reason}"),
            WorkerFault::HandshakeTimeout { after_ms } => {
                write!(f, "worker handshake timed out after {after_ms}ms")
            }
            WorkerFault::NotStarted => write!(f, "worker is not running"),
        }
    }
}

/// Errors raised by [`CarrierClient`](super::CarrierClient) and the typed
/// [`CarrierService`](super::CarrierService) on top of it.
#[derive(Debug, Error)]
pub enum CarrierError {
    /// The worker process is missing, crashed, or unreachable. Never retried
    /// internally.
    #[error("carrier worker unavailable: {0}")]
    WorkerUnavailable(WorkerFault),

    /// A tool call was attempted before a successful handshake.
    #[error("carrier client not initialized: handshake must complete before tool calls")]
    NotInitialized,

    /// The worker answered with a JSON-RPC error object.
    #[error("protocol error [{code}]: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The worker answered with something that is not a valid response.
    #[error("malformed response from carrier worker: {0}")]
    MalformedResponse(String),

    /// The tool response carried no text content to parse.
    #[error("tool '{tool}' returned an empty result")]
    EmptyResult { tool: String },

    /// The tool ran and reported a carrier-side failure (`isError: true`).
    #[error("tool '{tool}' failed: {text}")]
    Tool { tool: String, text: String },
}

impl CarrierError {
    /// True when the worker itself is gone rather than the request being bad.
    pub fn is_worker_unavailable(&self) -> bool {
        matches!(self, CarrierError::WorkerUnavailable(_))
    }

    /// Carrier-side rejections that are worth retrying: throttling and
    /// temporary unavailability. Validation and auth failures are not.
    pub fn is_transient(&self) -> bool {
        const PATTERNS: &[&str] = &[
            "rate limit",
            "429",
            "502",
            "503",
            "timeout",
            "temporarily unavailable",
            "190001",
            "190002",
        ];
        match self {
            CarrierError::Tool { text, .. } => {
                let lower = text.to_lowercase();
                PATTERNS.iter().any(|p| lower.contains(p))
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for CarrierError {
    fn from(err: std::io::Error) -> Self {
        CarrierError::WorkerUnavailable(WorkerFault::Io(err.to_string()))
    }
}
