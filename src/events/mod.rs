//! Batch lifecycle events and observer fan-out.
//!
//! The engine reports progress through a [`BatchEmitter`], which forwards
//! each event to every registered [`BatchObserver`]. An observer that
//! returns an error or panics is logged and skipped; the remaining
//! observers still receive the event and the engine never sees the failure.

mod audit;
mod stream;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::error::ShipflowError;

pub use audit::AuditLog;
pub use stream::StreamingBridge;

/// One lifecycle event, in the `{event, data}` shape streamed to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BatchEvent {
    BatchStarted {
        job_id: String,
        total_rows: u32,
    },
    RowStarted {
        job_id: String,
        row_number: u32,
    },
    RowCompleted {
        job_id: String,
        row_number: u32,
        tracking_number: String,
        cost_cents: i64,
    },
    RowFailed {
        job_id: String,
        row_number: u32,
        error_code: String,
        error_message: String,
    },
    BatchCompleted {
        job_id: String,
        total_rows: u32,
        successful: u32,
        total_cost_cents: i64,
    },
    BatchFailed {
        job_id: String,
        error_code: String,
        error_message: String,
        processed: u32,
    },
    BatchInterrupted {
        job_id: String,
        processed: u32,
    },
}

impl BatchEvent {
    pub fn job_id(&self) -> &str {
        match self {
            BatchEvent::BatchStarted { job_id, .. }
            | BatchEvent::RowStarted { job_id, .. }
            | BatchEvent::RowCompleted { job_id, .. }
            | BatchEvent::RowFailed { job_id, .. }
            | BatchEvent::BatchCompleted { job_id, .. }
            | BatchEvent::BatchFailed { job_id, .. }
            | BatchEvent::BatchInterrupted { job_id, .. } => job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BatchEvent::BatchStarted { .. } => "batch_started",
            BatchEvent::RowStarted { .. } => "row_started",
            BatchEvent::RowCompleted { .. } => "row_completed",
            BatchEvent::RowFailed { .. } => "row_failed",
            BatchEvent::BatchCompleted { .. } => "batch_completed",
            BatchEvent::BatchFailed { .. } => "batch_failed",
            BatchEvent::BatchInterrupted { .. } => "batch_interrupted",
        }
    }
}

/// Receives batch lifecycle callbacks. Every callback defaults to a no-op
/// so observers only implement what they care about.
#[async_trait]
pub trait BatchObserver: Send + Sync {
    /// Used in log lines when a callback fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn batch_started(&self, _job_id: &str, _total_rows: u32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn row_started(&self, _job_id: &str, _row_number: u32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn row_completed(
        &self,
        _job_id: &str,
        _row_number: u32,
        _tracking_number: &str,
        _cost_cents: i64,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn row_failed(
        &self,
        _job_id: &str,
        _row_number: u32,
        _error_code: &str,
        _error_message: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn batch_completed(
        &self,
        _job_id: &str,
        _total_rows: u32,
        _successful: u32,
        _total_cost_cents: i64,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn batch_failed(
        &self,
        _job_id: &str,
        _error_code: &str,
        _error_message: &str,
        _processed: u32,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The batch stopped on request between rows and can be resumed.
    async fn batch_interrupted(&self, _job_id: &str, _processed: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn deliver(observer: &dyn BatchObserver, event: &BatchEvent) -> anyhow::Result<()> {
    match event {
        BatchEvent::BatchStarted { job_id, total_rows } => {
            observer.batch_started(job_id, *total_rows).await
        }
        BatchEvent::RowStarted { job_id, row_number } => {
            observer.row_started(job_id, *row_number).await
        }
        BatchEvent::RowCompleted {
            job_id,
            row_number,
            tracking_number,
            cost_cents,
        } => {
            observer
                .row_completed(job_id, *row_number, tracking_number, *cost_cents)
                .await
        }
        BatchEvent::RowFailed {
            job_id,
            row_number,
            error_code,
            error_message,
        } => {
            observer
                .row_failed(job_id, *row_number, error_code, error_message)
                .await
        }
        BatchEvent::BatchCompleted {
            job_id,
            total_rows,
            successful,
            total_cost_cents,
        } => {
            observer
                .batch_completed(job_id, *total_rows, *successful, *total_cost_cents)
                .await
        }
        BatchEvent::BatchFailed {
            job_id,
            error_code,
            error_message,
            processed,
        } => {
            observer
                .batch_failed(job_id, error_code, error_message, *processed)
                .await
        }
        BatchEvent::BatchInterrupted { job_id, processed } => {
            observer.batch_interrupted(job_id, *processed).await
        }
    }
}

/// Fans events out to registered observers.
#[derive(Default)]
pub struct BatchEmitter {
    observers: RwLock<Vec<Arc<dyn BatchObserver>>>,
}

impl BatchEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn BatchObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Fails with [`ShipflowError::ObserverNotRegistered`] if this exact
    /// observer handle was never added.
    pub fn remove_observer(&self, observer: &Arc<dyn BatchObserver>) -> Result<(), ShipflowError> {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        let position = observers
            .iter()
            .position(|o| std::ptr::addr_eq(Arc::as_ptr(o), Arc::as_ptr(observer)))
            .ok_or(ShipflowError::ObserverNotRegistered)?;
        observers.remove(position);
        Ok(())
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver one event to every observer registered at the time of the
    /// call. Never fails.
    pub async fn emit(&self, event: BatchEvent) {
        let observers: Vec<Arc<dyn BatchObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        trace!(event = event.name(), job_id = event.job_id(), observers = observers.len(), "emitting");

        for observer in observers {
            let outcome = AssertUnwindSafe(deliver(observer.as_ref(), &event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(
                    observer = observer.name(),
                    event = event.name(),
                    job_id = event.job_id(),
                    error = %err,
                    "observer callback failed"
                ),
                Err(_) => error!(
                    observer = observer.name(),
                    event = event.name(),
                    job_id = event.job_id(),
                    "observer callback panicked"
                ),
            }
        }
    }

    pub async fn emit_batch_started(&self, job_id: &str, total_rows: u32) {
        self.emit(BatchEvent::BatchStarted {
            job_id: job_id.to_string(),
            total_rows,
        })
        .await
    }

    pub async fn emit_row_started(&self, job_id: &str, row_number: u32) {
        self.emit(BatchEvent::RowStarted {
            job_id: job_id.to_string(),
            row_number,
        })
        .await
    }

    pub async fn emit_row_completed(
        &self,
        job_id: &str,
        row_number: u32,
        tracking_number: &str,
        cost_cents: i64,
    ) {
        self.emit(BatchEvent::RowCompleted {
            job_id: job_id.to_string(),
            row_number,
            tracking_number: tracking_number.to_string(),
            cost_cents,
        })
        .await
    }

    pub async fn emit_row_failed(
        &self,
        job_id: &str,
        row_number: u32,
        error_code: &str,
        error_message: &str,
    ) {
        self.emit(BatchEvent::RowFailed {
            job_id: job_id.to_string(),
            row_number,
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
        })
        .await
    }

    pub async fn emit_batch_completed(
        &self,
        job_id: &str,
        total_rows: u32,
        successful: u32,
        total_cost_cents: i64,
    ) {
        self.emit(BatchEvent::BatchCompleted {
            job_id: job_id.to_string(),
            total_rows,
            successful,
            total_cost_cents,
        })
        .await
    }

    pub async fn emit_batch_failed(
        &self,
        job_id: &str,
        error_code: &str,
        error_message: &str,
        processed: u32,
    ) {
        self.emit(BatchEvent::BatchFailed {
            job_id: job_id.to_string(),
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            processed,
        })
        .await
    }

    pub async fn emit_batch_interrupted(&self, job_id: &str, processed: u32) {
        self.emit(BatchEvent::BatchInterrupted {
            job_id: job_id.to_string(),
            processed,
        })
        .await
    }
}
