use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{BatchEvent, BatchObserver};

const DEFAULT_CAPACITY: usize = 1024;

/// Observer that republishes lifecycle events on per-job channels so live
/// viewers can follow a batch. Every subscriber of a job sees every event
/// emitted after it subscribed, in emission order, as long as it keeps up.
pub struct StreamingBridge {
    channels: Mutex<HashMap<String, broadcast::Sender<BatchEvent>>>,
    capacity: usize,
}

impl Default for StreamingBridge {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl StreamingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch emits `2 * rows + 2` events; size the buffer for the largest
    /// batch a slow viewer must be able to replay.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open (or join) the job's channel.
    ///
    /// Each channel buffers `capacity` events. A receiver that falls further
    /// behind gets [`broadcast::error::RecvError::Lagged`] with the number of
    /// events it missed, then continues with the oldest event still buffered.
    /// Viewers that must not miss anything should treat `Lagged` as a cue to
    /// reload the job from the store.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<BatchEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| {
                debug!(job_id, "stream channel opened");
                broadcast::channel(self.capacity).0
            })
            .subscribe()
    }

    /// Close the job's channel. Receivers see the stream end once drained.
    pub fn unsubscribe(&self, job_id: &str) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        if removed.is_some() {
            debug!(job_id, "stream channel closed");
        }
    }

    pub fn has_subscribers(&self, job_id: &str) -> bool {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_id)
    }

    fn publish(&self, event: BatchEvent) -> anyhow::Result<()> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(event.job_id()) {
            // No live receivers means nobody is watching; dropping is fine.
            let _ = sender.send(event);
        }
        Ok(())
    }
}

#[async_trait]
impl BatchObserver for StreamingBridge {
    async fn batch_started(&self, job_id: &str, total_rows: u32) -> anyhow::Result<()> {
        self.publish(BatchEvent::BatchStarted {
            job_id: job_id.to_string(),
            total_rows,
        })
    }

    async fn row_started(&self, job_id: &str, row_number: u32) -> anyhow::Result<()> {
        self.publish(BatchEvent::RowStarted {
            job_id: job_id.to_string(),
            row_number,
        })
    }

    async fn row_completed(
        &self,
        job_id: &str,
        row_number: u32,
        tracking_number: &str,
        cost_cents: i64,
    ) -> anyhow::Result<()> {
        self.publish(BatchEvent::RowCompleted {
            job_id: job_id.to_string(),
            row_number,
            tracking_number: tracking_number.to_string(),
            cost_cents,
        })
    }

    async fn row_failed(
        &self,
        job_id: &str,
        row_number: u32,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        self.publish(BatchEvent::RowFailed {
            job_id: job_id.to_string(),
            row_number,
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
        })
    }

    async fn batch_completed(
        &self,
        job_id: &str,
        total_rows: u32,
        successful: u32,
        total_cost_cents: i64,
    ) -> anyhow::Result<()> {
        self.publish(BatchEvent::BatchCompleted {
            job_id: job_id.to_string(),
            total_rows,
            successful,
            total_cost_cents,
        })
    }

    async fn batch_failed(
        &self,
        job_id: &str,
        error_code: &str,
        error_message: &str,
        processed: u32,
    ) -> anyhow::Result<()> {
        self.publish(BatchEvent::BatchFailed {
            job_id: job_id.to_string(),
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            processed,
        })
    }

    async fn batch_interrupted(&self, job_id: &str, processed: u32) -> anyhow::Result<()> {
        self.publish(BatchEvent::BatchInterrupted {
            job_id: job_id.to_string(),
            processed,
        })
    }
}
