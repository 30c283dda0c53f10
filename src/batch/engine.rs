//! The batch engine: preview, execute, resume and cancel.
//!
//! Rows are processed strictly in row order, one at a time. The first row
//! that fails stops the batch (fail-fast). The job is checkpointed to the
//! [`JobStore`] before each carrier call and after each result, so a crash
//! never causes a row with a recorded result to be sent again.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::job::{
    BatchJob, BatchPreview, BatchResult, LabelArtifact, PreviewRow, RetryConfig, RowResult,
    RowStatus,
};
use super::state::JobStatus;
use super::store::JobStore;
use crate::carrier::{CarrierError, CarrierService, ShipmentReceipt, ToolCaller};
use crate::error::{RowFailure, ShipflowError, codes};
use crate::events::BatchEmitter;
use crate::mode::{ExecutionMode, ModeManager};
use crate::session::Session;
use crate::storage::{LabelState, LabelStorage};

const DEFAULT_MAX_PREVIEW_ROWS: usize = 20;

/// Asks a running batch to stop after the row in flight. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

pub struct BatchEngine<C> {
    carrier: CarrierService<C>,
    storage: Arc<dyn LabelStorage>,
    store: Arc<dyn JobStore>,
    modes: Arc<ModeManager>,
    events: Arc<BatchEmitter>,
    retry: RetryConfig,
    max_preview_rows: usize,
    stop: StopHandle,
}

impl<C: ToolCaller> BatchEngine<C> {
    pub fn new(
        carrier: CarrierService<C>,
        storage: Arc<dyn LabelStorage>,
        store: Arc<dyn JobStore>,
        session: &Session,
    ) -> Self {
        Self {
            carrier,
            storage,
            store,
            modes: session.modes.clone(),
            events: session.events.clone(),
            retry: RetryConfig::default(),
            max_preview_rows: DEFAULT_MAX_PREVIEW_ROWS,
            stop: StopHandle::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_preview_rows(mut self, rows: usize) -> Self {
        self.max_preview_rows = rows;
        self
    }

    pub fn carrier(&self) -> &CarrierService<C> {
        &self.carrier
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Build a new job from carrier request bodies and store it. An id that
    /// already names a stored job is refused so its results are never lost.
    pub async fn create_job(
        &self,
        id: Option<String>,
        payloads: Vec<Value>,
    ) -> Result<BatchJob, ShipflowError> {
        if let Some(id) = &id {
            match self.store.load(id).await {
                Ok(_) => return Err(ShipflowError::JobExists(id.clone())),
                Err(ShipflowError::JobNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let job = BatchJob::new(id, payloads)?;
        self.checkpoint(&job).await?;
        info!(job_id = %job.id, rows = job.total_rows(), "created job");
        Ok(job)
    }

    /// Quote the first rows of the job without creating anything.
    ///
    /// A quote the carrier rejects becomes a warning on that row; a dead
    /// worker aborts the whole preview. Never touches row results or labels.
    pub async fn preview(&self, job: &mut BatchJob) -> Result<BatchPreview, ShipflowError> {
        job.transition(JobStatus::Previewing)?;
        self.checkpoint(job).await?;
        info!(job_id = %job.id, rows = job.total_rows(), "previewing batch");

        let mut preview_rows = Vec::new();
        let limit = self.max_preview_rows.min(job.rows.len());
        for index in 0..limit {
            if self.stop.take() {
                // Nothing was shipped; the job can be previewed again.
                job.transition(JobStatus::Pending)?;
                self.checkpoint(job).await?;
                info!(job_id = %job.id, "preview interrupted");
                return Err(ShipflowError::Interrupted);
            }

            let row = &job.rows[index];
            let payload = &row.payload;
            let quote = self
                .retrying(&job.id, row.row_number, move || self.carrier.rate(payload))
                .await;
            let preview_row = match quote {
                Ok(quote) => PreviewRow::from_quote(row, quote),
                Err(err) if err.is_worker_unavailable() => {
                    job.transition(JobStatus::Pending)?;
                    self.checkpoint(job).await?;
                    return Err(err.into());
                }
                Err(err) => {
                    let failure = RowFailure::from_carrier(&err);
                    debug!(job_id = %job.id, row = row.row_number, error = %failure, "quote failed");
                    PreviewRow::unquoted(row, failure.to_string())
                }
            };
            job.rows[index].status = RowStatus::Previewed;
            preview_rows.push(preview_row);
        }

        let preview = BatchPreview::from_rows(&job.id, job.total_rows(), preview_rows);
        job.previewed_at = Some(Utc::now());
        job.transition(JobStatus::Pending)?;
        self.checkpoint(job).await?;
        info!(
            job_id = %job.id,
            quoted = preview.preview_rows.len(),
            estimated_cents = preview.total_estimated_cost_cents,
            "preview ready"
        );
        Ok(preview)
    }

    /// Create shipments for every row of a pending job in the session's
    /// current mode. Row failures do not return `Err`: they end the batch
    /// with status `FAILED` and are reported through events and the result.
    pub async fn execute(&self, job: &mut BatchJob) -> Result<BatchResult, ShipflowError> {
        let guard = self.modes.acquire()?;
        let mode = guard.mode();
        if mode == ExecutionMode::Confirm && job.previewed_at.is_none() {
            return Err(ShipflowError::PreviewRequired {
                job_id: job.id.clone(),
            });
        }

        job.mode = mode;
        job.transition(JobStatus::Executing)?;
        self.checkpoint(job).await?;
        info!(job_id = %job.id, rows = job.total_rows(), %mode, "executing batch");

        self.run_rows(job).await
    }

    /// Continue an interrupted (or crashed) job from its first row without a
    /// result, in the mode it was started with. A row that was in flight when
    /// the job stopped is never sent again: it is recorded as needing review.
    pub async fn resume(&self, job_id: &str) -> Result<BatchResult, ShipflowError> {
        let _guard = self.modes.acquire()?;
        let mut job = self.store.load(job_id).await?;
        if !job.status.is_resumable() {
            return Err(ShipflowError::NotResumable {
                job_id: job.id.clone(),
                status: job.status,
            });
        }
        if job.mode == ExecutionMode::Confirm
            && job.previewed_at.is_none()
            && job.results.is_empty()
        {
            return Err(ShipflowError::PreviewRequired { job_id: job.id });
        }

        if job.status == JobStatus::Executing {
            // Persisted mid-run: the previous process died.
            job.transition(JobStatus::Interrupted)?;
        }
        if let Some(row) = job.in_flight_row.take() {
            if job.result_for(row).is_none() {
                warn!(
                    job_id = %job.id,
                    row,
                    "row was sent before the interruption without a recorded result; holding it for review"
                );
                job.record_result(RowResult::needs_review(row))?;
            }
        }
        job.error = None;
        job.transition(JobStatus::Executing)?;
        self.checkpoint(&job).await?;
        info!(
            job_id = %job.id,
            from_row = job.last_completed_row() + 1,
            remaining = job.total_rows() - job.results.len() as u32,
            "resuming batch"
        );

        self.run_rows(&mut job).await
    }

    /// Abandon an interrupted job. Its staged labels are left in place.
    pub async fn cancel(&self, job_id: &str) -> Result<BatchJob, ShipflowError> {
        let _guard = self.modes.acquire()?;
        let mut job = self.store.load(job_id).await?;
        if !job.status.is_resumable() {
            return Err(ShipflowError::NotResumable {
                job_id: job.id.clone(),
                status: job.status,
            });
        }
        if job.status == JobStatus::Executing {
            job.transition(JobStatus::Interrupted)?;
        }
        job.error = Some(RowFailure::new(codes::CANCELLED, "Job cancelled by operator"));
        job.transition(JobStatus::Failed)?;
        self.checkpoint(&job).await?;
        info!(job_id = %job.id, "job cancelled");
        Ok(job)
    }

    async fn run_rows(&self, job: &mut BatchJob) -> Result<BatchResult, ShipflowError> {
        self.events
            .emit_batch_started(&job.id, job.total_rows())
            .await;

        match self.drive(job).await {
            Ok(result) => Ok(result),
            Err(err) => self.abandon(job, err).await,
        }
    }

    /// The row loop. On `Err` the job is still `EXECUTING` and no terminal
    /// event has gone out, unless a row failure was already announced.
    async fn drive(&self, job: &mut BatchJob) -> Result<BatchResult, ShipflowError> {
        let pending: Vec<(u32, Value)> = job
            .pending_rows()
            .map(|row| (row.row_number, row.payload.clone()))
            .collect();

        for (row_number, payload) in pending {
            if self.stop.take() {
                return self.interrupt(job).await;
            }

            self.events.emit_row_started(&job.id, row_number).await;
            job.in_flight_row = Some(row_number);
            self.checkpoint(job).await?;

            match self.ship_row(&job.id, row_number, &payload).await {
                Ok((receipt, label_ref)) => {
                    if let Some(reference) = &label_ref {
                        job.labels.push(LabelArtifact {
                            row_number,
                            reference: reference.clone(),
                            state: LabelState::Staged,
                        });
                    }
                    job.record_result(RowResult::shipped(
                        row_number,
                        receipt.tracking_number.clone(),
                        receipt.shipment_id,
                        receipt.cost_cents,
                        label_ref,
                    ))?;
                    self.checkpoint(job).await?;
                    debug!(job_id = %job.id, row = row_number, tracking = %receipt.tracking_number, "row shipped");
                    self.events
                        .emit_row_completed(
                            &job.id,
                            row_number,
                            &receipt.tracking_number,
                            receipt.cost_cents,
                        )
                        .await;
                }
                Err(failure) => {
                    job.record_result(RowResult::failed(row_number, &failure))?;
                    return self.fail(job, row_number, failure).await;
                }
            }
        }

        if let Err(err) = self.promote_labels(job).await {
            let failure = RowFailure::from_storage(&err);
            warn!(job_id = %job.id, error = %failure, "label promotion failed");
            job.error = Some(failure.clone());
            job.transition(JobStatus::Failed)?;
            let saved = self.checkpoint(job).await;
            self.events
                .emit_batch_failed(
                    &job.id,
                    &failure.code,
                    &failure.message,
                    job.results.len() as u32,
                )
                .await;
            saved?;
            return Ok(job.to_result());
        }

        let mut done = job.clone();
        done.transition(JobStatus::Completed)?;
        self.checkpoint(&done).await?;
        *job = done;
        let result = job.to_result();
        info!(
            job_id = %job.id,
            successful = result.successful,
            total_cents = result.total_cost_cents,
            "batch completed"
        );
        self.events
            .emit_batch_completed(
                &job.id,
                result.total_rows,
                result.successful,
                result.total_cost_cents,
            )
            .await;
        Ok(result)
    }

    /// Create one shipment and stage its label.
    async fn ship_row(
        &self,
        job_id: &str,
        row_number: u32,
        payload: &Value,
    ) -> Result<(ShipmentReceipt, Option<String>), RowFailure> {
        let receipt = self
            .retrying(job_id, row_number, move || self.carrier.create_shipment(payload))
            .await
            .map_err(|err| RowFailure::from_carrier(&err))?;

        let label_ref = match &receipt.label_pdf {
            Some(pdf) => Some(
                self.storage
                    .save_staged(&receipt.tracking_number, pdf, job_id, row_number)
                    .await
                    .map_err(|err| {
                        // The shipment exists; keep its tracking number in the record.
                        RowFailure::new(
                            codes::STORAGE,
                            format!(
                                "Shipment {} was created but its label could not be stored: {err}",
                                receipt.tracking_number
                            ),
                        )
                    })?,
            ),
            None => {
                warn!(job_id, row = row_number, tracking = %receipt.tracking_number, "carrier returned no label");
                None
            }
        };
        Ok((receipt, label_ref))
    }

    async fn fail(
        &self,
        job: &mut BatchJob,
        row_number: u32,
        failure: RowFailure,
    ) -> Result<BatchResult, ShipflowError> {
        warn!(job_id = %job.id, row = row_number, error = %failure, "row failed, stopping batch");
        job.error = Some(failure.clone());
        job.transition(JobStatus::Failed)?;
        let saved = self.checkpoint(job).await;

        self.events
            .emit_row_failed(&job.id, row_number, &failure.code, &failure.message)
            .await;
        self.events
            .emit_batch_failed(
                &job.id,
                &failure.code,
                &failure.message,
                job.results.len() as u32,
            )
            .await;
        saved?;
        Ok(job.to_result())
    }

    /// End a batch whose state could not be recorded. A job still
    /// `EXECUTING` is failed with the error's code and `batch_failed` is
    /// emitted; the save is attempted once more so the store matches.
    async fn abandon(
        &self,
        job: &mut BatchJob,
        err: ShipflowError,
    ) -> Result<BatchResult, ShipflowError> {
        if job.status != JobStatus::Executing {
            if let Err(save_err) = self.checkpoint(job).await {
                warn!(job_id = %job.id, error = %save_err, "job state still not saved");
            }
            return Err(err);
        }

        let failure = RowFailure::new(err.code(), err.to_string());
        error!(job_id = %job.id, error = %failure, "batch aborted");
        job.error = Some(failure.clone());
        job.transition(JobStatus::Failed)?;
        if let Err(save_err) = self.checkpoint(job).await {
            warn!(job_id = %job.id, error = %save_err, "failed job could not be saved");
        }
        self.events
            .emit_batch_failed(
                &job.id,
                &failure.code,
                &failure.message,
                job.results.len() as u32,
            )
            .await;
        Err(err)
    }

    async fn interrupt(&self, job: &mut BatchJob) -> Result<BatchResult, ShipflowError> {
        let mut stopped = job.clone();
        stopped.transition(JobStatus::Interrupted)?;
        self.checkpoint(&stopped).await?;
        *job = stopped;
        let processed = job.results.len() as u32;
        info!(job_id = %job.id, processed, "batch interrupted on request");
        self.events.emit_batch_interrupted(&job.id, processed).await;
        Ok(job.to_result())
    }

    async fn promote_labels(&self, job: &mut BatchJob) -> Result<(), crate::storage::StorageError> {
        for label in job
            .labels
            .iter_mut()
            .filter(|label| label.state == LabelState::Staged)
        {
            let final_ref = self.storage.promote(&label.reference).await?;
            label.reference = final_ref;
            label.state = LabelState::Final;
        }
        Ok(())
    }

    async fn checkpoint(&self, job: &BatchJob) -> Result<(), ShipflowError> {
        self.store.save(job).await
    }

    /// Retry transient carrier rejections with exponential backoff. A dead
    /// worker is never retried: a shipment call may already have gone out.
    async fn retrying<T, F, Fut>(
        &self,
        job_id: &str,
        row_number: u32,
        op: F,
    ) -> Result<T, CarrierError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CarrierError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        job_id,
                        row = row_number,
                        attempt,
                        delay_ms = delay,
                        error = %err,
                        "transient carrier error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MemoryJobStore;
    use crate::carrier::WorkerFault;
    use crate::events::BatchObserver;
    use crate::events::recording::RecordingObserver;
    use crate::storage::LocalLabelStorage;
    use async_trait::async_trait;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted carrier keyed on the `ref` field each test row carries.
    #[derive(Default)]
    struct MockCarrier {
        calls: Mutex<Vec<(String, u64)>>,
        rejected: HashSet<u64>,
        unavailable: HashSet<u64>,
        throttle_first: Mutex<u32>,
        unlabelled: bool,
    }

    impl MockCarrier {
        fn calls_to(&self, tool: &str) -> Vec<u64> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == tool)
                .map(|(_, r)| *r)
                .collect()
        }
    }

    fn cost_cents(reference: u64) -> i64 {
        500 + reference as i64 * 100
    }

    fn money(cents: i64) -> String {
        format!("{}.{:02}", cents / 100, cents % 100)
    }

    impl ToolCaller for MockCarrier {
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CarrierError> {
            let reference = arguments["request_body"]["ref"].as_u64().unwrap_or(0);
            self.calls.lock().unwrap().push((name.to_string(), reference));

            {
                let mut throttle = self.throttle_first.lock().unwrap();
                if *throttle > 0 {
                    *throttle -= 1;
                    return Err(CarrierError::Tool {
                        tool: name.into(),
                        text: "HTTP 429: rate limit exceeded".into(),
                    });
                }
            }
            if self.unavailable.contains(&reference) {
                return Err(CarrierError::WorkerUnavailable(WorkerFault::Exited));
            }
            if self.rejected.contains(&reference) {
                return Err(CarrierError::Tool {
                    tool: name.into(),
                    text: r#"{"code":"120100","message":"Invalid ShipTo address"}"#.into(),
                });
            }

            let cents = cost_cents(reference);
            match name {
                "rate_shipment" => Ok(json!({
                    "RateResponse": {"RatedShipment": {
                        "TotalCharges": {"MonetaryValue": money(cents), "CurrencyCode": "USD"}
                    }}
                })),
                "create_shipment" => {
                    let label = if self.unlabelled {
                        Value::Null
                    } else {
                        json!({"GraphicImage": BASE64.encode(format!("%PDF-{reference}"))})
                    };
                    Ok(json!({
                        "ShipmentResponse": {"ShipmentResults": {
                            "ShipmentIdentificationNumber": format!("1ZSHIP{reference:04}"),
                            "ShipmentCharges": {"TotalCharges": {"MonetaryValue": money(cents), "CurrencyCode": "USD"}},
                            "PackageResults": {"TrackingNumber": format!("1ZTRACK{reference:04}"), "ShippingLabel": label}
                        }}
                    }))
                }
                other => panic!("unexpected tool {other}"),
            }
        }
    }

    struct Harness {
        engine: BatchEngine<Arc<MockCarrier>>,
        carrier: Arc<MockCarrier>,
        session: Session,
        store: Arc<MemoryJobStore>,
        storage: Arc<LocalLabelStorage>,
        recorder: Arc<RecordingObserver>,
        _dir: TempDir,
    }

    fn harness(carrier: MockCarrier) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let carrier = Arc::new(carrier);
        let session = Session::new();
        let recorder = Arc::new(RecordingObserver::default());
        session.events.add_observer(recorder.clone());
        let store = Arc::new(MemoryJobStore::new());
        let storage = Arc::new(LocalLabelStorage::new(dir.path().join("labels")));
        let engine = BatchEngine::new(
            CarrierService::new(carrier.clone()),
            storage.clone(),
            store.clone(),
            &session,
        )
        .with_retry(RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
        });
        Harness {
            engine,
            carrier,
            session,
            store,
            storage,
            recorder,
            _dir: dir,
        }
    }

    fn job(id: &str, rows: u64) -> BatchJob {
        let payloads = (1..=rows)
            .map(|r| {
                json!({
                    "ref": r,
                    "Shipment": {
                        "ShipTo": {"Name": format!("Customer {r}"), "Address": {"City": "Denver", "StateProvinceCode": "CO"}},
                        "Service": {"Code": "03"}
                    }
                })
            })
            .collect();
        BatchJob::new(Some(id.to_string()), payloads).unwrap()
    }

    fn auto(h: &Harness) {
        h.session.modes.set_mode(ExecutionMode::Auto).unwrap();
    }

    #[tokio::test]
    async fn preview_quotes_rows_without_side_effects() {
        let h = harness(MockCarrier::default());
        let mut job = job("prev-3", 3);

        let preview = h.engine.preview(&mut job).await.unwrap();

        assert_eq!(preview.preview_rows.len(), 3);
        assert_eq!(preview.total_estimated_cost_cents, 600 + 700 + 800);
        assert_eq!(preview.preview_rows[0].recipient_name, "Customer 1");
        assert_eq!(preview.preview_rows[0].city_state, "Denver, CO");
        assert!(job.results.is_empty());
        assert!(job.labels.is_empty());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.previewed_at.is_some());
        assert!(h.carrier.calls_to("create_shipment").is_empty());
        assert!(!h.storage.base_dir().exists());
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn preview_caps_quotes_and_extrapolates() {
        let mut carrier = MockCarrier::default();
        carrier.rejected.insert(2);
        let h = harness(carrier);
        let engine = h.engine.with_max_preview_rows(2);
        let mut job = job("prev-cap", 6);

        let preview = engine.preview(&mut job).await.unwrap();

        assert_eq!(h.carrier.calls_to("rate_shipment"), vec![1, 2]);
        assert_eq!(preview.additional_rows, 4);
        assert_eq!(preview.rows_with_warnings, 1);
        assert_eq!(preview.preview_rows[1].estimated_cost_cents, 0);
        assert!(preview.preview_rows[1].warnings[0].contains("E-3003"));
        // 600 quoted over 2 rows, 4 more at the average.
        assert_eq!(preview.total_estimated_cost_cents, 600 + 1200);
    }

    #[tokio::test]
    async fn preview_aborts_when_worker_is_gone() {
        let mut carrier = MockCarrier::default();
        carrier.unavailable.insert(2);
        let h = harness(carrier);
        let mut job = job("prev-dead", 3);

        let err = h.engine.preview(&mut job).await.unwrap_err();
        assert_eq!(err.code(), "E-3001");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.previewed_at.is_none());
    }

    #[tokio::test]
    async fn row_failure_stops_the_batch() {
        let mut carrier = MockCarrier::default();
        carrier.rejected.insert(3);
        let h = harness(carrier);
        auto(&h);
        let mut job = job("fail-fast", 5);

        let result = h.engine.execute(&mut job).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.processed, 3);
        assert_eq!(
            job.results.iter().map(|r| r.row_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(!job.results[2].is_success());
        assert_eq!(h.carrier.calls_to("create_shipment"), vec![1, 2, 3]);

        let events = h.recorder.events();
        assert!(!events.iter().any(|e| matches!(
            e,
            crate::events::BatchEvent::RowStarted { row_number, .. } if *row_number > 3
        )));
        match events.last().unwrap() {
            crate::events::BatchEvent::BatchFailed {
                processed,
                error_code,
                ..
            } => {
                assert_eq!(*processed, 3);
                assert_eq!(error_code, "E-3003");
            }
            other => panic!("unexpected last event {other:?}"),
        }

        // Labels of the shipped rows stay staged.
        assert_eq!(job.staged_labels().count(), 2);
        for label in &job.labels {
            assert!(h.storage.exists(&label.reference).await);
        }
        assert!(!h.session.modes.is_locked());
        assert_eq!(h.store.load("fail-fast").await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn successful_batch_promotes_labels() {
        let h = harness(MockCarrier::default());
        auto(&h);
        let mut job = job("all-good", 2);

        let result = h.engine.execute(&mut job).await.unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.successful, 2);
        assert_eq!(result.total_cost_cents, 600 + 700);
        assert_eq!(job.labels.len(), 2);
        for label in &job.labels {
            assert_eq!(label.state, LabelState::Final);
            assert!(!label.reference.contains("staging"));
            assert!(h.storage.exists(&label.reference).await);
        }
        assert_eq!(
            h.recorder.names(),
            vec![
                "batch_started",
                "row_started",
                "row_completed",
                "row_started",
                "row_completed",
                "batch_completed"
            ]
        );
        assert!(matches!(
            h.recorder.events().last().unwrap(),
            crate::events::BatchEvent::BatchCompleted { successful: 2, total_cost_cents: 1300, .. }
        ));
        assert!(!h.session.modes.is_locked());
        assert_eq!(job.mode, ExecutionMode::Auto);
    }

    #[tokio::test]
    async fn confirm_mode_requires_a_preview() {
        let h = harness(MockCarrier::default());
        let mut job = job("gate", 1);

        let err = h.engine.execute(&mut job).await.unwrap_err();
        assert!(matches!(err, ShipflowError::PreviewRequired { .. }));
        assert!(!h.session.modes.is_locked());
        assert_eq!(job.status, JobStatus::Pending);

        h.engine.preview(&mut job).await.unwrap();
        let result = h.engine.execute(&mut job).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(job.mode, ExecutionMode::Confirm);
    }

    #[tokio::test]
    async fn only_one_execution_per_session() {
        let h = harness(MockCarrier::default());
        auto(&h);
        let _running = h.session.modes.acquire().unwrap();
        let mut job = job("second", 1);

        let err = h.engine.execute(&mut job).await.unwrap_err();
        assert!(matches!(err, ShipflowError::ExecutionInProgress));
        assert!(h.carrier.calls_to("create_shipment").is_empty());
    }

    /// Tries to flip the mode from inside the batch.
    struct ModeFlipper {
        modes: Arc<ModeManager>,
        outcomes: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl BatchObserver for ModeFlipper {
        async fn row_started(&self, _job_id: &str, _row_number: u32) -> anyhow::Result<()> {
            let outcome = self.modes.set_mode(ExecutionMode::Confirm);
            self.outcomes
                .lock()
                .unwrap()
                .push(matches!(outcome, Err(ShipflowError::LockedMode)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn mode_is_locked_while_executing() {
        let h = harness(MockCarrier::default());
        auto(&h);
        let flipper = Arc::new(ModeFlipper {
            modes: h.session.modes.clone(),
            outcomes: Mutex::new(Vec::new()),
        });
        h.session.events.add_observer(flipper.clone());
        let mut job = job("locked", 2);

        h.engine.execute(&mut job).await.unwrap();

        assert_eq!(*flipper.outcomes.lock().unwrap(), vec![true, true]);
        assert_eq!(h.session.modes.get_mode(), ExecutionMode::Auto);
        h.session.modes.set_mode(ExecutionMode::Confirm).unwrap();
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let carrier = MockCarrier {
            throttle_first: Mutex::new(2),
            ..Default::default()
        };
        let h = harness(carrier);
        auto(&h);
        let mut job = job("retry", 1);

        let result = h.engine.execute(&mut job).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(h.carrier.calls_to("create_shipment"), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn worker_loss_is_not_retried() {
        let mut carrier = MockCarrier::default();
        carrier.unavailable.insert(1);
        let h = harness(carrier);
        auto(&h);
        let mut job = job("dead", 2);

        let result = h.engine.execute(&mut job).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.unwrap().code, "E-3001");
        assert_eq!(h.carrier.calls_to("create_shipment"), vec![1]);
    }

    #[tokio::test]
    async fn missing_label_still_ships_the_row() {
        let carrier = MockCarrier {
            unlabelled: true,
            ..Default::default()
        };
        let h = harness(carrier);
        auto(&h);
        let mut job = job("nolabel", 1);

        let result = h.engine.execute(&mut job).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert!(job.labels.is_empty());
        assert_eq!(job.results[0].tracking_number(), Some("1ZTRACK0001"));
    }

    #[tokio::test]
    async fn resume_skips_rows_with_results() {
        let h = harness(MockCarrier::default());
        let mut job = job("crashed", 4);
        job.transition(JobStatus::Executing).unwrap();
        job.mode = ExecutionMode::Auto;
        job.record_result(RowResult::shipped(1, "1ZTRACK0001".into(), "S1".into(), 600, None))
            .unwrap();
        job.record_result(RowResult::shipped(2, "1ZTRACK0002".into(), "S2".into(), 700, None))
            .unwrap();
        job.in_flight_row = Some(3);
        h.store.save(&job).await.unwrap();

        let result = h.engine.resume("crashed").await.unwrap();

        // Row 3 may already be charged: it is held, never sent again.
        assert_eq!(h.carrier.calls_to("create_shipment"), vec![4]);
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.successful, 3);
        assert_eq!(result.needs_review, vec![3]);
        let stored = h.store.load("crashed").await.unwrap();
        assert_eq!(stored.in_flight_row, None);
        assert_eq!(stored.results.len(), 4);
        assert_eq!(stored.rows[2].status, RowStatus::NeedsReview);
        match &stored.result_for(3).unwrap().outcome {
            crate::batch::RowOutcome::NeedsReview { error_code, .. } => {
                assert_eq!(error_code, "E-2007")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    /// Requests a stop once a given row completes.
    struct StopAfter {
        row: u32,
        stop: StopHandle,
    }

    #[async_trait]
    impl BatchObserver for StopAfter {
        async fn row_completed(
            &self,
            _job_id: &str,
            row_number: u32,
            _tracking_number: &str,
            _cost_cents: i64,
        ) -> anyhow::Result<()> {
            if row_number == self.row {
                self.stop.request_stop();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_interrupts_between_rows_and_resume_finishes() {
        let h = harness(MockCarrier::default());
        auto(&h);
        let stopper: Arc<dyn BatchObserver> = Arc::new(StopAfter {
            row: 2,
            stop: h.engine.stop_handle(),
        });
        h.session.events.add_observer(stopper.clone());
        let mut job = job("stopped", 4);

        let result = h.engine.execute(&mut job).await.unwrap();
        assert_eq!(result.status, JobStatus::Interrupted);
        assert_eq!(result.processed, 2);
        assert_eq!(h.recorder.names().last(), Some(&"batch_interrupted"));
        assert_eq!(job.staged_labels().count(), 2);
        assert!(!h.session.modes.is_locked());

        let info = job.interrupted_info();
        assert_eq!(info.last_completed_row, 2);
        assert_eq!(info.remaining_rows, 2);

        h.session.events.remove_observer(&stopper).unwrap();
        let result = h.engine.resume("stopped").await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(h.carrier.calls_to("create_shipment"), vec![1, 2, 3, 4]);
        let stored = h.store.load("stopped").await.unwrap();
        assert_eq!(stored.labels.len(), 4);
        assert!(stored.labels.iter().all(|l| l.state == LabelState::Final));
    }

    #[tokio::test]
    async fn failed_jobs_cannot_be_resumed() {
        let mut carrier = MockCarrier::default();
        carrier.rejected.insert(1);
        let h = harness(carrier);
        auto(&h);
        let mut job = job("no-resume", 2);
        h.engine.execute(&mut job).await.unwrap();

        let err = h.engine.resume("no-resume").await.unwrap_err();
        assert!(matches!(err, ShipflowError::NotResumable { .. }));
        assert_eq!(err.code(), "E-2004");
    }

    #[tokio::test]
    async fn cancel_marks_interrupted_job_failed() {
        let h = harness(MockCarrier::default());
        let mut job = job("to-cancel", 2);
        job.transition(JobStatus::Executing).unwrap();
        job.transition(JobStatus::Interrupted).unwrap();
        h.store.save(&job).await.unwrap();

        let cancelled = h.engine.cancel("to-cancel").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error.unwrap().code, "E-2006");

        let err = h.engine.cancel("to-cancel").await.unwrap_err();
        assert!(matches!(err, ShipflowError::NotResumable { .. }));
        let err = h.engine.cancel("unknown").await.unwrap_err();
        assert!(matches!(err, ShipflowError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn stopped_preview_returns_to_pending() {
        let h = harness(MockCarrier::default());
        let mut job = job("prev-stop", 3);
        h.store.save(&job).await.unwrap();

        h.engine.stop_handle().request_stop();
        let err = h.engine.preview(&mut job).await.unwrap_err();
        assert!(matches!(err, ShipflowError::Interrupted));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(h.carrier.calls_to("rate_shipment").is_empty());
        assert!(
            crate::batch::find_interrupted(h.store.as_ref())
                .await
                .unwrap()
                .is_empty()
        );

        h.engine.preview(&mut job).await.unwrap();
        assert!(job.previewed_at.is_some());
    }

    #[tokio::test]
    async fn create_job_refuses_an_existing_id() {
        let h = harness(MockCarrier::default());
        auto(&h);
        let payloads = vec![json!({"ref": 1}), json!({"ref": 2})];
        let mut created = h
            .engine
            .create_job(Some("orders".into()), payloads.clone())
            .await
            .unwrap();
        h.engine.execute(&mut created).await.unwrap();

        let err = h
            .engine
            .create_job(Some("orders".into()), payloads.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ShipflowError::JobExists(ref id) if id == "orders"));
        assert_eq!(err.code(), "E-1001");

        let stored = h.store.load("orders").await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.results.len(), 2);
        assert_eq!(h.carrier.calls_to("create_shipment"), vec![1, 2]);

        let fresh = h.engine.create_job(None, payloads).await.unwrap();
        assert_eq!(h.store.load(&fresh.id).await.unwrap().total_rows(), 2);
    }

    /// Local label storage that can refuse writes or promotions.
    struct BrokenStorage {
        inner: LocalLabelStorage,
        fail_save: bool,
        fail_promote: bool,
    }

    #[async_trait]
    impl LabelStorage for BrokenStorage {
        async fn save_final(
            &self,
            tracking_number: &str,
            pdf: &[u8],
            job_id: &str,
            row_number: u32,
        ) -> Result<String, crate::storage::StorageError> {
            self.inner
                .save_final(tracking_number, pdf, job_id, row_number)
                .await
        }

        async fn save_staged(
            &self,
            tracking_number: &str,
            pdf: &[u8],
            job_id: &str,
            row_number: u32,
        ) -> Result<String, crate::storage::StorageError> {
            if self.fail_save {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner
                .save_staged(tracking_number, pdf, job_id, row_number)
                .await
        }

        async fn promote(&self, staged_ref: &str) -> Result<String, crate::storage::StorageError> {
            if self.fail_promote {
                return Err(crate::storage::StorageError::NotFound {
                    reference: staged_ref.to_string(),
                });
            }
            self.inner.promote(staged_ref).await
        }

        async fn exists(&self, reference: &str) -> bool {
            self.inner.exists(reference).await
        }
    }

    /// Memory store whose listed saves (1-based) fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryJobStore,
        saves: std::sync::atomic::AtomicUsize,
        failing: Mutex<HashSet<usize>>,
    }

    impl FlakyStore {
        fn failing(saves: impl IntoIterator<Item = usize>) -> Self {
            Self {
                failing: Mutex::new(saves.into_iter().collect()),
                ..Default::default()
            }
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn save(&self, job: &BatchJob) -> Result<(), ShipflowError> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.lock().unwrap().contains(&n) {
                return Err(ShipflowError::Persistence(format!("save {n}: disk full")));
            }
            self.inner.save(job).await
        }

        async fn load(&self, job_id: &str) -> Result<BatchJob, ShipflowError> {
            self.inner.load(job_id).await
        }

        async fn list(&self) -> Result<Vec<BatchJob>, ShipflowError> {
            self.inner.list().await
        }
    }

    struct Rig {
        engine: BatchEngine<Arc<MockCarrier>>,
        carrier: Arc<MockCarrier>,
        session: Session,
        recorder: Arc<RecordingObserver>,
        _dir: TempDir,
    }

    fn rig(
        carrier: MockCarrier,
        fail_save: bool,
        fail_promote: bool,
        store: Arc<dyn JobStore>,
    ) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let carrier = Arc::new(carrier);
        let session = Session::new();
        session.modes.set_mode(ExecutionMode::Auto).unwrap();
        let recorder = Arc::new(RecordingObserver::default());
        session.events.add_observer(recorder.clone());
        let engine = BatchEngine::new(
            CarrierService::new(carrier.clone()),
            Arc::new(BrokenStorage {
                inner: LocalLabelStorage::new(dir.path().join("labels")),
                fail_save,
                fail_promote,
            }),
            store,
            &session,
        );
        Rig {
            engine,
            carrier,
            session,
            recorder,
            _dir: dir,
        }
    }

    fn last_batch_failed(events: &[crate::events::BatchEvent]) -> (String, u32) {
        match events.last().unwrap() {
            crate::events::BatchEvent::BatchFailed {
                error_code,
                processed,
                ..
            } => (error_code.clone(), *processed),
            other => panic!("unexpected last event {other:?}"),
        }
    }

    #[tokio::test]
    async fn label_write_failure_fails_the_row_and_keeps_tracking() {
        let r = rig(
            MockCarrier::default(),
            true,
            false,
            Arc::new(MemoryJobStore::new()),
        );
        let mut job = job("no-disk", 3);

        let result = r.engine.execute(&mut job).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.processed, 1);
        assert_eq!(r.carrier.calls_to("create_shipment"), vec![1]);
        match &job.results[0].outcome {
            crate::batch::RowOutcome::Failed {
                error_code,
                error_message,
            } => {
                assert_eq!(error_code, "E-4002");
                assert!(error_message.contains("1ZTRACK0001"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            last_batch_failed(&r.recorder.events()),
            ("E-4002".to_string(), 1)
        );
        assert!(!r.session.modes.is_locked());
    }

    #[tokio::test]
    async fn promotion_failure_fails_the_batch_and_leaves_labels_staged() {
        let r = rig(
            MockCarrier::default(),
            false,
            true,
            Arc::new(MemoryJobStore::new()),
        );
        let mut job = job("no-promote", 2);

        let result = r.engine.execute(&mut job).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.successful, 2);
        assert_eq!(result.error.unwrap().code, "E-4002");
        assert_eq!(job.staged_labels().count(), 2);
        assert!(!r.recorder.names().contains(&"batch_completed"));
        assert_eq!(
            last_batch_failed(&r.recorder.events()),
            ("E-4002".to_string(), 2)
        );
        assert!(!r.session.modes.is_locked());
    }

    #[tokio::test]
    async fn lost_checkpoint_fails_the_batch_with_persistence_code() {
        // Saves: 1 executing, 2 row 1 in flight, 3 row 1 result.
        let store = Arc::new(FlakyStore::failing([3]));
        let r = rig(MockCarrier::default(), false, false, store.clone());
        let mut job = job("flaky", 2);

        let err = r.engine.execute(&mut job).await.unwrap_err();

        assert_eq!(err.code(), "E-4003");
        assert_eq!(r.carrier.calls_to("create_shipment"), vec![1]);
        assert_eq!(
            r.recorder.names(),
            vec!["batch_started", "row_started", "batch_failed"]
        );
        assert_eq!(
            last_batch_failed(&r.recorder.events()),
            ("E-4003".to_string(), 1)
        );
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!r.session.modes.is_locked());

        // The retried save recorded the shipped row.
        let stored = store.load("flaky").await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.in_flight_row, None);
        assert_eq!(stored.results[0].tracking_number(), Some("1ZTRACK0001"));
    }

    #[tokio::test]
    async fn resume_after_lost_result_never_reships_the_row() {
        // Every save after the in-flight marker fails.
        let store = Arc::new(FlakyStore::failing(3..=20));
        let r = rig(MockCarrier::default(), false, false, store.clone());
        let mut job = job("lost", 2);

        let err = r.engine.execute(&mut job).await.unwrap_err();
        assert_eq!(err.code(), "E-4003");
        let stored = store.load("lost").await.unwrap();
        assert_eq!(stored.status, JobStatus::Executing);
        assert_eq!(stored.in_flight_row, Some(1));
        assert!(stored.results.is_empty());

        store.heal();
        let result = r.engine.resume("lost").await.unwrap();

        assert_eq!(r.carrier.calls_to("create_shipment"), vec![1, 2]);
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.needs_review, vec![1]);
        assert_eq!(result.successful, 1);
    }
}
