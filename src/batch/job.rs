use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::state::JobStatus;
use crate::carrier::RateQuote;
use crate::error::{RowFailure, ShipflowError, codes};
use crate::mode::ExecutionMode;
use crate::storage::LabelState;

/// Per-row processing outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Unprocessed,
    Previewed,
    Succeeded,
    Failed,
    /// Sent before a crash with no recorded outcome; the carrier may have
    /// created the shipment.
    NeedsReview,
}

/// One order in a batch. `payload` is the carrier request body for the
/// shipment and is passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub row_number: u32,
    pub payload: Value,
    pub status: RowStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    Shipped {
        tracking_number: String,
        shipment_id: String,
        cost_cents: i64,
        label_ref: Option<String>,
    },
    Failed {
        error_code: String,
        error_message: String,
    },
    NeedsReview {
        error_code: String,
        error_message: String,
    },
}

/// Terminal result for one row. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResult {
    pub row_number: u32,
    #[serde(flatten)]
    pub outcome: RowOutcome,
    pub completed_at: DateTime<Utc>,
}

impl RowResult {
    pub fn shipped(
        row_number: u32,
        tracking_number: String,
        shipment_id: String,
        cost_cents: i64,
        label_ref: Option<String>,
    ) -> Self {
        Self {
            row_number,
            outcome: RowOutcome::Shipped {
                tracking_number,
                shipment_id,
                cost_cents,
                label_ref,
            },
            completed_at: Utc::now(),
        }
    }

    pub fn failed(row_number: u32, failure: &RowFailure) -> Self {
        Self {
            row_number,
            outcome: RowOutcome::Failed {
                error_code: failure.code.clone(),
                error_message: failure.message.clone(),
            },
            completed_at: Utc::now(),
        }
    }

    /// Held for the operator instead of being sent again.
    pub fn needs_review(row_number: u32) -> Self {
        Self {
            row_number,
            outcome: RowOutcome::NeedsReview {
                error_code: codes::NEEDS_REVIEW.to_string(),
                error_message: format!(
                    "Row {row_number} was sent before an interruption and its outcome is unknown; \
                     check the carrier account before shipping it again"
                ),
            },
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RowOutcome::Shipped { .. })
    }

    pub fn cost_cents(&self) -> i64 {
        match &self.outcome {
            RowOutcome::Shipped { cost_cents, .. } => *cost_cents,
            RowOutcome::Failed { .. } | RowOutcome::NeedsReview { .. } => 0,
        }
    }

    pub fn tracking_number(&self) -> Option<&str> {
        match &self.outcome {
            RowOutcome::Shipped {
                tracking_number, ..
            } => Some(tracking_number),
            RowOutcome::Failed { .. } | RowOutcome::NeedsReview { .. } => None,
        }
    }
}

/// A stored label and where it is in the staged → final lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelArtifact {
    pub row_number: u32,
    pub reference: String,
    pub state: LabelState,
}

const RECIPIENT_NAME_WIDTH: usize = 20;

/// Dry-run quote for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewRow {
    pub row_number: u32,
    pub recipient_name: String,
    pub city_state: String,
    pub service: String,
    pub estimated_cost_cents: i64,
    pub warnings: Vec<String>,
}

impl PreviewRow {
    pub fn from_quote(row: &Row, quote: RateQuote) -> Self {
        let ship_to = ship_to(&row.payload);
        Self {
            row_number: row.row_number,
            recipient_name: truncate_words(&recipient_name(ship_to), RECIPIENT_NAME_WIDTH),
            city_state: city_state(ship_to),
            service: service_name(&row.payload),
            estimated_cost_cents: quote.cost_cents,
            warnings: quote.warnings,
        }
    }

    /// The quote itself failed; show the row with the reason instead of a price.
    pub fn unquoted(row: &Row, reason: String) -> Self {
        Self::from_quote(
            row,
            RateQuote {
                cost_cents: 0,
                currency: String::new(),
                warnings: vec![reason],
            },
        )
    }
}

fn shipment(payload: &Value) -> &Value {
    match payload.get("Shipment") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    }
}

fn ship_to(payload: &Value) -> &Value {
    &shipment(payload)["ShipTo"]
}

fn recipient_name(ship_to: &Value) -> String {
    ["Name", "AttentionName"]
        .iter()
        .filter_map(|key| ship_to[*key].as_str())
        .find(|name| !name.trim().is_empty())
        .unwrap_or("Unknown")
        .to_string()
}

fn city_state(ship_to: &Value) -> String {
    let address = &ship_to["Address"];
    let city = address["City"].as_str().unwrap_or_default().trim();
    let state = address["StateProvinceCode"]
        .as_str()
        .unwrap_or_default()
        .trim();
    match (city.is_empty(), state.is_empty()) {
        (false, false) => format!("{city}, {state}"),
        (false, true) => city.to_string(),
        (true, false) => state.to_string(),
        (true, true) => "Unknown".to_string(),
    }
}

fn service_name(payload: &Value) -> String {
    let code = shipment(payload)["Service"]["Code"]
        .as_str()
        .unwrap_or_default();
    match code {
        "01" => "Next Day Air".to_string(),
        "02" => "2nd Day Air".to_string(),
        "03" => "Ground".to_string(),
        "12" => "3 Day Select".to_string(),
        "13" => "Next Day Air Saver".to_string(),
        "14" => "Next Day Air Early".to_string(),
        "59" => "2nd Day Air A.M.".to_string(),
        "65" => "Saver".to_string(),
        "" => "Unknown".to_string(),
        other => format!("Service {other}"),
    }
}

/// Shorten to at most `max` characters, cutting at the last word boundary
/// when there is one.
pub fn truncate_words(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    match cut.rfind(' ') {
        Some(space) if space > 0 => cut[..space].trim_end().to_string(),
        _ => cut.trim_end().to_string(),
    }
}

/// Quotes for the first rows of a batch plus an estimate for the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPreview {
    pub job_id: String,
    pub total_rows: u32,
    pub preview_rows: Vec<PreviewRow>,
    pub additional_rows: u32,
    pub total_estimated_cost_cents: i64,
    pub rows_with_warnings: u32,
}

impl BatchPreview {
    pub fn from_rows(job_id: &str, total_rows: u32, preview_rows: Vec<PreviewRow>) -> Self {
        let quoted: i64 = preview_rows.iter().map(|r| r.estimated_cost_cents).sum();
        let additional_rows = total_rows.saturating_sub(preview_rows.len() as u32);
        let extrapolated = if additional_rows > 0 && !preview_rows.is_empty() {
            quoted * i64::from(additional_rows) / preview_rows.len() as i64
        } else {
            0
        };
        let rows_with_warnings = preview_rows
            .iter()
            .filter(|r| !r.warnings.is_empty())
            .count() as u32;

        Self {
            job_id: job_id.to_string(),
            total_rows,
            preview_rows,
            additional_rows,
            total_estimated_cost_cents: quoted + extrapolated,
            rows_with_warnings,
        }
    }
}

/// Summary returned by a finished (or aborted) execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_id: String,
    pub status: JobStatus,
    pub total_rows: u32,
    pub processed: u32,
    pub successful: u32,
    pub total_cost_cents: i64,
    pub labels: Vec<String>,
    /// Rows whose shipment may exist but was never confirmed.
    pub needs_review: Vec<u32>,
    pub error: Option<RowFailure>,
}

/// What an operator needs to decide whether to resume a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptedJobInfo {
    pub job_id: String,
    pub status: JobStatus,
    /// Highest row with a successful result; 0 when none.
    pub last_completed_row: u32,
    pub completed_rows: u32,
    pub total_rows: u32,
    pub remaining_rows: u32,
    pub mode: ExecutionMode,
    pub last_tracking_number: Option<String>,
    /// Row that was sent to the carrier without a recorded result. It may or
    /// may not have been charged.
    pub uncertain_row: Option<u32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Configuration for retrying transient carrier errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// A batch of shipments and everything the engine knows about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub rows: Vec<Row>,
    pub mode: ExecutionMode,
    pub status: JobStatus,
    pub status_history: Vec<JobStatus>,
    pub previewed_at: Option<DateTime<Utc>>,
    pub results: Vec<RowResult>,
    pub labels: Vec<LabelArtifact>,
    pub in_flight_row: Option<u32>,
    pub error: Option<RowFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl BatchJob {
    /// Build a job from carrier request bodies, numbering rows from 1.
    /// Without an id a UUID is generated.
    pub fn new(id: Option<String>, payloads: Vec<Value>) -> Result<Self, ShipflowError> {
        let id = match id {
            Some(id) if valid_job_id(&id) => id,
            Some(id) => return Err(ShipflowError::InvalidJobId(id)),
            None => Uuid::new_v4().to_string(),
        };

        let mut rows = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.into_iter().enumerate() {
            let row_number = index as u32 + 1;
            if !payload.is_object() {
                return Err(ShipflowError::InvalidRow(format!(
                    "row {row_number} is not a JSON object"
                )));
            }
            rows.push(Row {
                row_number,
                payload,
                status: RowStatus::Unprocessed,
            });
        }

        let now = Utc::now();
        Ok(Self {
            id,
            rows,
            mode: ExecutionMode::default(),
            status: JobStatus::Pending,
            status_history: Vec::new(),
            previewed_at: None,
            results: Vec::new(),
            labels: Vec::new(),
            in_flight_row: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn total_rows(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn transition(&mut self, to: JobStatus) -> Result<(), ShipflowError> {
        if !self.status.can_transition_to(to) {
            return Err(ShipflowError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status_history.push(self.status);
        self.status = to;
        self.touch();
        Ok(())
    }

    pub fn result_for(&self, row_number: u32) -> Option<&RowResult> {
        self.results.iter().find(|r| r.row_number == row_number)
    }

    /// Append a row's terminal result. A row gets at most one.
    pub fn record_result(&mut self, result: RowResult) -> Result<(), ShipflowError> {
        if self.result_for(result.row_number).is_some() {
            return Err(ShipflowError::InvalidRow(format!(
                "row {} already has a result",
                result.row_number
            )));
        }
        let status = match result.outcome {
            RowOutcome::Shipped { .. } => RowStatus::Succeeded,
            RowOutcome::Failed { .. } => RowStatus::Failed,
            RowOutcome::NeedsReview { .. } => RowStatus::NeedsReview,
        };
        if let Some(row) = self
            .rows
            .iter_mut()
            .find(|r| r.row_number == result.row_number)
        {
            row.status = status;
        }
        if self.in_flight_row == Some(result.row_number) {
            self.in_flight_row = None;
        }
        self.results.push(result);
        self.touch();
        Ok(())
    }

    /// Rows without a result, in row order.
    pub fn pending_rows(&self) -> impl Iterator<Item = &Row> {
        self.rows
            .iter()
            .filter(|row| self.result_for(row.row_number).is_none())
    }

    pub fn successful(&self) -> u32 {
        self.results.iter().filter(|r| r.is_success()).count() as u32
    }

    pub fn total_cost_cents(&self) -> i64 {
        self.results.iter().map(RowResult::cost_cents).sum()
    }

    pub fn last_completed_row(&self) -> u32 {
        self.results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.row_number)
            .max()
            .unwrap_or(0)
    }

    pub fn rows_needing_review(&self) -> impl Iterator<Item = u32> + '_ {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, RowOutcome::NeedsReview { .. }))
            .map(|r| r.row_number)
    }

    pub fn staged_labels(&self) -> impl Iterator<Item = &LabelArtifact> {
        self.labels
            .iter()
            .filter(|label| label.state == LabelState::Staged)
    }

    pub fn to_result(&self) -> BatchResult {
        BatchResult {
            job_id: self.id.clone(),
            status: self.status,
            total_rows: self.total_rows(),
            processed: self.results.len() as u32,
            successful: self.successful(),
            total_cost_cents: self.total_cost_cents(),
            labels: self.labels.iter().map(|l| l.reference.clone()).collect(),
            needs_review: self.rows_needing_review().collect(),
            error: self.error.clone(),
        }
    }

    pub fn interrupted_info(&self) -> InterruptedJobInfo {
        let last_completed_row = self.last_completed_row();
        let last_tracking_number = self
            .results
            .iter()
            .filter(|r| r.is_success())
            .max_by_key(|r| r.row_number)
            .and_then(|r| r.tracking_number().map(str::to_string));
        InterruptedJobInfo {
            job_id: self.id.clone(),
            status: self.status,
            last_completed_row,
            completed_rows: self.successful(),
            total_rows: self.total_rows(),
            remaining_rows: self.total_rows() - self.results.len() as u32,
            mode: self.mode,
            last_tracking_number,
            uncertain_row: self.in_flight_row,
            error_code: self.error.as_ref().map(|e| e.code.clone()),
            error_message: self.error.as_ref().map(|e| e.message.clone()),
        }
    }
}
