//! Finding and describing jobs that did not finish.

use std::fmt::Write as _;
use std::str::FromStr;

use super::job::InterruptedJobInfo;
use super::store::JobStore;
use crate::error::ShipflowError;

/// What the operator wants to do with an interrupted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    Resume,
    Cancel,
}

impl FromStr for RecoveryChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resume" | "r" => Ok(RecoveryChoice::Resume),
            "cancel" | "c" => Ok(RecoveryChoice::Cancel),
            other => Err(format!("unknown choice '{other}': expected resume or cancel")),
        }
    }
}

/// Jobs that were stopped on request, or left executing by a crash.
pub async fn find_interrupted(
    store: &dyn JobStore,
) -> Result<Vec<InterruptedJobInfo>, ShipflowError> {
    Ok(store
        .list()
        .await?
        .iter()
        .filter(|job| job.status.is_resumable())
        .map(|job| job.interrupted_info())
        .collect())
}

pub fn recovery_prompt(info: &InterruptedJobInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Job '{}' was interrupted with {}/{} rows shipped.",
        info.job_id, info.completed_rows, info.total_rows
    );
    out.push('\n');
    if let Some(tracking) = &info.last_tracking_number {
        let _ = writeln!(
            out,
            "Last completed: row {} (tracking: {tracking})",
            info.last_completed_row
        );
    }
    let _ = writeln!(out, "Remaining: {} rows", info.remaining_rows);
    if let Some(row) = info.uncertain_row {
        let _ = writeln!(
            out,
            "Warning: row {row} was sent to the carrier but no result was recorded. \
             Resume will not send it again; it is marked for review. \
             Check the carrier account to see whether it shipped."
        );
    }
    if let (Some(code), Some(message)) = (&info.error_code, &info.error_message) {
        let _ = writeln!(out, "\nLast error: {code}: {message}");
    }
    out.push_str("\nOptions:\n");
    out.push_str("  [resume] - Continue from the first row without a result\n");
    out.push_str("  [cancel] - Abandon this job\n");
    out
}
