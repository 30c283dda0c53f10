use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a batch job.
///
/// Previews flow `PENDING → PREVIEWING → PENDING`; executions flow
/// `PENDING → EXECUTING → COMPLETED | FAILED | INTERRUPTED`, and an
/// interrupted job goes back to `EXECUTING` when resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Previewing,
    Executing,
    Completed,
    Failed,
    Interrupted,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Previewing => write!(f, "PREVIEWING"),
            JobStatus::Executing => write!(f, "EXECUTING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Previewing)
                | (Previewing, Pending)
                | (Previewing, Interrupted)
                | (Pending, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Interrupted)
                | (Interrupted, Executing)
                | (Interrupted, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `Executing` counts: a job persisted mid-run means the process died.
    pub fn is_resumable(self) -> bool {
        matches!(self, JobStatus::Interrupted | JobStatus::Executing)
    }
}
