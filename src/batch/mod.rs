mod engine;
mod job;
mod recovery;
mod state;
mod store;

pub use engine::{BatchEngine, StopHandle};
pub use job::{
    BatchJob, BatchPreview, BatchResult, InterruptedJobInfo, LabelArtifact, PreviewRow,
    RetryConfig, Row, RowOutcome, RowResult, RowStatus, truncate_words,
};
pub use recovery::{RecoveryChoice, find_interrupted, recovery_prompt};
pub use state::JobStatus;
pub use store::{FileJobStore, JobStore, MemoryJobStore};
