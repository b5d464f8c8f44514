//! # Repository Layer
//!
//! Database access for the pipeline: the job queue state machine, summary refresh
//! and the notification log.

pub mod job_queue;
pub mod notification_log;
pub mod summary;

pub use job_queue::{
    BatchProgress, ClaimedJob, CreatedUpload, FailureOutcome, FailureRecord, JobProgress,
    JobQueue, NewUpload, QueueSettings, StageModels, UploadProgress,
};
pub use notification_log::NotificationLogRepository;
pub use summary::{SummaryRefresh, refresh_upload_summary};
