//! # Data Models
//!
//! SeaORM entities for the intake pipeline plus a few response types shared by the HTTP surface.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod batch;
pub mod candidate;
pub mod election;
pub mod job;
pub mod job_attempt;
pub mod notification_log;
pub mod rate_window;
pub mod upload;

pub use batch::{BatchStatus, Entity as Batch};
pub use candidate::Entity as Candidate;
pub use election::Entity as Election;
pub use job::{Entity as Job, JobStatus, JobType};
pub use job_attempt::{AttemptStatus, Entity as JobAttempt};
pub use notification_log::{Entity as NotificationLog, NotificationStatus, NotificationType};
pub use rate_window::Entity as RateWindow;
pub use upload::{Entity as Upload, UploadStatus};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "candidate-intake".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
