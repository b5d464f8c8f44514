//! Job entity model
//!
//! One schedulable step of the pipeline. A job with a dependency is created
//! `PENDING` and only becomes `READY` once the dependency has `SUCCEEDED`.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub upload_id: Uuid,

    /// Owning batch; `None` for the upload-level WORKBOOK and NOTIFICATION jobs
    pub batch_id: Option<Uuid>,

    pub job_type: JobType,

    pub status: JobStatus,

    pub dependency_job_id: Option<Uuid>,

    /// Higher values are dispatched first
    pub priority: i32,

    /// Ordered model names tried first
    #[sea_orm(column_type = "JsonBinary")]
    pub preferred_models: Json,

    /// Ordered model names tried after the preferred list
    #[sea_orm(column_type = "JsonBinary")]
    pub fallback_models: Json,

    pub estimated_request_tokens: i32,
    pub estimated_response_tokens: i32,

    pub retry_count: i32,
    pub max_retries: i32,

    /// Earliest time the dispatcher may pick the job up
    pub next_run_at: DateTimeWithTimeZone,

    pub last_error: Option<String>,

    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn preferred_model_names(&self) -> Vec<String> {
        model_names(&self.preferred_models)
    }

    pub fn fallback_model_names(&self) -> Vec<String> {
        model_names(&self.fallback_models)
    }
}

fn model_names(value: &Json) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[sea_orm(string_value = "ANALYZE")]
    Analyze,

    #[sea_orm(string_value = "STRUCTURE")]
    Structure,

    #[sea_orm(string_value = "INSERT")]
    Insert,

    #[sea_orm(string_value = "WORKBOOK")]
    Workbook,

    #[sea_orm(string_value = "NOTIFICATION")]
    Notification,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Analyze => "ANALYZE",
            JobType::Structure => "STRUCTURE",
            JobType::Insert => "INSERT",
            JobType::Workbook => "WORKBOOK",
            JobType::Notification => "NOTIFICATION",
        }
    }

    /// Whether the job calls the generative-AI service and needs rate capacity.
    pub fn uses_ai(self) -> bool {
        matches!(self, JobType::Analyze | JobType::Structure)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[sea_orm(string_value = "PENDING")]
    #[default]
    Pending,

    #[sea_orm(string_value = "READY")]
    Ready,

    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,

    #[sea_orm(string_value = "SUCCEEDED")]
    Succeeded,

    #[sea_orm(string_value = "FAILED")]
    Failed,

    #[sea_orm(string_value = "SKIPPED")]
    Skipped,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Ready => "READY",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::upload::Entity",
        from = "Column::UploadId",
        to = "super::upload::Column::Id"
    )]
    Upload,
    #[sea_orm(has_many = "super::job_attempt::Entity")]
    Attempts,
}

impl Related<super::upload::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Upload.def()
    }
}

impl Related<super::job_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attempts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
