//! JobAttempt entity model
//!
//! One execution of a job against one model. Finalized exactly once.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    pub model: String,

    pub status: AttemptStatus,

    /// True when the model came from the job's fallback list
    pub is_fallback: bool,

    /// Rate window the reservation was charged to
    pub rate_window_start: Option<DateTimeWithTimeZone>,

    pub started_at: DateTimeWithTimeZone,
    pub completed_at: Option<DateTimeWithTimeZone>,

    pub request_tokens: Option<i32>,
    pub response_tokens: Option<i32>,
    pub total_tokens: Option<i32>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    #[serde(skip_serializing)]
    pub response_payload: Option<Json>,

    pub error_code: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    #[sea_orm(string_value = "IN_PROGRESS")]
    #[default]
    InProgress,

    #[sea_orm(string_value = "SUCCEEDED")]
    Succeeded,

    #[sea_orm(string_value = "FAILED")]
    Failed,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job::Entity",
        from = "Column::JobId",
        to = "super::job::Column::Id"
    )]
    Job,
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
