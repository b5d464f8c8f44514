//! Batch entity model
//!
//! A batch is one group of rows sharing (municipality, state, position), the unit
//! of AI processing. Its three jobs run ANALYZE -> STRUCTURE -> INSERT.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub upload_id: Uuid,

    /// Normalized `municipality|state|position` key
    pub group_key: String,

    pub municipality: String,
    pub state: String,
    pub position: String,

    pub row_count: i32,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    #[serde(skip_serializing)]
    pub raw_rows: Option<Json>,

    /// Stored ANALYZE output (see [`crate::payload::AnalysisResult`])
    #[sea_orm(column_type = "JsonBinary", nullable)]
    #[serde(skip_serializing)]
    pub analysis: Option<Json>,

    /// Stored STRUCTURE output (see [`crate::payload::StructuredResult`])
    #[sea_orm(column_type = "JsonBinary", nullable)]
    #[serde(skip_serializing)]
    pub structured: Option<Json>,

    pub status: BatchStatus,

    pub error_reason: Option<String>,

    pub analyze_job_id: Option<Uuid>,
    pub structure_job_id: Option<Uuid>,
    pub insert_job_id: Option<Uuid>,

    pub estimated_analyze_tokens: i32,
    pub estimated_structure_tokens: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
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
pub enum BatchStatus {
    #[sea_orm(string_value = "QUEUED")]
    #[default]
    Queued,

    #[sea_orm(string_value = "ANALYZING")]
    Analyzing,

    #[sea_orm(string_value = "STRUCTURING")]
    Structuring,

    #[sea_orm(string_value = "INSERTING")]
    Inserting,

    #[sea_orm(string_value = "COMPLETED")]
    Completed,

    #[sea_orm(string_value = "FAILED")]
    Failed,

    #[sea_orm(string_value = "NEEDS_REUPLOAD")]
    NeedsReupload,
}

impl BatchStatus {
    /// Statuses that still have pipeline work ahead of them.
    pub const ACTIVE: [BatchStatus; 4] = [
        BatchStatus::Queued,
        BatchStatus::Analyzing,
        BatchStatus::Structuring,
        BatchStatus::Inserting,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::NeedsReupload)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "QUEUED",
            BatchStatus::Analyzing => "ANALYZING",
            BatchStatus::Structuring => "STRUCTURING",
            BatchStatus::Inserting => "INSERTING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::NeedsReupload => "NEEDS_REUPLOAD",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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
}

impl Related<super::upload::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Upload.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
