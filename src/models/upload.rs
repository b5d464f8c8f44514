//! Upload entity model
//!
//! One user-submitted spreadsheet. The `summary` column holds the aggregated
//! [`UploadSummary`](crate::payload::UploadSummary) blob.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "uploads")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Email of the uploader; first recipient of every notification
    pub uploader_email: String,

    pub original_filename: String,

    pub status: UploadStatus,

    /// Aggregated counters, stage completion timestamps and insert results
    #[sea_orm(column_type = "JsonBinary")]
    pub summary: Json,

    /// Every uploaded row, kept for the workbook export; scrubbed after notification
    #[sea_orm(column_type = "JsonBinary", nullable)]
    #[serde(skip_serializing)]
    pub raw_rows: Option<Json>,

    /// Inserted candidates are hidden from public listings when set
    pub force_hidden: bool,

    pub completed_at: Option<DateTimeWithTimeZone>,

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
pub enum UploadStatus {
    #[sea_orm(string_value = "PROCESSING")]
    #[default]
    Processing,

    #[sea_orm(string_value = "COMPLETED")]
    Completed,

    #[sea_orm(string_value = "FAILED")]
    Failed,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::batch::Entity")]
    Batches,
    #[sea_orm(has_many = "super::job::Entity")]
    Jobs,
}

impl Related<super::batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batches.def()
    }
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Jobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
