//! NotificationLog entity model
//!
//! One record per attempted external notification. `dedup_key` is unique, so a
//! second insert for the same (upload, type[, batch]) is rejected by the database.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notification_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub upload_id: Uuid,

    pub notification_type: NotificationType,

    /// Set only for per-batch failure notices
    pub batch_id: Option<Uuid>,

    #[sea_orm(unique)]
    pub dedup_key: String,

    pub status: NotificationStatus,

    #[sea_orm(column_type = "JsonBinary")]
    pub recipients: Json,

    pub subject: String,

    pub message_id: Option<String>,

    pub error: Option<String>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Builds the dedup key for a notification.
    pub fn dedup_key_for(
        upload_id: Uuid,
        notification_type: NotificationType,
        batch_id: Option<Uuid>,
    ) -> String {
        match batch_id {
            Some(batch_id) => format!("{upload_id}:{notification_type}:{batch_id}"),
            None => format!("{upload_id}:{notification_type}"),
        }
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
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    #[sea_orm(string_value = "UPLOAD_QUEUED")]
    UploadQueued,

    #[sea_orm(string_value = "ANALYZE_COMPLETE")]
    AnalyzeComplete,

    #[sea_orm(string_value = "STRUCTURE_COMPLETE")]
    StructureComplete,

    #[sea_orm(string_value = "INSERT_COMPLETE")]
    InsertComplete,

    #[sea_orm(string_value = "BATCH_FAILED")]
    BatchFailed,

    #[sea_orm(string_value = "COMPLETED")]
    Completed,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::UploadQueued => "UPLOAD_QUEUED",
            NotificationType::AnalyzeComplete => "ANALYZE_COMPLETE",
            NotificationType::StructureComplete => "STRUCTURE_COMPLETE",
            NotificationType::InsertComplete => "INSERT_COMPLETE",
            NotificationType::BatchFailed => "BATCH_FAILED",
            NotificationType::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for NotificationType {
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
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    #[sea_orm(string_value = "QUEUED")]
    #[default]
    Queued,

    #[sea_orm(string_value = "SENT")]
    Sent,

    #[sea_orm(string_value = "FAILED")]
    Failed,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
