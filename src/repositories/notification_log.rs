//! # NotificationLog Repository
//!
//! One row per notification the pipeline decided to send. The unique `dedup_key`
//! is what makes a notice go out at most once per (upload, type[, batch]).

use chrono::{TimeDelta, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder,
};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::truncate_message;
use crate::models::notification_log::{self, ActiveModel, Column, Entity, Model};
use crate::models::{NotificationStatus, NotificationType};

/// A QUEUED row older than this is assumed abandoned by a crashed sender.
const ABANDONED_AFTER: TimeDelta = TimeDelta::minutes(5);

#[derive(Clone)]
pub struct NotificationLogRepository {
    db: DatabaseConnection,
}

impl NotificationLogRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts a QUEUED row unless one with the same dedup key exists.
    ///
    /// Returns `None` when the notification was already claimed by someone else.
    pub async fn reserve(
        &self,
        upload_id: Uuid,
        notification_type: NotificationType,
        batch_id: Option<Uuid>,
        recipients: &[String],
        subject: &str,
    ) -> Result<Option<Model>, DbErr> {
        let now = to_db_time(Utc::now());
        let id = Uuid::new_v4();
        let entry = ActiveModel {
            id: Set(id),
            upload_id: Set(upload_id),
            notification_type: Set(notification_type),
            batch_id: Set(batch_id),
            dedup_key: Set(Model::dedup_key_for(upload_id, notification_type, batch_id)),
            status: Set(NotificationStatus::Queued),
            recipients: Set(serde_json::json!(recipients)),
            subject: Set(subject.to_string()),
            message_id: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = Entity::insert(entry)
            .on_conflict(
                OnConflict::column(Column::DedupKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        if inserted == 0 {
            return Ok(None);
        }
        Entity::find_by_id(id).one(&self.db).await
    }

    /// Takes over a FAILED or abandoned QUEUED row so the caller may send again.
    pub async fn reclaim(&self, id: Uuid) -> Result<bool, DbErr> {
        let now = Utc::now();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(NotificationStatus::Queued))
            .col_expr(Column::Error, Expr::value(Option::<String>::None))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(Column::Status.eq(NotificationStatus::Failed))
                    .add(
                        Condition::all()
                            .add(Column::Status.eq(NotificationStatus::Queued))
                            .add(Column::UpdatedAt.lt(to_db_time(now - ABANDONED_AFTER))),
                    ),
            )
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn mark_sent(&self, id: Uuid, message_id: &str) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(NotificationStatus::Sent))
            .col_expr(Column::MessageId, Expr::value(Some(message_id.to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(NotificationStatus::Failed))
            .col_expr(
                Column::Error,
                Expr::value(Some(truncate_message(error, 1000))),
            )
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::DedupKey.eq(dedup_key))
            .one(&self.db)
            .await
    }

    pub async fn list_for_upload(&self, upload_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(notification_log::Column::UploadId.eq(upload_id))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }
}
