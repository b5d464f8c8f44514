//! Migration to create the notification_logs table.
//!
//! The unique dedup_key guarantees a notification of a given type (and batch,
//! for failure notices) is recorded at most once per upload.

use sea_orm_migration::prelude::*;

use crate::m2026_10_01_000100_create_uploads::Uploads;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NotificationLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NotificationLogs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(NotificationLogs::UploadId).uuid().not_null())
                    .col(
                        ColumnDef::new(NotificationLogs::NotificationType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(NotificationLogs::BatchId).uuid().null())
                    .col(ColumnDef::new(NotificationLogs::DedupKey).text().not_null())
                    .col(
                        ColumnDef::new(NotificationLogs::Status)
                            .text()
                            .not_null()
                            .default("QUEUED"),
                    )
                    .col(
                        ColumnDef::new(NotificationLogs::Recipients)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(NotificationLogs::Subject).text().not_null())
                    .col(ColumnDef::new(NotificationLogs::MessageId).text().null())
                    .col(ColumnDef::new(NotificationLogs::Error).text().null())
                    .col(
                        ColumnDef::new(NotificationLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(NotificationLogs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_notification_logs_upload_id")
                            .from(NotificationLogs::Table, NotificationLogs::UploadId)
                            .to(Uploads::Table, Uploads::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_notification_logs_dedup_key")
                    .table(NotificationLogs::Table)
                    .col(NotificationLogs::DedupKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_notification_logs_dedup_key")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(NotificationLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum NotificationLogs {
    Table,
    Id,
    UploadId,
    NotificationType,
    BatchId,
    DedupKey,
    Status,
    Recipients,
    Subject,
    MessageId,
    Error,
    CreatedAt,
    UpdatedAt,
}
