//! Migration to create the jobs table.
//!
//! Jobs are the durable queue: one row per pipeline step with dependency link,
//! retry bookkeeping and the next eligible run time.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

use crate::m2026_10_01_000100_create_uploads::Uploads;
use crate::m2026_10_01_000200_create_batches::Batches;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::UploadId).uuid().not_null())
                    .col(ColumnDef::new(Jobs::BatchId).uuid().null())
                    .col(ColumnDef::new(Jobs::JobType).text().not_null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .text()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(ColumnDef::new(Jobs::DependencyJobId).uuid().null())
                    .col(
                        ColumnDef::new(Jobs::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::PreferredModels).json_binary().not_null())
                    .col(ColumnDef::new(Jobs::FallbackModels).json_binary().not_null())
                    .col(
                        ColumnDef::new(Jobs::EstimatedRequestTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::EstimatedResponseTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(Jobs::NextRunAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Jobs::LastError).text().null())
                    .col(
                        ColumnDef::new(Jobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_jobs_upload_id")
                            .from(Jobs::Table, Jobs::UploadId)
                            .to(Uploads::Table, Uploads::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_jobs_batch_id")
                            .from(Jobs::Table, Jobs::BatchId)
                            .to(Batches::Table, Batches::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Dispatch order: priority DESC, next_run_at ASC
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_jobs_status_priority_next_run ON jobs (status, priority DESC, next_run_at)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_dependency")
                    .table(Jobs::Table)
                    .col(Jobs::DependencyJobId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_upload_type")
                    .table(Jobs::Table)
                    .col(Jobs::UploadId)
                    .col(Jobs::JobType)
                    .to_owned(),
            )
            .await?;

        // At most one finalization chain per upload
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_upload_workbook ON jobs (upload_id) WHERE job_type = 'WORKBOOK'".to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for index in [
            "idx_jobs_upload_workbook",
            "idx_jobs_upload_type",
            "idx_jobs_dependency",
            "idx_jobs_status_priority_next_run",
        ] {
            manager
                .get_connection()
                .execute(Statement::from_string(
                    manager.get_database_backend(),
                    format!("DROP INDEX IF EXISTS {index}"),
                ))
                .await?;
        }

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Jobs {
    Table,
    Id,
    UploadId,
    BatchId,
    JobType,
    Status,
    DependencyJobId,
    Priority,
    PreferredModels,
    FallbackModels,
    EstimatedRequestTokens,
    EstimatedResponseTokens,
    RetryCount,
    MaxRetries,
    NextRunAt,
    LastError,
    StartedAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}
