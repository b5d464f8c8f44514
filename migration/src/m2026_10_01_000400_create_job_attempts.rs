//! Migration to create the job_attempts table (one row per execution of a job against a model).

use sea_orm_migration::prelude::*;

use crate::m2026_10_01_000300_create_jobs::Jobs;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobAttempts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobAttempts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobAttempts::JobId).uuid().not_null())
                    .col(ColumnDef::new(JobAttempts::Model).text().not_null())
                    .col(
                        ColumnDef::new(JobAttempts::Status)
                            .text()
                            .not_null()
                            .default("IN_PROGRESS"),
                    )
                    .col(
                        ColumnDef::new(JobAttempts::IsFallback)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(JobAttempts::RateWindowStart)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobAttempts::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(JobAttempts::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(JobAttempts::RequestTokens).integer().null())
                    .col(ColumnDef::new(JobAttempts::ResponseTokens).integer().null())
                    .col(ColumnDef::new(JobAttempts::TotalTokens).integer().null())
                    .col(
                        ColumnDef::new(JobAttempts::ResponsePayload)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(JobAttempts::ErrorCode).text().null())
                    .col(ColumnDef::new(JobAttempts::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(JobAttempts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_attempts_job_id")
                            .from(JobAttempts::Table, JobAttempts::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_attempts_job_started")
                    .table(JobAttempts::Table)
                    .col(JobAttempts::JobId)
                    .col(JobAttempts::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_job_attempts_job_started").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(JobAttempts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobAttempts {
    Table,
    Id,
    JobId,
    Model,
    Status,
    IsFallback,
    RateWindowStart,
    StartedAt,
    CompletedAt,
    RequestTokens,
    ResponseTokens,
    TotalTokens,
    ResponsePayload,
    ErrorCode,
    ErrorMessage,
    CreatedAt,
}
