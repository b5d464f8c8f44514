//! Migration to create the batches table.
//!
//! A batch is the group of upload rows sharing (municipality, state, position)
//! and the unit of AI processing. Payload columns are nulled once the upload completes.

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
                    .table(Batches::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Batches::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Batches::UploadId).uuid().not_null())
                    .col(ColumnDef::new(Batches::GroupKey).text().not_null())
                    .col(ColumnDef::new(Batches::Municipality).text().not_null())
                    .col(ColumnDef::new(Batches::State).text().not_null())
                    .col(ColumnDef::new(Batches::Position).text().not_null())
                    .col(
                        ColumnDef::new(Batches::RowCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Batches::RawRows).json_binary().null())
                    .col(ColumnDef::new(Batches::Analysis).json_binary().null())
                    .col(ColumnDef::new(Batches::Structured).json_binary().null())
                    .col(
                        ColumnDef::new(Batches::Status)
                            .text()
                            .not_null()
                            .default("QUEUED"),
                    )
                    .col(ColumnDef::new(Batches::ErrorReason).text().null())
                    .col(ColumnDef::new(Batches::AnalyzeJobId).uuid().null())
                    .col(ColumnDef::new(Batches::StructureJobId).uuid().null())
                    .col(ColumnDef::new(Batches::InsertJobId).uuid().null())
                    .col(
                        ColumnDef::new(Batches::EstimatedAnalyzeTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Batches::EstimatedStructureTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Batches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Batches::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_batches_upload_id")
                            .from(Batches::Table, Batches::UploadId)
                            .to(Uploads::Table, Uploads::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_batches_upload_status")
                    .table(Batches::Table)
                    .col(Batches::UploadId)
                    .col(Batches::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_batches_upload_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Batches::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Batches {
    Table,
    Id,
    UploadId,
    GroupKey,
    Municipality,
    State,
    Position,
    RowCount,
    RawRows,
    Analysis,
    Structured,
    Status,
    ErrorReason,
    AnalyzeJobId,
    StructureJobId,
    InsertJobId,
    EstimatedAnalyzeTokens,
    EstimatedStructureTokens,
    CreatedAt,
    UpdatedAt,
}
