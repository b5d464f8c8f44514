//! Migration to create the uploads table.
//!
//! One row per submitted spreadsheet. The summary column carries the aggregated
//! batch counters, stage completion timestamps and accumulated insert results.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Uploads::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Uploads::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Uploads::UploaderEmail).text().not_null())
                    .col(ColumnDef::new(Uploads::OriginalFilename).text().not_null())
                    .col(
                        ColumnDef::new(Uploads::Status)
                            .text()
                            .not_null()
                            .default("PROCESSING"),
                    )
                    .col(ColumnDef::new(Uploads::Summary).json_binary().not_null())
                    .col(ColumnDef::new(Uploads::RawRows).json_binary().null())
                    .col(
                        ColumnDef::new(Uploads::ForceHidden)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Uploads::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Uploads::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Uploads::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_uploads_status_created")
                    .table(Uploads::Table)
                    .col(Uploads::Status)
                    .col(Uploads::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_uploads_status_created").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Uploads::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Uploads {
    Table,
    Id,
    UploaderEmail,
    OriginalFilename,
    Status,
    Summary,
    RawRows,
    ForceHidden,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}
