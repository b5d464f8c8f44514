//! Migration to create the rate_windows table.
//!
//! One row per (model, minute-aligned window start). The version column backs
//! the compare-and-increment used by capacity reservations.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RateWindows::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RateWindows::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RateWindows::Model).text().not_null())
                    .col(
                        ColumnDef::new(RateWindows::WindowStart)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RateWindows::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateWindows::RequestCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateWindows::RequestTokens)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateWindows::ResponseTokens)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateWindows::BatchTokens)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateWindows::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RateWindows::UpdatedAt)
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
                    .name("idx_rate_windows_model_window")
                    .table(RateWindows::Table)
                    .col(RateWindows::Model)
                    .col(RateWindows::WindowStart)
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
                    .name("idx_rate_windows_model_window")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RateWindows::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RateWindows {
    Table,
    Id,
    Model,
    WindowStart,
    Version,
    RequestCount,
    RequestTokens,
    ResponseTokens,
    BatchTokens,
    CreatedAt,
    UpdatedAt,
}
