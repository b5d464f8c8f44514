//! Migration to create the elections and candidates tables written by the INSERT stage.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Elections::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Elections::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Elections::Municipality).text().not_null())
                    .col(ColumnDef::new(Elections::State).text().not_null())
                    .col(ColumnDef::new(Elections::Position).text().not_null())
                    .col(
                        ColumnDef::new(Elections::ElectionDate)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Elections::Description).text().null())
                    .col(
                        ColumnDef::new(Elections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Elections::UpdatedAt)
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
                    .name("idx_elections_natural_key")
                    .table(Elections::Table)
                    .col(Elections::Municipality)
                    .col(Elections::State)
                    .col(Elections::Position)
                    .col(Elections::ElectionDate)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Candidates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Candidates::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Candidates::ElectionId).uuid().not_null())
                    .col(ColumnDef::new(Candidates::UploadId).uuid().null())
                    .col(ColumnDef::new(Candidates::Slug).text().not_null())
                    .col(ColumnDef::new(Candidates::FullName).text().not_null())
                    .col(ColumnDef::new(Candidates::Email).text().null())
                    .col(ColumnDef::new(Candidates::Party).text().null())
                    .col(ColumnDef::new(Candidates::Website).text().null())
                    .col(ColumnDef::new(Candidates::Bio).text().null())
                    .col(
                        ColumnDef::new(Candidates::Hidden)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Candidates::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Candidates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_candidates_election_id")
                            .from(Candidates::Table, Candidates::ElectionId)
                            .to(Elections::Table, Elections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_candidates_slug")
                    .table(Candidates::Table)
                    .col(Candidates::Slug)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_candidates_slug").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Candidates::Table).to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_elections_natural_key").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Elections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Elections {
    Table,
    Id,
    Municipality,
    State,
    Position,
    ElectionDate,
    Description,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Candidates {
    Table,
    Id,
    ElectionId,
    UploadId,
    Slug,
    FullName,
    Email,
    Party,
    Website,
    Bio,
    Hidden,
    CreatedAt,
    UpdatedAt,
}
