//! Database migrations for the candidate intake pipeline.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000100_create_uploads;
mod m2026_10_01_000200_create_batches;
mod m2026_10_01_000300_create_jobs;
mod m2026_10_01_000400_create_job_attempts;
mod m2026_10_01_000500_create_rate_windows;
mod m2026_10_01_000600_create_notification_logs;
mod m2026_10_01_000700_create_elections_and_candidates;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_10_01_000100_create_uploads::Migration),
            Box::new(m2026_10_01_000200_create_batches::Migration),
            Box::new(m2026_10_01_000300_create_jobs::Migration),
            Box::new(m2026_10_01_000400_create_job_attempts::Migration),
            Box::new(m2026_10_01_000500_create_rate_windows::Migration),
            Box::new(m2026_10_01_000600_create_notification_logs::Migration),
            Box::new(m2026_10_01_000700_create_elections_and_candidates::Migration),
        ]
    }
}
