//! RateWindow entity model: per (model, minute) usage counters.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rate_windows")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub model: String,

    /// Minute-aligned UTC start of the window
    pub window_start: DateTimeWithTimeZone,

    /// Bumped on every increment; guards the compare-and-increment
    pub version: i32,

    pub request_count: i32,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub batch_tokens: i64,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
