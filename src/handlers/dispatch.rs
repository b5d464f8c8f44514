//! # Dispatch API Handler
//!
//! Cron-style trigger for a single dispatcher tick.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::auth::OperatorAuth;
use crate::dispatcher::{DispatchOptions, DispatcherRunStats};
use crate::error::{ApiError, validation_error};
use crate::server::AppState;

const MAX_JOBS_LIMIT: u64 = 500;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct DispatchQuery {
    /// Jobs fetched this tick (1-500)
    pub max_jobs: Option<u64>,
    /// Wall-clock budget for the tick in milliseconds
    pub time_budget_ms: Option<u64>,
}

impl DispatchQuery {
    fn apply(&self, defaults: DispatchOptions) -> Result<DispatchOptions, ApiError> {
        let mut options = defaults;
        if let Some(max_jobs) = self.max_jobs {
            if !(1..=MAX_JOBS_LIMIT).contains(&max_jobs) {
                return Err(validation_error(
                    "Invalid max_jobs",
                    serde_json::json!({ "max_jobs": format!("Must be between 1 and {MAX_JOBS_LIMIT}") }),
                ));
            }
            options.max_jobs = max_jobs;
        }
        if let Some(budget) = self.time_budget_ms {
            if budget == 0 {
                return Err(validation_error(
                    "Invalid time_budget_ms",
                    serde_json::json!({ "time_budget_ms": "Must be positive" }),
                ));
            }
            options.time_budget = Duration::from_millis(budget);
        }
        Ok(options)
    }
}

/// Runs one dispatcher tick and returns its statistics
#[utoipa::path(
    post,
    path = "/dispatch",
    security(("bearer_auth" = [])),
    params(DispatchQuery),
    responses(
        (status = 200, description = "Tick finished", body = DispatcherRunStats),
        (status = 400, description = "Invalid overrides", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "dispatch"
)]
pub async fn run_dispatch(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Query(query): Query<DispatchQuery>,
) -> Result<Json<DispatcherRunStats>, ApiError> {
    let options = query.apply(state.pipeline.default_options())?;
    Ok(Json(state.pipeline.run_dispatcher(options).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> DispatchOptions {
        DispatchOptions {
            max_jobs: 25,
            time_budget: Duration::from_secs(50),
            concurrency: 3,
        }
    }

    #[test]
    fn overrides_replace_defaults() {
        let query = DispatchQuery {
            max_jobs: Some(5),
            time_budget_ms: Some(2_000),
        };
        let options = query.apply(defaults()).unwrap();
        assert_eq!(options.max_jobs, 5);
        assert_eq!(options.time_budget, Duration::from_secs(2));
        assert_eq!(options.concurrency, 3);
    }

    #[test]
    fn out_of_range_max_jobs_is_rejected() {
        let query = DispatchQuery {
            max_jobs: Some(0),
            time_budget_ms: None,
        };
        assert!(query.apply(defaults()).is_err());
    }
}
