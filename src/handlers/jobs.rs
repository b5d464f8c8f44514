//! # Job API Handlers

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::uploads::{SkipRequest, required_reason};
use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::models::{JobStatus, JobType, job};
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl From<job::Model> for JobInfo {
    fn from(model: job::Model) -> Self {
        Self {
            id: model.id,
            upload_id: model.upload_id,
            batch_id: model.batch_id,
            job_type: model.job_type,
            status: model.status,
            retry_count: model.retry_count,
            last_error: model.last_error,
        }
    }
}

/// Skips a job that has not finished
#[utoipa::path(
    post,
    path = "/jobs/{job_id}/skip",
    security(("bearer_auth" = [])),
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    request_body = SkipRequest,
    responses(
        (status = 200, description = "Job skipped", body = JobInfo),
        (status = 400, description = "Missing reason", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job already finished or running", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn skip_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(job_id): Path<Uuid>,
    payload: Result<Json<SkipRequest>, JsonRejection>,
) -> Result<Json<JobInfo>, ApiError> {
    let Json(request) = payload?;
    let reason = required_reason(&request.reason)?;
    let job = state.pipeline.skip_job(job_id, reason).await?;
    Ok(Json(job.into()))
}
