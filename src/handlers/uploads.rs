//! # Upload API Handlers
//!
//! Upload intake, progress and the per-batch operator actions.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::error::{ApiError, validation_error};
use crate::models::{BatchStatus, UploadStatus, batch};
use crate::payload::RawRow;
use crate::repositories::{CreatedUpload, UploadProgress};
use crate::server::AppState;

/// Parsed spreadsheet handed over by the upload form
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUploadRequest {
    #[schema(example = "clerk@example.gov")]
    pub uploader_email: String,
    #[schema(example = "springfield-2026.xlsx")]
    pub filename: String,
    /// Hide inserted candidates from public listings
    #[serde(default)]
    pub force_hidden: bool,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BatchSummary {
    pub id: Uuid,
    #[schema(example = "springfield|il|mayor")]
    pub group_key: String,
    pub row_count: i32,
    pub status: BatchStatus,
    pub error_reason: Option<String>,
}

impl From<batch::Model> for BatchSummary {
    fn from(model: batch::Model) -> Self {
        Self {
            id: model.id,
            group_key: model.group_key,
            row_count: model.row_count,
            status: model.status,
            error_reason: model.error_reason,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateUploadResponse {
    pub upload_id: Uuid,
    pub status: UploadStatus,
    pub job_count: usize,
    pub batches: Vec<BatchSummary>,
}

impl From<CreatedUpload> for CreateUploadResponse {
    fn from(created: CreatedUpload) -> Self {
        Self {
            upload_id: created.upload.id,
            status: created.upload.status,
            job_count: created.jobs.len(),
            batches: created.batches.into_iter().map(BatchSummary::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SkipRequest {
    #[schema(example = "duplicate of an earlier upload")]
    pub reason: String,
}

/// Accepts parsed spreadsheet rows and enqueues their processing
#[utoipa::path(
    post,
    path = "/uploads",
    security(("bearer_auth" = [])),
    request_body = CreateUploadRequest,
    responses(
        (status = 201, description = "Upload accepted", body = CreateUploadResponse),
        (status = 400, description = "Invalid request body", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "uploads"
)]
pub async fn create_upload(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    payload: Result<Json<CreateUploadRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateUploadResponse>), ApiError> {
    let Json(request) = payload?;
    if !request.uploader_email.contains('@') {
        return Err(validation_error(
            "Invalid uploader email",
            serde_json::json!({ "uploader_email": "Must be an email address" }),
        ));
    }

    let created = state
        .pipeline
        .create_spreadsheet_upload(
            request.rows,
            &request.uploader_email,
            &request.filename,
            request.force_hidden,
        )
        .await?;
    tracing::info!(
        upload_id = %created.upload.id,
        batches = created.batches.len(),
        "Upload accepted"
    );
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// Upload with its batches, jobs and attempt statistics
#[utoipa::path(
    get,
    path = "/uploads/{upload_id}",
    security(("bearer_auth" = [])),
    params(("upload_id" = Uuid, Path, description = "Upload identifier")),
    responses(
        (status = 200, description = "Upload progress", body = UploadProgress),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Upload not found", body = ApiError)
    ),
    tag = "uploads"
)]
pub async fn get_upload(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<UploadProgress>, ApiError> {
    Ok(Json(state.pipeline.get_upload_progress(upload_id).await?))
}

/// Re-runs a batch from ANALYZE
#[utoipa::path(
    post,
    path = "/uploads/{upload_id}/batches/{batch_id}/retry",
    security(("bearer_auth" = [])),
    params(
        ("upload_id" = Uuid, Path, description = "Upload identifier"),
        ("batch_id" = Uuid, Path, description = "Batch identifier")
    ),
    responses(
        (status = 200, description = "Batch reset", body = BatchSummary),
        (status = 404, description = "Batch not found", body = ApiError),
        (status = 409, description = "Batch cannot be retried", body = ApiError)
    ),
    tag = "uploads"
)]
pub async fn retry_batch(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path((upload_id, batch_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BatchSummary>, ApiError> {
    let batch = state.pipeline.retry_batch(upload_id, batch_id).await?;
    Ok(Json(batch.into()))
}

/// Gives up on a batch
#[utoipa::path(
    post,
    path = "/uploads/{upload_id}/batches/{batch_id}/skip",
    security(("bearer_auth" = [])),
    params(
        ("upload_id" = Uuid, Path, description = "Upload identifier"),
        ("batch_id" = Uuid, Path, description = "Batch identifier")
    ),
    request_body = SkipRequest,
    responses(
        (status = 200, description = "Batch marked FAILED", body = BatchSummary),
        (status = 400, description = "Missing reason", body = ApiError),
        (status = 404, description = "Batch not found", body = ApiError),
        (status = 409, description = "Batch already completed", body = ApiError)
    ),
    tag = "uploads"
)]
pub async fn skip_batch(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path((upload_id, batch_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<SkipRequest>, JsonRejection>,
) -> Result<Json<BatchSummary>, ApiError> {
    let Json(request) = payload?;
    let reason = required_reason(&request.reason)?;
    let batch = state
        .pipeline
        .skip_batch(upload_id, batch_id, reason)
        .await?;
    Ok(Json(batch.into()))
}

pub(crate) fn required_reason(reason: &str) -> Result<&str, ApiError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(validation_error(
            "Missing reason",
            serde_json::json!({ "reason": "Required" }),
        ));
    }
    Ok(reason)
}
