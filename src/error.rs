//! # Error Handling
//!
//! Unified problem+json responses for the operator API, plus the domain errors
//! raised by the pipeline ([`PipelineError`]) and by job handlers ([`JobError`]).

use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::JobStatus;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Extract current trace ID from the active tracing span (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

/// Detects unique constraint violations across the supported backends.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        sea_orm::DbErr::RecordNotInserted => return true,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::NotFound { entity, id } => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("{entity} {id} not found"),
            ),
            PipelineError::JobNotReady { job_id, status } => Self::new(
                StatusCode::CONFLICT,
                "JOB_NOT_READY",
                &format!("job {job_id} is {status}, expected READY"),
            ),
            PipelineError::StaleAttempt { job_id, attempt_id } => Self::new(
                StatusCode::CONFLICT,
                "STALE_ATTEMPT",
                &format!("attempt {attempt_id} is no longer current for job {job_id}"),
            ),
            PipelineError::InvalidState(message) => {
                Self::new(StatusCode::CONFLICT, "INVALID_STATE", &message)
            }
            PipelineError::PayloadScrubbed { batch_id } => Self::new(
                StatusCode::CONFLICT,
                "PAYLOAD_SCRUBBED",
                &format!("batch {batch_id} no longer holds its rows; re-upload the spreadsheet"),
            ),
            PipelineError::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
            }
            PipelineError::Database(db) => db.into(),
            PipelineError::Serialization(err) => {
                tracing::error!(error = %err, "Payload serialization error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Stored payload could not be processed",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

/// Errors raised by queue, summary and facade operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job {job_id} is not ready (status {status})")]
    JobNotReady { job_id: Uuid, status: JobStatus },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("attempt {attempt_id} is no longer current for job {job_id}")]
    StaleAttempt { job_id: Uuid, attempt_id: Uuid },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("batch {batch_id} payload has been scrubbed")]
    PayloadScrubbed { batch_id: Uuid },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }
}

/// Failure returned by a job handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(flatten)]
    pub kind: JobErrorKind,
    pub message: String,
    /// Explicit delay requested by the upstream service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Upstream rejected the request itself
    ClientError { status: u16 },
    /// Upstream quota exhausted
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Timeouts, server and network errors
    Transient,
    /// Invalid input or missing prerequisite; retrying cannot help
    Permanent,
    /// AI output could not be turned into the expected payload
    OutputParse,
}

/// HTTP statuses that fail a job without retry.
pub const NON_RETRYABLE_STATUSES: [u16; 5] = [400, 401, 403, 404, 422];

impl JobError {
    /// Classifies an upstream HTTP status.
    pub fn from_status<S: Into<String>>(
        status: u16,
        message: S,
        retry_after_secs: Option<u64>,
    ) -> Self {
        let kind = if NON_RETRYABLE_STATUSES.contains(&status) {
            JobErrorKind::ClientError { status }
        } else if status == 429 {
            JobErrorKind::RateLimited { retry_after_secs }
        } else {
            JobErrorKind::Transient
        };
        Self {
            kind,
            message: message.into(),
            retry_after_secs,
        }
    }

    pub fn rate_limited<S: Into<String>>(retry_after_secs: Option<u64>, message: S) -> Self {
        Self {
            kind: JobErrorKind::RateLimited { retry_after_secs },
            message: message.into(),
            retry_after_secs,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: JobErrorKind::Transient,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: JobErrorKind::Permanent,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn output_parse<S: Into<String>>(message: S) -> Self {
        Self {
            kind: JobErrorKind::OutputParse,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            JobErrorKind::RateLimited { .. } | JobErrorKind::Transient
        )
    }

    /// Explicit delay hint, if the upstream supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        let secs = match self.kind {
            JobErrorKind::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(secs),
            _ => self.retry_after_secs,
        };
        secs.map(Duration::from_secs)
    }

    /// Short code stored on the attempt row.
    pub fn code(&self) -> String {
        match &self.kind {
            JobErrorKind::ClientError { status } => format!("client_error_{status}"),
            JobErrorKind::RateLimited { .. } => "rate_limited".to_string(),
            JobErrorKind::Transient => "transient".to_string(),
            JobErrorKind::Permanent => "permanent".to_string(),
            JobErrorKind::OutputParse => "output_parse".to_string(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            JobErrorKind::ClientError { status } => write!(f, "Client error {status}")?,
            JobErrorKind::RateLimited { .. } => write!(f, "Rate limited")?,
            JobErrorKind::Transient => write!(f, "Transient error")?,
            JobErrorKind::Permanent => write!(f, "Permanent error")?,
            JobErrorKind::OutputParse => write!(f, "Output parse error")?,
        }
        if let Some(after) = self.retry_after() {
            write!(f, " (retry after: {}s)", after.as_secs())?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<PipelineError> for JobError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Database(_) | PipelineError::Serialization(_) => {
                JobError::transient(error.to_string())
            }
            _ => JobError::permanent(error.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for JobError {
    fn from(error: sea_orm::DbErr) -> Self {
        JobError::transient(format!("database error: {error}"))
    }
}

/// Truncates text stored in error columns, respecting char boundaries.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() > max_chars {
        let truncated: String = message.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        message.to_string()
    }
}
