//! # Job Queue
//!
//! Durable state machine for pipeline jobs:
//!
//! ```text
//! PENDING -> READY -> IN_PROGRESS -> SUCCEEDED
//!                ^         |
//!                +---------+-> FAILED
//! ```
//!
//! Every transition that matters for correctness is a conditional update inside a
//! transaction: claiming requires `status = READY`, finishing requires the job and its
//! attempt to still be `IN_PROGRESS`. Two workers racing on the same row therefore
//! never both win. Summary refresh, notices and finalization run after the commit.

mod operator;
mod progress;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::{Rng, thread_rng};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, TransactionTrait, Value,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, RetryPolicyConfig};
use crate::db::to_db_time;
use crate::error::{JobError, PipelineError, is_unique_violation, truncate_message};
use crate::grouping::group_rows;
use crate::json_repair::parse_ai_json;
use crate::models::{
    AttemptStatus, Batch, BatchStatus, Job, JobAttempt, JobStatus, JobType, NotificationType,
    Upload, UploadStatus, batch, job, job_attempt, upload,
};
use crate::notifications::{Notice, Notifier};
use crate::payload::{
    AnalysisResult, BatchCounts, JobOutput, RawRow, StructuredResult, UploadSummary,
};
use crate::repositories::summary::refresh_upload_summary;

pub use progress::{BatchProgress, JobProgress, UploadProgress};

/// Longest error text stored on job and attempt rows.
const MAX_ERROR_CHARS: usize = 2_000;

/// Ordered model names for one AI stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageModels {
    pub preferred: Vec<String>,
    pub fallback: Vec<String>,
}

/// Values stamped onto newly created jobs and used for retry scheduling.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub analyze: StageModels,
    pub structure: StageModels,
    pub max_output_tokens: i32,
    pub retry: RetryPolicyConfig,
}

impl QueueSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            analyze: StageModels {
                preferred: config.ai.analyze_models.clone(),
                fallback: config.ai.analyze_fallback_models.clone(),
            },
            structure: StageModels {
                preferred: config.ai.structure_models.clone(),
                fallback: config.ai.structure_fallback_models.clone(),
            },
            max_output_tokens: i32::try_from(config.ai.max_output_tokens).unwrap_or(i32::MAX),
            retry: config.retry.clone(),
        }
    }

    fn models_for(&self, job_type: JobType) -> Option<&StageModels> {
        match job_type {
            JobType::Analyze => Some(&self.analyze),
            JobType::Structure => Some(&self.structure),
            _ => None,
        }
    }

    fn max_retries_for(&self, job_type: JobType) -> i32 {
        let retries = if job_type.uses_ai() {
            self.retry.max_retries
        } else {
            self.retry.max_retries_local
        };
        i32::try_from(retries).unwrap_or(i32::MAX)
    }
}

/// Later stages run first so work in flight drains before new work starts.
pub fn priority_for(job_type: JobType) -> i32 {
    match job_type {
        JobType::Analyze => 10,
        JobType::Structure => 20,
        JobType::Insert => 30,
        JobType::Workbook => 40,
        JobType::Notification => 50,
    }
}

/// Exponential backoff after the `retry_count`-th failure, never shorter than an
/// explicit upstream hint, plus proportional jitter.
pub fn backoff_delay(
    policy: &RetryPolicyConfig,
    retry_count: i32,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = retry_count.saturating_sub(1).clamp(0, 30);
    let mut backoff =
        (policy.base_seconds as f64 * 2_f64.powi(exponent)).min(policy.max_seconds as f64);

    if let Some(hint) = retry_after {
        backoff = backoff.max(hint.as_secs_f64());
    }

    let jitter = if policy.jitter_factor > 0.0 && backoff > 0.0 {
        thread_rng().gen_range(0.0..(policy.jitter_factor * backoff))
    } else {
        0.0
    };

    Duration::from_secs_f64(backoff + jitter)
}

/// Input to [`JobQueue::create_upload_with_batches`].
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub rows: Vec<RawRow>,
    pub uploader_email: String,
    pub original_filename: String,
    pub force_hidden: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub upload: upload::Model,
    pub batches: Vec<batch::Model>,
    pub jobs: Vec<job::Model>,
}

/// A job that now belongs to the caller, with the attempt it must finish.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: job::Model,
    pub attempt: job_attempt::Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to READY, eligible again at `next_run_at`
    Retrying { next_run_at: DateTime<Utc> },
    /// Terminal; the batch (if any) was flagged for re-upload
    Failed,
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub job: job::Model,
    pub outcome: FailureOutcome,
}

/// Queue operations over the pipeline tables.
#[derive(Clone)]
pub struct JobQueue {
    db: DatabaseConnection,
    settings: Arc<QueueSettings>,
    notifier: Notifier,
}

impl JobQueue {
    pub fn new(db: DatabaseConnection, settings: QueueSettings, notifier: Notifier) -> Self {
        Self {
            db,
            settings: Arc::new(settings),
            notifier,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Groups rows and creates the upload, its batches and their job chains atomically.
    pub async fn create_upload_with_batches(
        &self,
        new_upload: NewUpload,
    ) -> Result<CreatedUpload, PipelineError> {
        if new_upload.rows.is_empty() {
            return Err(PipelineError::Validation("upload has no rows".to_string()));
        }
        if new_upload.uploader_email.trim().is_empty() {
            return Err(PipelineError::Validation(
                "uploader email is required".to_string(),
            ));
        }

        let now = Utc::now();
        let groups = group_rows(&new_upload.rows);
        let summary = UploadSummary {
            total_rows: u32::try_from(new_upload.rows.len()).unwrap_or(u32::MAX),
            total_batches: u32::try_from(groups.len()).unwrap_or(u32::MAX),
            batch_counts: BatchCounts {
                queued: u32::try_from(groups.len()).unwrap_or(u32::MAX),
                ..BatchCounts::default()
            },
            ..UploadSummary::default()
        };

        let txn = self.db.begin().await?;
        let upload_id = Uuid::new_v4();
        let upload = upload::ActiveModel {
            id: Set(upload_id),
            uploader_email: Set(new_upload.uploader_email.trim().to_string()),
            original_filename: Set(new_upload.original_filename.clone()),
            status: Set(UploadStatus::Processing),
            summary: Set(serde_json::to_value(&summary)?),
            raw_rows: Set(Some(serde_json::to_value(&new_upload.rows)?)),
            force_hidden: Set(new_upload.force_hidden),
            completed_at: Set(None),
            created_at: Set(to_db_time(now)),
            updated_at: Set(to_db_time(now)),
        }
        .insert(&txn)
        .await?;

        let mut batches = Vec::with_capacity(groups.len());
        let mut jobs = Vec::with_capacity(groups.len() * 3);
        for group in groups {
            let analyze_id = Uuid::new_v4();
            let structure_id = Uuid::new_v4();
            let insert_id = Uuid::new_v4();
            let batch_id = Uuid::new_v4();

            let batch = batch::ActiveModel {
                id: Set(batch_id),
                upload_id: Set(upload_id),
                group_key: Set(group.group_key.clone()),
                municipality: Set(group.municipality.clone()),
                state: Set(group.state.clone()),
                position: Set(group.position.clone()),
                row_count: Set(i32::try_from(group.rows.len()).unwrap_or(i32::MAX)),
                raw_rows: Set(Some(serde_json::to_value(&group.rows)?)),
                analysis: Set(None),
                structured: Set(None),
                status: Set(BatchStatus::Queued),
                error_reason: Set(None),
                analyze_job_id: Set(Some(analyze_id)),
                structure_job_id: Set(Some(structure_id)),
                insert_job_id: Set(Some(insert_id)),
                estimated_analyze_tokens: Set(group.estimated_analyze_tokens),
                estimated_structure_tokens: Set(group.estimated_structure_tokens),
                created_at: Set(to_db_time(now)),
                updated_at: Set(to_db_time(now)),
            }
            .insert(&txn)
            .await?;

            let chain = [
                (
                    analyze_id,
                    JobType::Analyze,
                    None,
                    group.estimated_analyze_tokens,
                ),
                (
                    structure_id,
                    JobType::Structure,
                    Some(analyze_id),
                    group.estimated_structure_tokens,
                ),
                (insert_id, JobType::Insert, Some(structure_id), 0),
            ];
            for (id, job_type, dependency, request_tokens) in chain {
                let model = self
                    .new_job(NewJob {
                        id,
                        upload_id,
                        batch_id: Some(batch_id),
                        job_type,
                        dependency,
                        request_tokens,
                        now,
                    })
                    .insert(&txn)
                    .await?;
                jobs.push(model);
            }
            batches.push(batch);
        }

        txn.commit().await?;

        info!(
            upload_id = %upload_id,
            rows = new_upload.rows.len(),
            batches = batches.len(),
            jobs = jobs.len(),
            "Upload queued"
        );
        self.notifier
            .notify(Notice::new(NotificationType::UploadQueued, upload.clone()))
            .await;

        Ok(CreatedUpload {
            upload,
            batches,
            jobs,
        })
    }

    /// READY jobs due at `now`, highest priority first, then oldest.
    pub async fn list_dispatchable(
        &self,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<job::Model>, PipelineError> {
        let jobs = Job::find()
            .filter(job::Column::Status.eq(JobStatus::Ready))
            .filter(job::Column::NextRunAt.lte(to_db_time(now)))
            .order_by_desc(job::Column::Priority)
            .order_by_asc(job::Column::NextRunAt)
            .order_by_asc(job::Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(jobs)
    }

    pub async fn find_job(&self, job_id: Uuid) -> Result<job::Model, PipelineError> {
        Job::find_by_id(job_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))
    }

    /// Moves a READY job to IN_PROGRESS and opens an attempt against `model`.
    pub async fn claim(
        &self,
        job_id: Uuid,
        model: &str,
        is_fallback: bool,
        window_start: Option<DateTime<Utc>>,
    ) -> Result<ClaimedJob, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let claimed = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::InProgress))
            .col_expr(job::Column::StartedAt, Expr::value(Some(to_db_time(now))))
            .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.eq(JobStatus::Ready))
            .exec(&txn)
            .await?;

        if claimed.rows_affected == 0 {
            txn.rollback().await?;
            let job = self.find_job(job_id).await?;
            return Err(PipelineError::JobNotReady {
                job_id,
                status: job.status,
            });
        }

        let job = Job::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;

        let attempt = job_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(job_id),
            model: Set(model.to_string()),
            status: Set(AttemptStatus::InProgress),
            is_fallback: Set(is_fallback),
            rate_window_start: Set(window_start.map(to_db_time)),
            started_at: Set(to_db_time(now)),
            completed_at: Set(None),
            request_tokens: Set(None),
            response_tokens: Set(None),
            total_tokens: Set(None),
            response_payload: Set(None),
            error_code: Set(None),
            error_message: Set(None),
            created_at: Set(to_db_time(now)),
        }
        .insert(&txn)
        .await?;

        if let (Some(batch_id), Some(display)) = (job.batch_id, display_status(job.job_type)) {
            Batch::update_many()
                .col_expr(batch::Column::Status, Expr::value(display))
                .col_expr(batch::Column::UpdatedAt, Expr::value(to_db_time(now)))
                .filter(batch::Column::Id.eq(batch_id))
                .filter(batch::Column::Status.is_in(BatchStatus::ACTIVE))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        debug!(
            job_id = %job_id,
            job_type = %job.job_type,
            attempt_id = %attempt.id,
            model,
            is_fallback,
            "Job claimed"
        );
        Ok(ClaimedJob { job, attempt })
    }

    /// Finalizes a successful attempt, stores the stage output and unlocks dependents.
    pub async fn record_success(
        &self,
        job_id: Uuid,
        attempt_id: Uuid,
        output: &JobOutput,
    ) -> Result<job::Model, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let usage = output.usage().unwrap_or_default();
        let finished = JobAttempt::update_many()
            .col_expr(
                job_attempt::Column::Status,
                Expr::value(AttemptStatus::Succeeded),
            )
            .col_expr(
                job_attempt::Column::CompletedAt,
                Expr::value(Some(to_db_time(now))),
            )
            .col_expr(
                job_attempt::Column::RequestTokens,
                Expr::value(Some(clamp_tokens(usage.prompt_tokens))),
            )
            .col_expr(
                job_attempt::Column::ResponseTokens,
                Expr::value(Some(clamp_tokens(usage.candidate_tokens))),
            )
            .col_expr(
                job_attempt::Column::TotalTokens,
                Expr::value(Some(clamp_tokens(usage.total_tokens))),
            )
            .col_expr(
                job_attempt::Column::ResponsePayload,
                Expr::value(Some(serde_json::to_value(output)?)),
            )
            .filter(job_attempt::Column::Id.eq(attempt_id))
            .filter(job_attempt::Column::JobId.eq(job_id))
            .filter(job_attempt::Column::Status.eq(AttemptStatus::InProgress))
            .exec(&txn)
            .await?;
        if finished.rows_affected == 0 {
            txn.rollback().await?;
            return Err(PipelineError::StaleAttempt { job_id, attempt_id });
        }

        let succeeded = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Succeeded))
            .col_expr(job::Column::CompletedAt, Expr::value(Some(to_db_time(now))))
            .col_expr(job::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.eq(JobStatus::InProgress))
            .exec(&txn)
            .await?;
        if succeeded.rows_affected == 0 {
            txn.rollback().await?;
            return Err(PipelineError::StaleAttempt { job_id, attempt_id });
        }

        let job = Job::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;

        self.store_output(&txn, &job, output, now).await?;
        let unlocked = unlock_dependent_jobs(&txn, job_id, now).await?;

        txn.commit().await?;

        info!(
            job_id = %job_id,
            job_type = %job.job_type,
            attempt_id = %attempt_id,
            unlocked,
            "Job succeeded"
        );
        self.after_change(job.upload_id).await;
        Ok(job)
    }

    async fn store_output(
        &self,
        txn: &DatabaseTransaction,
        job: &job::Model,
        output: &JobOutput,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        match output {
            JobOutput::Analyze(generation) => {
                let batch_id = require_batch(job)?;
                let parsed = parse_ai_json(&generation.text);
                if parsed.as_json().is_none() {
                    warn!(job_id = %job.id, batch_id = %batch_id, "Analysis output is not JSON; stored as opaque text");
                }
                let analysis = AnalysisResult {
                    model: generation.model.clone(),
                    output: parsed,
                    usage: generation.usage,
                };
                Batch::update_many()
                    .col_expr(
                        batch::Column::Analysis,
                        Expr::value(Some(serde_json::to_value(&analysis)?)),
                    )
                    .col_expr(batch::Column::UpdatedAt, Expr::value(to_db_time(now)))
                    .filter(batch::Column::Id.eq(batch_id))
                    .exec(txn)
                    .await?;
            }
            JobOutput::Structure(generation) => {
                let batch_id = require_batch(job)?;
                let parsed = parse_ai_json(&generation.text);
                if parsed.as_json().is_none() {
                    warn!(job_id = %job.id, batch_id = %batch_id, "Structured output is not JSON; stored as opaque text");
                }
                let structured = StructuredResult {
                    model: generation.model.clone(),
                    output: parsed,
                    usage: generation.usage,
                };
                Batch::update_many()
                    .col_expr(
                        batch::Column::Structured,
                        Expr::value(Some(serde_json::to_value(&structured)?)),
                    )
                    .col_expr(batch::Column::UpdatedAt, Expr::value(to_db_time(now)))
                    .filter(batch::Column::Id.eq(batch_id))
                    .exec(txn)
                    .await?;
            }
            JobOutput::Insert(insert_summary) => {
                let batch_id = require_batch(job)?;
                Batch::update_many()
                    .col_expr(batch::Column::Status, Expr::value(BatchStatus::Completed))
                    .col_expr(
                        batch::Column::ErrorReason,
                        Expr::value(Option::<String>::None),
                    )
                    .col_expr(batch::Column::UpdatedAt, Expr::value(to_db_time(now)))
                    .filter(batch::Column::Id.eq(batch_id))
                    .exec(txn)
                    .await?;

                let upload = lock_upload(txn, job.upload_id, now).await?;
                let mut summary = UploadSummary::from_json(&upload.summary);
                summary.record_insert(batch_id, insert_summary.clone());
                let mut active: upload::ActiveModel = upload.into();
                active.summary = Set(serde_json::to_value(&summary)?);
                active.update(txn).await?;
            }
            JobOutput::Workbook(_) => {}
            JobOutput::Notification(_) => {
                // Rows stay available for a workbook re-run while any batch can still be retried.
                Upload::update_many()
                    .col_expr(upload::Column::RawRows, Expr::value(Value::Json(None)))
                    .col_expr(upload::Column::UpdatedAt, Expr::value(to_db_time(now)))
                    .filter(upload::Column::Id.eq(job.upload_id))
                    .filter(upload::Column::Status.eq(UploadStatus::Completed))
                    .exec(txn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Finalizes a failed attempt and either schedules a retry or fails the job.
    pub async fn record_failure(
        &self,
        job_id: Uuid,
        attempt_id: Uuid,
        failure: &JobError,
    ) -> Result<FailureRecord, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let finished = JobAttempt::update_many()
            .col_expr(job_attempt::Column::Status, Expr::value(AttemptStatus::Failed))
            .col_expr(
                job_attempt::Column::CompletedAt,
                Expr::value(Some(to_db_time(now))),
            )
            .col_expr(job_attempt::Column::ErrorCode, Expr::value(Some(failure.code())))
            .col_expr(
                job_attempt::Column::ErrorMessage,
                Expr::value(Some(truncate_message(&failure.to_string(), MAX_ERROR_CHARS))),
            )
            .filter(job_attempt::Column::Id.eq(attempt_id))
            .filter(job_attempt::Column::JobId.eq(job_id))
            .filter(job_attempt::Column::Status.eq(AttemptStatus::InProgress))
            .exec(&txn)
            .await?;
        if finished.rows_affected == 0 {
            txn.rollback().await?;
            return Err(PipelineError::StaleAttempt { job_id, attempt_id });
        }

        let job = Job::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;
        if job.status != JobStatus::InProgress {
            txn.rollback().await?;
            return Err(PipelineError::StaleAttempt { job_id, attempt_id });
        }

        let (record, failed_batch) = self.apply_failure(&txn, job, failure, now).await?;
        txn.commit().await?;

        self.after_failure(&record, failed_batch).await;
        Ok(record)
    }

    /// Shared retry-or-fail transition for an IN_PROGRESS job.
    async fn apply_failure(
        &self,
        txn: &DatabaseTransaction,
        job: job::Model,
        failure: &JobError,
        now: DateTime<Utc>,
    ) -> Result<(FailureRecord, Option<batch::Model>), PipelineError> {
        let retry_count = job.retry_count.saturating_add(1);
        let message = truncate_message(&failure.to_string(), MAX_ERROR_CHARS);

        if failure.is_retryable() && retry_count < job.max_retries {
            let delay = backoff_delay(&self.settings.retry, retry_count, failure.retry_after());
            let next_run_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());

            let updated = Job::update_many()
                .col_expr(job::Column::Status, Expr::value(JobStatus::Ready))
                .col_expr(job::Column::RetryCount, Expr::value(retry_count))
                .col_expr(job::Column::NextRunAt, Expr::value(to_db_time(next_run_at)))
                .col_expr(job::Column::LastError, Expr::value(Some(message)))
                .col_expr(
                    job::Column::StartedAt,
                    Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
                )
                .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(now)))
                .filter(job::Column::Id.eq(job.id))
                .filter(job::Column::Status.eq(JobStatus::InProgress))
                .exec(txn)
                .await?;
            if updated.rows_affected == 0 {
                return Err(PipelineError::InvalidState(format!(
                    "job {} left IN_PROGRESS concurrently",
                    job.id
                )));
            }

            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                retry_count,
                max_retries = job.max_retries,
                next_run_at = %next_run_at,
                error = %failure,
                "Job failed; retry scheduled"
            );
            let job = reload_job(txn, job.id).await?;
            return Ok((
                FailureRecord {
                    job,
                    outcome: FailureOutcome::Retrying { next_run_at },
                },
                None,
            ));
        }

        let updated = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Failed))
            .col_expr(job::Column::RetryCount, Expr::value(retry_count))
            .col_expr(job::Column::LastError, Expr::value(Some(message.clone())))
            .col_expr(job::Column::CompletedAt, Expr::value(Some(to_db_time(now))))
            .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(job::Column::Id.eq(job.id))
            .filter(job::Column::Status.eq(JobStatus::InProgress))
            .exec(txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(PipelineError::InvalidState(format!(
                "job {} left IN_PROGRESS concurrently",
                job.id
            )));
        }

        skip_downstream(txn, &job, now).await?;

        let failed_batch = match job.batch_id {
            Some(batch_id) => {
                Batch::update_many()
                    .col_expr(
                        batch::Column::Status,
                        Expr::value(BatchStatus::NeedsReupload),
                    )
                    .col_expr(batch::Column::ErrorReason, Expr::value(Some(message)))
                    .col_expr(batch::Column::UpdatedAt, Expr::value(to_db_time(now)))
                    .filter(batch::Column::Id.eq(batch_id))
                    .exec(txn)
                    .await?;
                Batch::find_by_id(batch_id).one(txn).await?
            }
            None => None,
        };

        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            retry_count,
            retryable = failure.is_retryable(),
            error = %failure,
            "Job failed permanently"
        );
        let job = reload_job(txn, job.id).await?;
        Ok((
            FailureRecord {
                job,
                outcome: FailureOutcome::Failed,
            },
            failed_batch,
        ))
    }

    async fn after_failure(&self, record: &FailureRecord, failed_batch: Option<batch::Model>) {
        if let Some(batch) = failed_batch {
            match Upload::find_by_id(record.job.upload_id).one(&self.db).await {
                Ok(Some(upload)) => {
                    self.notifier.notify(Notice::batch_failed(upload, batch)).await;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(upload_id = %record.job.upload_id, error = %err, "Failed to load upload for failure notice");
                }
            }
        }
        self.after_change(record.job.upload_id).await;
    }

    /// Pushes a READY job's next run out, e.g. to a rate window reset.
    pub async fn reschedule(
        &self,
        job_id: Uuid,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let result = Job::update_many()
            .col_expr(job::Column::NextRunAt, Expr::value(to_db_time(next_run_at)))
            .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.eq(JobStatus::Ready))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn reset_stale_jobs(&self, max_duration: Duration) -> Result<u32, PipelineError> {
        self.reset_stale_jobs_at(max_duration, Utc::now()).await
    }

    /// Fails IN_PROGRESS jobs started before `now - max_duration` through the normal
    /// retry policy. Returns how many were reclaimed.
    pub async fn reset_stale_jobs_at(
        &self,
        max_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<u32, PipelineError> {
        let timeout = TimeDelta::from_std(max_duration).unwrap_or(TimeDelta::minutes(10));
        let cutoff = now - timeout;
        let stale = Job::find()
            .filter(job::Column::Status.eq(JobStatus::InProgress))
            .filter(job::Column::StartedAt.lt(to_db_time(cutoff)))
            .all(&self.db)
            .await?;

        let mut reclaimed = 0;
        for job in stale {
            let failure = JobError::transient(format!(
                "job exceeded the {}s execution timeout",
                max_duration.as_secs()
            ));
            let txn = self.db.begin().await?;

            JobAttempt::update_many()
                .col_expr(job_attempt::Column::Status, Expr::value(AttemptStatus::Failed))
                .col_expr(
                    job_attempt::Column::CompletedAt,
                    Expr::value(Some(to_db_time(now))),
                )
                .col_expr(
                    job_attempt::Column::ErrorCode,
                    Expr::value(Some("stale_timeout".to_string())),
                )
                .col_expr(
                    job_attempt::Column::ErrorMessage,
                    Expr::value(Some(failure.to_string())),
                )
                .filter(job_attempt::Column::JobId.eq(job.id))
                .filter(job_attempt::Column::Status.eq(AttemptStatus::InProgress))
                .exec(&txn)
                .await?;

            match self.apply_failure(&txn, job.clone(), &failure, now).await {
                Ok((record, failed_batch)) => {
                    txn.commit().await?;
                    warn!(job_id = %job.id, job_type = %job.job_type, "Reclaimed stale job");
                    reclaimed += 1;
                    self.after_failure(&record, failed_batch).await;
                }
                Err(PipelineError::InvalidState(reason)) => {
                    txn.rollback().await?;
                    debug!(job_id = %job.id, reason, "Stale job finished before reclaim");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(reclaimed)
    }

    /// Creates WORKBOOK -> NOTIFICATION once no batch of the upload is active.
    ///
    /// Returns `true` only for the call that created the jobs.
    pub async fn maybe_enqueue_finalization_jobs(
        &self,
        upload_id: Uuid,
    ) -> Result<bool, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let total = Batch::find()
            .filter(batch::Column::UploadId.eq(upload_id))
            .count(&txn)
            .await?;
        let active = Batch::find()
            .filter(batch::Column::UploadId.eq(upload_id))
            .filter(batch::Column::Status.is_in(BatchStatus::ACTIVE))
            .count(&txn)
            .await?;
        if total == 0 || active > 0 {
            txn.rollback().await?;
            return Ok(false);
        }

        let existing = Job::find()
            .filter(job::Column::UploadId.eq(upload_id))
            .filter(job::Column::JobType.eq(JobType::Workbook))
            .count(&txn)
            .await?;
        if existing > 0 {
            txn.rollback().await?;
            return Ok(false);
        }

        let workbook_id = Uuid::new_v4();
        let inserted = async {
            self.new_job(NewJob {
                id: workbook_id,
                upload_id,
                batch_id: None,
                job_type: JobType::Workbook,
                dependency: None,
                request_tokens: 0,
                now,
            })
            .insert(&txn)
            .await?;
            self.new_job(NewJob {
                id: Uuid::new_v4(),
                upload_id,
                batch_id: None,
                job_type: JobType::Notification,
                dependency: Some(workbook_id),
                request_tokens: 0,
                now,
            })
            .insert(&txn)
            .await?;
            Ok::<_, DbErr>(())
        }
        .await;

        match inserted {
            Ok(()) => {
                txn.commit().await?;
                info!(upload_id = %upload_id, workbook_job_id = %workbook_id, "Finalization jobs enqueued");
                Ok(true)
            }
            Err(err) if is_unique_violation(&err) => {
                txn.rollback().await?;
                debug!(upload_id = %upload_id, "Finalization jobs already enqueued");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Summary refresh, stage notices and finalization after a committed change.
    async fn after_change(&self, upload_id: Uuid) {
        match refresh_upload_summary(&self.db, upload_id).await {
            Ok(refresh) => {
                for notice in refresh.notices {
                    self.notifier.notify(notice).await;
                }
            }
            Err(err) => {
                error!(upload_id = %upload_id, error = %err, "Failed to refresh upload summary");
            }
        }
        if let Err(err) = self.maybe_enqueue_finalization_jobs(upload_id).await {
            error!(upload_id = %upload_id, error = %err, "Failed to enqueue finalization jobs");
        }
    }

    fn new_job(&self, new_job: NewJob) -> job::ActiveModel {
        let models = self
            .settings
            .models_for(new_job.job_type)
            .cloned()
            .unwrap_or_default();
        let response_tokens = if new_job.job_type.uses_ai() {
            self.settings.max_output_tokens
        } else {
            0
        };
        let status = if new_job.dependency.is_some() {
            JobStatus::Pending
        } else {
            JobStatus::Ready
        };
        let now = to_db_time(new_job.now);

        job::ActiveModel {
            id: Set(new_job.id),
            upload_id: Set(new_job.upload_id),
            batch_id: Set(new_job.batch_id),
            job_type: Set(new_job.job_type),
            status: Set(status),
            dependency_job_id: Set(new_job.dependency),
            priority: Set(priority_for(new_job.job_type)),
            preferred_models: Set(serde_json::json!(models.preferred)),
            fallback_models: Set(serde_json::json!(models.fallback)),
            estimated_request_tokens: Set(new_job.request_tokens),
            estimated_response_tokens: Set(response_tokens),
            retry_count: Set(0),
            max_retries: Set(self.settings.max_retries_for(new_job.job_type)),
            next_run_at: Set(now),
            last_error: Set(None),
            started_at: Set(None),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }
}

struct NewJob {
    id: Uuid,
    upload_id: Uuid,
    batch_id: Option<Uuid>,
    job_type: JobType,
    dependency: Option<Uuid>,
    request_tokens: i32,
    now: DateTime<Utc>,
}

/// Makes every PENDING job waiting on `job_id` READY now.
pub async fn unlock_dependent_jobs<C: ConnectionTrait>(
    conn: &C,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let result = Job::update_many()
        .col_expr(job::Column::Status, Expr::value(JobStatus::Ready))
        .col_expr(job::Column::NextRunAt, Expr::value(to_db_time(now)))
        .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(now)))
        .filter(job::Column::DependencyJobId.eq(job_id))
        .filter(job::Column::Status.eq(JobStatus::Pending))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Skips jobs that can no longer run because `job` will never succeed.
async fn skip_downstream<C: ConnectionTrait>(
    conn: &C,
    job: &job::Model,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let mut query = Job::update_many()
        .col_expr(job::Column::Status, Expr::value(JobStatus::Skipped))
        .col_expr(job::Column::CompletedAt, Expr::value(Some(to_db_time(now))))
        .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(now)))
        .filter(job::Column::Status.eq(JobStatus::Pending));
    query = match job.batch_id {
        Some(batch_id) => query.filter(job::Column::BatchId.eq(batch_id)),
        None => query.filter(job::Column::DependencyJobId.eq(job.id)),
    };
    Ok(query.exec(conn).await?.rows_affected)
}

async fn lock_upload(
    txn: &DatabaseTransaction,
    upload_id: Uuid,
    now: DateTime<Utc>,
) -> Result<upload::Model, PipelineError> {
    Upload::update_many()
        .col_expr(upload::Column::UpdatedAt, Expr::value(to_db_time(now)))
        .filter(upload::Column::Id.eq(upload_id))
        .exec(txn)
        .await?;
    Upload::find_by_id(upload_id)
        .one(txn)
        .await?
        .ok_or_else(|| PipelineError::not_found("upload", upload_id))
}

async fn reload_job(txn: &DatabaseTransaction, job_id: Uuid) -> Result<job::Model, PipelineError> {
    Job::find_by_id(job_id)
        .one(txn)
        .await?
        .ok_or_else(|| PipelineError::not_found("job", job_id))
}

fn require_batch(job: &job::Model) -> Result<Uuid, PipelineError> {
    job.batch_id.ok_or_else(|| {
        PipelineError::InvalidState(format!("{} job {} has no batch", job.job_type, job.id))
    })
}

/// Batch status shown while a stage job runs.
fn display_status(job_type: JobType) -> Option<BatchStatus> {
    match job_type {
        JobType::Analyze => Some(BatchStatus::Analyzing),
        JobType::Structure => Some(BatchStatus::Structuring),
        JobType::Insert => Some(BatchStatus::Inserting),
        _ => None,
    }
}

fn clamp_tokens(tokens: i64) -> i32 {
    i32::try_from(tokens.max(0)).unwrap_or(i32::MAX)
}
