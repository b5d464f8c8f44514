//! Operator actions: retry or skip a single batch, skip a single job.
//!
//! Each action touches only the rows of its own batch, so sibling batches keep running.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseTransaction, DbErr, EntityTrait, QueryFilter, TransactionTrait, Value,
};
use tracing::info;
use uuid::Uuid;

use super::{JobQueue, skip_downstream};
use crate::db::to_db_time;
use crate::error::PipelineError;
use crate::models::{
    AttemptStatus, Batch, BatchStatus, Job, JobAttempt, JobStatus, JobType, NotificationLog,
    NotificationType, batch, job, job_attempt, notification_log,
};

impl JobQueue {
    /// Resets a batch and its three jobs so the chain runs again from ANALYZE.
    ///
    /// Terminal finalization jobs of the upload are removed, together with the completion
    /// notice log entry, so a fresh workbook is produced and mailed once the batch settles
    /// again.
    pub async fn retry_batch(
        &self,
        upload_id: Uuid,
        batch_id: Uuid,
    ) -> Result<batch::Model, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let batch = find_batch(&txn, upload_id, batch_id).await?;
        if batch.raw_rows.is_none() {
            return Err(PipelineError::PayloadScrubbed { batch_id });
        }

        let jobs = Job::find()
            .filter(job::Column::BatchId.eq(batch_id))
            .all(&txn)
            .await?;
        if jobs.iter().any(|job| job.status == JobStatus::InProgress) {
            return Err(PipelineError::InvalidState(format!(
                "batch {batch_id} has a job in progress"
            )));
        }

        let finalization = Job::find()
            .filter(job::Column::UploadId.eq(upload_id))
            .filter(job::Column::BatchId.is_null())
            .all(&txn)
            .await?;
        if finalization
            .iter()
            .any(|job| job.status == JobStatus::InProgress)
        {
            return Err(PipelineError::InvalidState(format!(
                "upload {upload_id} is being finalized"
            )));
        }

        let job_ids: Vec<Uuid> = jobs
            .iter()
            .chain(finalization.iter())
            .map(|job| job.id)
            .collect();
        if !job_ids.is_empty() {
            JobAttempt::delete_many()
                .filter(job_attempt::Column::JobId.is_in(job_ids))
                .exec(&txn)
                .await?;
        }
        if !finalization.is_empty() {
            Job::delete_many()
                .filter(job::Column::Id.is_in(finalization.iter().map(|job| job.id)))
                .exec(&txn)
                .await?;
            NotificationLog::delete_many()
                .filter(notification_log::Column::UploadId.eq(upload_id))
                .filter(notification_log::Column::NotificationType.eq(NotificationType::Completed))
                .exec(&txn)
                .await?;
        }

        for job in &jobs {
            let status = if job.job_type == JobType::Analyze {
                JobStatus::Ready
            } else {
                JobStatus::Pending
            };
            Job::update_many()
                .col_expr(job::Column::Status, Expr::value(status))
                .col_expr(job::Column::RetryCount, Expr::value(0))
                .col_expr(job::Column::NextRunAt, Expr::value(to_db_time(now)))
                .col_expr(job::Column::LastError, Expr::value(Option::<String>::None))
                .col_expr(job::Column::StartedAt, Expr::value(null_time()))
                .col_expr(job::Column::CompletedAt, Expr::value(null_time()))
                .col_expr(job::Column::UpdatedAt, Expr::value(to_db_time(now)))
                .filter(job::Column::Id.eq(job.id))
                .exec(&txn)
                .await?;
        }

        Batch::update_many()
            .col_expr(batch::Column::Status, Expr::value(BatchStatus::Queued))
            .col_expr(batch::Column::ErrorReason, Expr::value(Option::<String>::None))
            .col_expr(batch::Column::Analysis, Expr::value(Value::Json(None)))
            .col_expr(batch::Column::Structured, Expr::value(Value::Json(None)))
            .col_expr(batch::Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(batch::Column::Id.eq(batch_id))
            .exec(&txn)
            .await?;

        let batch = find_batch(&txn, upload_id, batch_id).await?;
        txn.commit().await?;

        info!(
            upload_id = %upload_id,
            batch_id = %batch_id,
            removed_finalization_jobs = finalization.len(),
            "Batch queued for retry"
        );
        self.after_change(upload_id).await;
        Ok(batch)
    }

    /// Marks a batch FAILED with `reason` and skips its unfinished jobs.
    pub async fn skip_batch(
        &self,
        upload_id: Uuid,
        batch_id: Uuid,
        reason: &str,
    ) -> Result<batch::Model, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let batch = find_batch(&txn, upload_id, batch_id).await?;
        if batch.status == BatchStatus::Completed {
            return Err(PipelineError::InvalidState(format!(
                "batch {batch_id} already completed"
            )));
        }

        let job_ids: Vec<Uuid> = Job::find()
            .filter(job::Column::BatchId.eq(batch_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        skip_jobs(&txn, job_ids, reason, now).await?;
        fail_batch(&txn, batch_id, reason, now).await?;

        let batch = find_batch(&txn, upload_id, batch_id).await?;
        txn.commit().await?;

        info!(upload_id = %upload_id, batch_id = %batch_id, reason, "Batch skipped by operator");
        self.after_change(upload_id).await;
        Ok(batch)
    }

    /// Moves a non-terminal job to SKIPPED. A skipped batch job fails its batch.
    pub async fn skip_job(&self, job_id: Uuid, reason: &str) -> Result<job::Model, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let job = Job::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;
        if job.status.is_terminal() {
            return Err(PipelineError::InvalidState(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }

        skip_jobs(&txn, vec![job_id], reason, now).await?;
        skip_downstream(&txn, &job, now).await?;
        if let Some(batch_id) = job.batch_id {
            fail_batch(&txn, batch_id, reason, now).await?;
        }

        let job = Job::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;
        txn.commit().await?;

        info!(job_id = %job_id, job_type = %job.job_type, reason, "Job skipped by operator");
        self.after_change(job.upload_id).await;
        Ok(job)
    }
}

async fn find_batch(
    txn: &DatabaseTransaction,
    upload_id: Uuid,
    batch_id: Uuid,
) -> Result<batch::Model, PipelineError> {
    Batch::find_by_id(batch_id)
        .filter(batch::Column::UploadId.eq(upload_id))
        .one(txn)
        .await?
        .ok_or_else(|| PipelineError::not_found("batch", batch_id))
}

/// Skips the non-terminal jobs among `job_ids` and closes their open attempts.
async fn skip_jobs(
    txn: &DatabaseTransaction,
    job_ids: Vec<Uuid>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    if job_ids.is_empty() {
        return Ok(());
    }
    let now = to_db_time(now);
    let message = format!("skipped by operator: {reason}");

    JobAttempt::update_many()
        .col_expr(job_attempt::Column::Status, Expr::value(AttemptStatus::Failed))
        .col_expr(job_attempt::Column::CompletedAt, Expr::value(Some(now)))
        .col_expr(
            job_attempt::Column::ErrorCode,
            Expr::value(Some("skipped".to_string())),
        )
        .col_expr(
            job_attempt::Column::ErrorMessage,
            Expr::value(Some(message.clone())),
        )
        .filter(job_attempt::Column::JobId.is_in(job_ids.clone()))
        .filter(job_attempt::Column::Status.eq(AttemptStatus::InProgress))
        .exec(txn)
        .await?;

    Job::update_many()
        .col_expr(job::Column::Status, Expr::value(JobStatus::Skipped))
        .col_expr(job::Column::LastError, Expr::value(Some(message)))
        .col_expr(job::Column::CompletedAt, Expr::value(Some(now)))
        .col_expr(job::Column::UpdatedAt, Expr::value(now))
        .filter(job::Column::Id.is_in(job_ids))
        .filter(job::Column::Status.is_in([
            JobStatus::Pending,
            JobStatus::Ready,
            JobStatus::InProgress,
        ]))
        .exec(txn)
        .await?;
    Ok(())
}

async fn fail_batch(
    txn: &DatabaseTransaction,
    batch_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    Batch::update_many()
        .col_expr(batch::Column::Status, Expr::value(BatchStatus::Failed))
        .col_expr(
            batch::Column::ErrorReason,
            Expr::value(Some(reason.to_string())),
        )
        .col_expr(batch::Column::UpdatedAt, Expr::value(to_db_time(now)))
        .filter(batch::Column::Id.eq(batch_id))
        .exec(txn)
        .await?;
    Ok(())
}

fn null_time() -> Option<sea_orm::prelude::DateTimeWithTimeZone> {
    None
}
