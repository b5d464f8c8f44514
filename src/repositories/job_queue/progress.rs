//! Read-only progress tree for the operator view.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::JobQueue;
use crate::error::PipelineError;
use crate::models::{
    AttemptStatus, Batch, BatchStatus, Job, JobAttempt, JobStatus, JobType, Upload, UploadStatus,
    batch, job, job_attempt,
};
use crate::payload::UploadSummary;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobProgress {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub attempts: u32,
    /// Attempts that ran on a fallback model
    pub fallback_attempts: u32,
    pub last_model: Option<String>,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchProgress {
    pub id: Uuid,
    pub group_key: String,
    pub municipality: String,
    pub state: String,
    pub position: String,
    pub row_count: i32,
    pub status: BatchStatus,
    pub error_reason: Option<String>,
    /// False once the payload was scrubbed; such a batch cannot be retried
    pub retryable: bool,
    pub jobs: Vec<JobProgress>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadProgress {
    pub id: Uuid,
    pub uploader_email: String,
    pub original_filename: String,
    pub status: UploadStatus,
    pub force_hidden: bool,
    pub summary: UploadSummary,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub batches: Vec<BatchProgress>,
    /// WORKBOOK and NOTIFICATION jobs, once enqueued
    pub finalization_jobs: Vec<JobProgress>,
}

impl JobQueue {
    /// Upload with its batches, their jobs and attempt statistics.
    pub async fn get_upload_progress(
        &self,
        upload_id: Uuid,
    ) -> Result<UploadProgress, PipelineError> {
        let upload = Upload::find_by_id(upload_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| PipelineError::not_found("upload", upload_id))?;
        let batches = Batch::find()
            .filter(batch::Column::UploadId.eq(upload_id))
            .order_by_asc(batch::Column::State)
            .order_by_asc(batch::Column::Municipality)
            .order_by_asc(batch::Column::Position)
            .all(&self.db)
            .await?;
        let jobs = Job::find()
            .filter(job::Column::UploadId.eq(upload_id))
            .order_by_asc(job::Column::Priority)
            .all(&self.db)
            .await?;
        let job_ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
        let attempts = if job_ids.is_empty() {
            Vec::new()
        } else {
            JobAttempt::find()
                .filter(job_attempt::Column::JobId.is_in(job_ids))
                .order_by_asc(job_attempt::Column::StartedAt)
                .all(&self.db)
                .await?
        };

        let mut by_job: HashMap<Uuid, Vec<&job_attempt::Model>> = HashMap::new();
        for attempt in &attempts {
            by_job.entry(attempt.job_id).or_default().push(attempt);
        }

        let mut batch_jobs: HashMap<Uuid, Vec<JobProgress>> = HashMap::new();
        let mut finalization_jobs = Vec::new();
        for job in &jobs {
            let progress = job_progress(job, by_job.get(&job.id).map(Vec::as_slice).unwrap_or(&[]));
            match job.batch_id {
                Some(batch_id) => batch_jobs.entry(batch_id).or_default().push(progress),
                None => finalization_jobs.push(progress),
            }
        }

        let batches = batches
            .into_iter()
            .map(|batch| BatchProgress {
                id: batch.id,
                retryable: batch.raw_rows.is_some(),
                jobs: batch_jobs.remove(&batch.id).unwrap_or_default(),
                group_key: batch.group_key,
                municipality: batch.municipality,
                state: batch.state,
                position: batch.position,
                row_count: batch.row_count,
                status: batch.status,
                error_reason: batch.error_reason,
            })
            .collect();

        Ok(UploadProgress {
            id: upload.id,
            summary: UploadSummary::from_json(&upload.summary),
            uploader_email: upload.uploader_email,
            original_filename: upload.original_filename,
            status: upload.status,
            force_hidden: upload.force_hidden,
            created_at: upload.created_at.to_utc(),
            completed_at: upload.completed_at.map(|at| at.to_utc()),
            batches,
            finalization_jobs,
        })
    }
}

fn job_progress(job: &job::Model, attempts: &[&job_attempt::Model]) -> JobProgress {
    JobProgress {
        id: job.id,
        job_type: job.job_type,
        status: job.status,
        retry_count: job.retry_count,
        max_retries: job.max_retries,
        next_run_at: job.next_run_at.to_utc(),
        last_error: job.last_error.clone(),
        attempts: u32::try_from(attempts.len()).unwrap_or(u32::MAX),
        fallback_attempts: u32::try_from(
            attempts.iter().filter(|attempt| attempt.is_fallback).count(),
        )
        .unwrap_or(u32::MAX),
        last_model: attempts.last().map(|attempt| attempt.model.clone()),
        in_flight: attempts
            .iter()
            .any(|attempt| attempt.status == AttemptStatus::InProgress),
    }
}
