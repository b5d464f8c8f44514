//! Upload summary refresh
//!
//! The summary is always rebuilt from batch and job rows, never incremented in place,
//! so refreshes racing each other converge on the same aggregate. The refresh takes
//! the upload row lock before reading, which serializes concurrent refreshes of one
//! upload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, TransactionTrait, Value,
};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::PipelineError;
use crate::models::{
    Batch, BatchStatus, Job, JobStatus, JobType, NotificationType, Upload, UploadStatus, batch,
    job, upload,
};
use crate::notifications::Notice;
use crate::payload::{BatchCounts, UploadSummary};

/// Where one batch stands, as far as the summary is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStage {
    pub status: BatchStatus,
    pub analyze: Option<JobStatus>,
    pub structure: Option<JobStatus>,
    pub insert: Option<JobStatus>,
}

impl BatchStage {
    fn stage(&self, job_type: JobType) -> Option<JobStatus> {
        match job_type {
            JobType::Analyze => self.analyze,
            JobType::Structure => self.structure,
            JobType::Insert => self.insert,
            _ => None,
        }
    }
}

/// Result of [`refresh_upload_summary`].
#[derive(Debug, Clone)]
pub struct SummaryRefresh {
    pub upload: upload::Model,
    pub summary: UploadSummary,
    /// Stage notices that became due with this refresh
    pub notices: Vec<Notice>,
}

pub fn count_batches(statuses: impl IntoIterator<Item = BatchStatus>) -> BatchCounts {
    let mut counts = BatchCounts::default();
    for status in statuses {
        match status {
            BatchStatus::Queued => counts.queued += 1,
            BatchStatus::Analyzing => counts.analyzing += 1,
            BatchStatus::Structuring => counts.structuring += 1,
            BatchStatus::Inserting => counts.inserting += 1,
            BatchStatus::Completed => counts.completed += 1,
            BatchStatus::Failed => counts.failed += 1,
            BatchStatus::NeedsReupload => counts.needs_reupload += 1,
        }
    }
    counts
}

/// Any failed batch fails the upload; all completed completes it.
pub fn upload_status_for(counts: &BatchCounts) -> UploadStatus {
    if counts.failures() > 0 {
        UploadStatus::Failed
    } else if counts.total() > 0 && counts.completed == counts.total() {
        UploadStatus::Completed
    } else {
        UploadStatus::Processing
    }
}

/// A stage is complete once every batch either passed it or failed for good,
/// and at least one batch actually passed.
pub fn stage_complete(batches: &[BatchStage], job_type: JobType) -> bool {
    let passed = |batch: &BatchStage| batch.stage(job_type) == Some(JobStatus::Succeeded);
    batches.iter().any(passed)
        && batches
            .iter()
            .all(|batch| passed(batch) || batch.status.is_failure())
}

/// Recomputes counters and stamps newly completed stages. Returns the stages stamped.
pub fn apply_refresh(
    summary: &mut UploadSummary,
    batches: &[BatchStage],
    now: DateTime<Utc>,
) -> Vec<NotificationType> {
    summary.batch_counts = count_batches(batches.iter().map(|batch| batch.status));
    summary.total_batches = u32::try_from(batches.len()).unwrap_or(u32::MAX);

    let mut stamped = Vec::new();
    let stages = [
        (
            JobType::Analyze,
            &mut summary.stages.analyze_completed_at,
            NotificationType::AnalyzeComplete,
        ),
        (
            JobType::Structure,
            &mut summary.stages.structure_completed_at,
            NotificationType::StructureComplete,
        ),
        (
            JobType::Insert,
            &mut summary.stages.insert_completed_at,
            NotificationType::InsertComplete,
        ),
    ];
    for (job_type, slot, notice) in stages {
        if slot.is_none() && stage_complete(batches, job_type) {
            *slot = Some(now);
            stamped.push(notice);
        }
    }
    stamped
}

/// Re-aggregates an upload from its batches in a transaction of its own.
pub async fn refresh_upload_summary(
    db: &DatabaseConnection,
    upload_id: Uuid,
) -> Result<SummaryRefresh, PipelineError> {
    let now = Utc::now();
    let txn = db.begin().await?;

    let locked = Upload::update_many()
        .col_expr(upload::Column::UpdatedAt, Expr::value(to_db_time(now)))
        .filter(upload::Column::Id.eq(upload_id))
        .exec(&txn)
        .await?;
    if locked.rows_affected == 0 {
        return Err(PipelineError::not_found("upload", upload_id));
    }

    let current = Upload::find_by_id(upload_id)
        .one(&txn)
        .await?
        .ok_or_else(|| PipelineError::not_found("upload", upload_id))?;
    let batches = Batch::find()
        .filter(batch::Column::UploadId.eq(upload_id))
        .all(&txn)
        .await?;
    let jobs = Job::find()
        .filter(job::Column::UploadId.eq(upload_id))
        .filter(job::Column::BatchId.is_not_null())
        .all(&txn)
        .await?;

    let mut job_statuses: HashMap<(Uuid, JobType), JobStatus> = HashMap::new();
    for job in &jobs {
        if let Some(batch_id) = job.batch_id {
            job_statuses.insert((batch_id, job.job_type), job.status);
        }
    }
    let stages: Vec<BatchStage> = batches
        .iter()
        .map(|batch| BatchStage {
            status: batch.status,
            analyze: job_statuses.get(&(batch.id, JobType::Analyze)).copied(),
            structure: job_statuses.get(&(batch.id, JobType::Structure)).copied(),
            insert: job_statuses.get(&(batch.id, JobType::Insert)).copied(),
        })
        .collect();

    let mut summary = UploadSummary::from_json(&current.summary);
    let stamped = apply_refresh(&mut summary, &stages, now);
    let status = upload_status_for(&summary.batch_counts);
    let completed_at = match status {
        UploadStatus::Completed => current.completed_at.or(Some(to_db_time(now))),
        _ => None,
    };

    let mut active: upload::ActiveModel = current.into();
    active.status = Set(status);
    active.summary = Set(serde_json::to_value(&summary)?);
    active.completed_at = Set(completed_at);
    active.updated_at = Set(to_db_time(now));
    let updated = active.update(&txn).await?;

    if status == UploadStatus::Completed {
        Batch::update_many()
            .col_expr(batch::Column::RawRows, Expr::value(Value::Json(None)))
            .col_expr(batch::Column::Analysis, Expr::value(Value::Json(None)))
            .col_expr(batch::Column::Structured, Expr::value(Value::Json(None)))
            .filter(batch::Column::UploadId.eq(upload_id))
            .exec(&txn)
            .await?;
    }

    txn.commit().await?;

    if !stamped.is_empty() {
        tracing::info!(upload_id = %upload_id, stages = ?stamped, "Upload stages completed");
    }
    let notices = stamped
        .into_iter()
        .map(|kind| Notice::new(kind, updated.clone()))
        .collect();

    Ok(SummaryRefresh {
        upload: updated,
        summary,
        notices,
    })
}
