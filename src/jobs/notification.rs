use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use super::{JobContext, JobHandler, decode};
use crate::error::JobError;
use crate::mail::MailAttachment;
use crate::models::{AttemptStatus, Batch, Job, JobAttempt, JobType, batch, job, job_attempt};
use crate::notifications::{AttentionItem, Notifier};
use crate::payload::{JobOutput, WorkbookResult};

/// Mails the completion summary with the workbook attached.
pub struct NotificationHandler {
    db: DatabaseConnection,
    notifier: Notifier,
}

impl NotificationHandler {
    pub fn new(db: DatabaseConnection, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    async fn workbook_output(&self, ctx: &JobContext) -> Result<WorkbookResult, JobError> {
        let workbook_job_id = match ctx.job.dependency_job_id {
            Some(id) => id,
            None => Job::find()
                .filter(job::Column::UploadId.eq(ctx.upload.id))
                .filter(job::Column::JobType.eq(JobType::Workbook))
                .one(&self.db)
                .await?
                .map(|job| job.id)
                .ok_or_else(|| {
                    JobError::permanent(format!("upload {} has no workbook job", ctx.upload.id))
                })?,
        };

        let attempt = JobAttempt::find()
            .filter(job_attempt::Column::JobId.eq(workbook_job_id))
            .filter(job_attempt::Column::Status.eq(AttemptStatus::Succeeded))
            .order_by_desc(job_attempt::Column::CompletedAt)
            .one(&self.db)
            .await?
            .ok_or_else(|| {
                JobError::permanent(format!("workbook job {workbook_job_id} has no successful attempt"))
            })?;
        let payload = attempt.response_payload.as_ref().ok_or_else(|| {
            JobError::permanent(format!("workbook attempt {} stored no output", attempt.id))
        })?;

        match decode::<JobOutput>(payload, "workbook output")? {
            JobOutput::Workbook(result) => Ok(result),
            _ => Err(JobError::permanent(format!(
                "attempt {} does not hold a workbook",
                attempt.id
            ))),
        }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    fn job_type(&self) -> JobType {
        JobType::Notification
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let workbook = self.workbook_output(ctx).await?;
        let bytes = STANDARD
            .decode(workbook.content_base64.as_bytes())
            .map_err(|err| JobError::permanent(format!("workbook is not valid base64: {err}")))?;

        let attention: Vec<AttentionItem> = Batch::find()
            .filter(batch::Column::UploadId.eq(ctx.upload.id))
            .order_by_asc(batch::Column::GroupKey)
            .all(&self.db)
            .await?
            .into_iter()
            .filter(|batch| batch.status.is_failure())
            .map(|batch| AttentionItem {
                group_key: batch.group_key,
                status: batch.status.to_string(),
                reason: batch.error_reason,
            })
            .collect();

        let result = self
            .notifier
            .send_completion(
                &ctx.upload,
                &attention,
                MailAttachment {
                    filename: workbook.filename,
                    content_type: workbook.content_type,
                    bytes,
                },
            )
            .await?;
        Ok(JobOutput::Notification(result))
    }
}
