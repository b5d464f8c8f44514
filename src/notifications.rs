//! Upload notifications
//!
//! Every notice is first reserved in the notification log under its dedup key; only the
//! caller that wins the reservation talks to the mailer. Stage notices are fire-once:
//! a delivery failure is recorded as FAILED and never retried. The final completion
//! notice is sent from the NOTIFICATION job, which may take over a FAILED entry on retry.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::config::NotificationConfig;
use crate::error::JobError;
use crate::mail::{MailAttachment, MailMessage, Mailer, recipients_for};
use crate::models::notification_log::Model as NotificationLogModel;
use crate::models::{NotificationStatus, NotificationType, batch, upload};
use crate::payload::{NotificationResult, UploadSummary};
use crate::repositories::NotificationLogRepository;
use crate::telemetry::METRIC_NOTIFICATIONS;

/// A stage transition worth telling the uploader about.
#[derive(Debug, Clone)]
pub struct Notice {
    pub notification_type: NotificationType,
    pub upload: upload::Model,
    /// The failing batch for [`NotificationType::BatchFailed`]
    pub batch: Option<batch::Model>,
}

impl Notice {
    pub fn new(notification_type: NotificationType, upload: upload::Model) -> Self {
        Self {
            notification_type,
            upload,
            batch: None,
        }
    }

    pub fn batch_failed(upload: upload::Model, batch: batch::Model) -> Self {
        Self {
            notification_type: NotificationType::BatchFailed,
            upload,
            batch: Some(batch),
        }
    }
}

/// What happened to a stage notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeOutcome {
    Sent { message_id: String },
    Duplicate,
    Failed { error: String },
}

/// Batch listed under "needs attention" in the completion mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionItem {
    pub group_key: String,
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct Notifier {
    log: NotificationLogRepository,
    mailer: Arc<dyn Mailer>,
    ops_address: Option<String>,
    public_base_url: String,
}

impl Notifier {
    pub fn new(
        log: NotificationLogRepository,
        mailer: Arc<dyn Mailer>,
        config: &NotificationConfig,
    ) -> Self {
        Self {
            log,
            mailer,
            ops_address: config.ops_address.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Sends a stage notice at most once. Never fails the caller.
    pub async fn notify(&self, notice: Notice) -> NoticeOutcome {
        let recipients = recipients_for(&notice.upload.uploader_email, self.ops_address.as_deref());
        let (subject, html) = self.compose(&notice);
        let batch_id = notice.batch.as_ref().map(|batch| batch.id);
        let kind = notice.notification_type;

        let entry = match self
            .log
            .reserve(notice.upload.id, kind, batch_id, &recipients, &subject)
            .await
        {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(upload_id = %notice.upload.id, notification_type = %kind, "Notification already recorded");
                record_metric(kind, "duplicate");
                return NoticeOutcome::Duplicate;
            }
            Err(err) => {
                error!(upload_id = %notice.upload.id, notification_type = %kind, error = %err, "Failed to reserve notification");
                record_metric(kind, "failed");
                return NoticeOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };

        let message = MailMessage {
            to: recipients,
            subject,
            html,
            attachments: Vec::new(),
        };
        match self.deliver(&entry, message).await {
            Ok(message_id) => NoticeOutcome::Sent { message_id },
            Err(error) => NoticeOutcome::Failed { error },
        }
    }

    /// Sends the final completion mail with the workbook attached.
    ///
    /// Repeated calls return the first delivery; a previously failed delivery is retried.
    pub async fn send_completion(
        &self,
        upload: &upload::Model,
        attention: &[AttentionItem],
        attachment: MailAttachment,
    ) -> Result<NotificationResult, JobError> {
        let kind = NotificationType::Completed;
        let recipients = recipients_for(&upload.uploader_email, self.ops_address.as_deref());
        let summary = UploadSummary::from_json(&upload.summary);
        let subject = format!("Upload finished: {}", upload.original_filename);
        let html = completion_html(upload, &summary, attention);

        let entry = match self
            .log
            .reserve(upload.id, kind, None, &recipients, &subject)
            .await?
        {
            Some(entry) => entry,
            None => {
                let key = NotificationLogModel::dedup_key_for(upload.id, kind, None);
                let existing = self
                    .log
                    .find_by_dedup_key(&key)
                    .await?
                    .ok_or_else(|| JobError::transient("completion notice vanished"))?;

                if existing.status == NotificationStatus::Sent {
                    info!(upload_id = %upload.id, "Completion notice already delivered");
                    return Ok(NotificationResult {
                        recipients: stored_recipients(&existing),
                        message_id: existing.message_id.unwrap_or_default(),
                    });
                }
                if !self.log.reclaim(existing.id).await? {
                    return Err(JobError::transient(
                        "completion notice is being delivered by another worker",
                    ));
                }
                existing
            }
        };

        let message = MailMessage {
            to: recipients.clone(),
            subject,
            html,
            attachments: vec![attachment],
        };
        let message_id = self
            .deliver(&entry, message)
            .await
            .map_err(|error| JobError::transient(format!("completion mail failed: {error}")))?;

        Ok(NotificationResult {
            message_id,
            recipients,
        })
    }

    async fn deliver(
        &self,
        entry: &NotificationLogModel,
        message: MailMessage,
    ) -> Result<String, String> {
        let kind = entry.notification_type;
        match self.mailer.send(message).await {
            Ok(sent) => {
                if let Err(err) = self.log.mark_sent(entry.id, &sent.message_id).await {
                    warn!(notification_id = %entry.id, error = %err, "Failed to mark notification sent");
                }
                info!(
                    upload_id = %entry.upload_id,
                    notification_type = %kind,
                    message_id = %sent.message_id,
                    "Notification sent"
                );
                record_metric(kind, "sent");
                Ok(sent.message_id)
            }
            Err(err) => {
                let error = err.to_string();
                if let Err(db_err) = self.log.mark_failed(entry.id, &error).await {
                    warn!(notification_id = %entry.id, error = %db_err, "Failed to mark notification failed");
                }
                warn!(
                    upload_id = %entry.upload_id,
                    notification_type = %kind,
                    error = %error,
                    "Notification delivery failed"
                );
                record_metric(kind, "failed");
                Err(error)
            }
        }
    }

    fn compose(&self, notice: &Notice) -> (String, String) {
        let upload = &notice.upload;
        let summary = UploadSummary::from_json(&upload.summary);
        let name = &upload.original_filename;
        let counts = summary.batch_counts;
        let progress = format!(
            "<p>{} of {} batches completed, {} need attention.</p>",
            counts.completed,
            summary.total_batches,
            counts.failures()
        );

        match notice.notification_type {
            NotificationType::UploadQueued => (
                format!("Upload received: {name}"),
                format!(
                    "<p>We received <strong>{}</strong> with {} rows in {} batches. Processing has started.</p>",
                    escape(name),
                    summary.total_rows,
                    summary.total_batches
                ),
            ),
            NotificationType::AnalyzeComplete => (
                format!("Analysis finished: {name}"),
                format!("<p>Every batch of {} has been analyzed.</p>{progress}", escape(name)),
            ),
            NotificationType::StructureComplete => (
                format!("Structuring finished: {name}"),
                format!("<p>Every batch of {} has been structured.</p>{progress}", escape(name)),
            ),
            NotificationType::InsertComplete => (
                format!("Records saved: {name}"),
                format!(
                    "<p>Elections and candidates from {} have been saved.</p>{progress}",
                    escape(name)
                ),
            ),
            NotificationType::BatchFailed => {
                let (group, reason) = notice
                    .batch
                    .as_ref()
                    .map(|batch| {
                        (
                            batch.group_key.clone(),
                            batch.error_reason.clone().unwrap_or_default(),
                        )
                    })
                    .unwrap_or_default();
                (
                    format!("Batch needs attention: {name}"),
                    format!(
                        "<p>The batch <strong>{}</strong> of {} could not be processed and needs to be re-uploaded or retried.</p><p>{}</p><p><a href=\"{}/uploads/{}\">Review the upload</a></p>",
                        escape(&group),
                        escape(name),
                        escape(&reason),
                        self.public_base_url,
                        upload.id
                    ),
                )
            }
            NotificationType::Completed => (
                format!("Upload finished: {name}"),
                completion_html(upload, &summary, &[]),
            ),
        }
    }
}

fn completion_html(
    upload: &upload::Model,
    summary: &UploadSummary,
    attention: &[AttentionItem],
) -> String {
    let created: u32 = summary
        .insert_results
        .iter()
        .map(|entry| entry.summary.candidates_created)
        .sum();
    let updated: u32 = summary
        .insert_results
        .iter()
        .map(|entry| entry.summary.candidates_updated)
        .sum();

    let mut html = format!(
        "<p>Processing of <strong>{}</strong> has finished.</p><ul><li>Rows: {}</li><li>Batches completed: {} of {}</li><li>Candidates created: {}</li><li>Candidates updated: {}</li></ul>",
        escape(&upload.original_filename),
        summary.total_rows,
        summary.batch_counts.completed,
        summary.total_batches,
        created,
        updated
    );
    if !attention.is_empty() {
        html.push_str("<p>Batches needing attention:</p><ul>");
        for item in attention {
            html.push_str(&format!(
                "<li>{} ({}){}</li>",
                escape(&item.group_key),
                item.status,
                item.reason
                    .as_deref()
                    .map(|reason| format!(": {}", escape(reason)))
                    .unwrap_or_default()
            ));
        }
        html.push_str("</ul>");
    }
    html.push_str("<p>The results workbook is attached.</p>");
    html
}

fn stored_recipients(entry: &NotificationLogModel) -> Vec<String> {
    serde_json::from_value(entry.recipients.clone()).unwrap_or_default()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn record_metric(kind: NotificationType, status: &'static str) {
    counter!(METRIC_NOTIFICATIONS, "type" => kind.as_str(), "status" => status).increment(1);
}
