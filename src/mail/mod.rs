//! Outbound mail
//!
//! The pipeline only needs to hand a finished message to something that can deliver it.
//! [`SmtpMailer`] talks to a relay through `lettre`; [`LogMailer`] records the message in
//! the log and is used when no relay is configured.

pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::NotificationConfig;

pub use smtp::SmtpMailer;

/// File attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Message handed to a [`Mailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    pub attachments: Vec<MailAttachment>,
}

/// Receipt returned by a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("message has no recipients")]
    NoRecipients,
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("mail transport failed: {0}")]
    Transport(String),
}

/// Mail delivery collaborator.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: MailMessage) -> Result<SentMail, MailError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: MailMessage) -> Result<SentMail, MailError> {
        if message.to.is_empty() {
            return Err(MailError::NoRecipients);
        }
        let message_id = format!("log-{}", Uuid::new_v4().simple());
        info!(
            message_id = %message_id,
            to = ?message.to,
            subject = %message.subject,
            attachments = message.attachments.len(),
            "Mail delivery disabled; message logged"
        );
        Ok(SentMail { message_id })
    }
}

/// Picks the SMTP mailer when a relay host is configured, otherwise the log mailer.
pub fn build_mailer(config: &NotificationConfig) -> Result<Arc<dyn Mailer>, MailError> {
    match config.smtp_host.as_deref() {
        Some(host) if !host.trim().is_empty() => Ok(Arc::new(SmtpMailer::from_config(config)?)),
        _ => Ok(Arc::new(LogMailer)),
    }
}

/// Uploader first, then the operations address, without case-insensitive duplicates.
pub fn recipients_for(uploader: &str, ops_address: Option<&str>) -> Vec<String> {
    let mut recipients: Vec<String> = Vec::new();
    for address in std::iter::once(uploader).chain(ops_address) {
        let address = address.trim();
        if address.is_empty() {
            continue;
        }
        if recipients
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(address))
        {
            continue;
        }
        recipients.push(address.to_string());
    }
    recipients
}
