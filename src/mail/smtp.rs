//! SMTP delivery through `lettre`.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MailError, MailMessage, Mailer, SentMail};
use crate::config::NotificationConfig;

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(config: &NotificationConfig) -> Result<Self, MailError> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| MailError::Build("SMTP host is not configured".to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|err| MailError::Build(err.to_string()))?
            .port(config.smtp_port);
        if let (Some(username), Some(password)) =
            (config.smtp_username.as_ref(), config.smtp_password.as_ref())
        {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: parse_mailbox(&config.mail_from)?,
        })
    }

    fn build_message(&self, message: &MailMessage, message_id: &str) -> Result<Message, MailError> {
        if message.to.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone())
            .message_id(Some(message_id.to_string()));
        for recipient in &message.to {
            builder = builder.to(parse_mailbox(recipient)?);
        }

        let mut body = MultiPart::mixed().singlepart(SinglePart::html(message.html.clone()));
        for attachment in &message.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .map_err(|err| MailError::Build(err.to_string()))?;
            body = body.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.bytes.clone(), content_type),
            );
        }

        builder
            .multipart(body)
            .map_err(|err| MailError::Build(err.to_string()))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: MailMessage) -> Result<SentMail, MailError> {
        let domain = self.from.email.domain().to_string();
        let message_id = format!("<{}@{}>", Uuid::new_v4().simple(), domain);
        let email = self.build_message(&message, &message_id)?;

        match self.transport.send(email).await {
            Ok(response) => {
                debug!(
                    message_id = %message_id,
                    code = %response.code(),
                    "SMTP relay accepted message"
                );
                Ok(SentMail { message_id })
            }
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "SMTP delivery failed");
                Err(MailError::Transport(err.to_string()))
            }
        }
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|err: lettre::address::AddressError| MailError::InvalidAddress {
        address: address.to_string(),
        reason: err.to_string(),
    })
}
