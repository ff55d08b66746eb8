//! Attempt alerts: one notification per attempt, sent once, never retried.

use crate::config::SmtpSettings;
use faceguard_core::{AlertRecord, AttemptOutcome};
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use std::time::Duration;
use thiserror::Error;

const GRANTED_SUBJECT: &str = "Successful Login Alert: Face Authentication";
const DENIED_SUBJECT: &str = "Unauthorized Face Login Attempt Detected";
const GRANTED_ATTACHMENT: &str = "login_image.jpg";
const DENIED_ATTACHMENT: &str = "failed_attempt.jpg";
const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("invalid address {address}: {message}")]
    Address { address: String, message: String },
    #[error("failed to build message: {0}")]
    Message(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

/// A fully built notification, ready for one transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachment: Option<Attachment>,
}

/// Outbound notification transport.
pub trait Notifier: Send {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Authenticated STARTTLS mail relay.
pub struct SmtpNotifier {
    transport: SmtpTransport,
    sender: Mailbox,
}

impl SmtpNotifier {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        let sender = settings
            .sender
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::Address {
                address: settings.sender.clone(),
                message: e.to_string(),
            })?;
        let transport = SmtpTransport::starttls_relay(&settings.host)
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.expose_secret().to_owned(),
            ))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        tracing::info!(host = %settings.host, port = settings.port, "SMTP notifier configured");
        Ok(Self { transport, sender })
    }
}

impl Notifier for SmtpNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(notification.subject.clone());
        for recipient in &notification.recipients {
            let mailbox = recipient.parse::<Mailbox>().map_err(|e| NotifyError::Address {
                address: recipient.clone(),
                message: e.to_string(),
            })?;
            builder = builder.to(mailbox);
        }

        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(notification.body.clone()));
        if let Some(attachment) = &notification.attachment {
            let content_type = ContentType::parse(&attachment.mime_type)
                .map_err(|e| NotifyError::Message(e.to_string()))?;
            parts = parts.singlepart(
                MailAttachment::new(attachment.filename.clone())
                    .body(attachment.bytes.clone(), content_type),
            );
        }

        let message = builder
            .multipart(parts)
            .map_err(|e| NotifyError::Message(e.to_string()))?;
        self.transport
            .send(&message)
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Turns attempt records into notifications for the configured recipients.
pub struct AlertDispatcher {
    recipients: Vec<String>,
    notifier: Box<dyn Notifier>,
}

impl AlertDispatcher {
    pub fn new(recipients: Vec<String>, notifier: Box<dyn Notifier>) -> Self {
        Self {
            recipients,
            notifier,
        }
    }

    /// Send the alert for one attempt. A single transmission to every recipient.
    pub fn notify(&self, record: &AlertRecord) -> Result<(), NotifyError> {
        let notification = self.build(record);
        self.notifier.send(&notification)?;
        tracing::info!(
            outcome = record.outcome.kind(),
            recipients = self.recipients.len(),
            "alert sent"
        );
        Ok(())
    }

    /// Denied alerts carry only the time: no label, no distance.
    pub fn build(&self, record: &AlertRecord) -> Notification {
        let time = record.timestamp.format("%a %b %-d %H:%M:%S %Y");
        let (subject, body, filename) = match &record.outcome {
            AttemptOutcome::Granted(label) => (
                GRANTED_SUBJECT,
                format!(
                    "User *{label}* successfully logged in to the confidential system \
                     via face authentication. Time: {time}."
                ),
                GRANTED_ATTACHMENT,
            ),
            AttemptOutcome::Denied => (
                DENIED_SUBJECT,
                format!("An unauthorized person tried to login.\nTime: {time}"),
                DENIED_ATTACHMENT,
            ),
        };

        let attachment = (!record.image.is_empty()).then(|| Attachment {
            bytes: record.image.clone(),
            mime_type: "image/jpeg".to_string(),
            filename: filename.to_string(),
        });

        Notification {
            recipients: self.recipients.clone(),
            subject: subject.to_string(),
            body,
            attachment,
        }
    }
}
