//! Notification messages and delivery backends.

use crate::config::{AwsConfig, NotifyConfig};
use askama::Template;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use aws_sdk_sesv2::Client as SesClient;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised while sending a notification
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to build email: {0}")]
    Build(String),

    #[error("Failed to send email: {0}")]
    Send(String),
}

/// Lifecycle event a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NotificationKind {
    UploadAccepted,
    UploadRejected,
    RecordDeleted,
    DescriptionUpdated,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::UploadAccepted => "upload_accepted",
            NotificationKind::UploadRejected => "upload_rejected",
            NotificationKind::RecordDeleted => "record_deleted",
            NotificationKind::DescriptionUpdated => "description_updated",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formatted notification, ready to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    pub kind: NotificationKind,
    /// Object key the notification is about
    pub key: String,
    pub subject: String,
    pub text: String,
}

impl NotificationMessage {
    fn new(kind: NotificationKind, key: &str, subject: &str, text: String) -> Self {
        Self {
            kind,
            key: key.to_string(),
            subject: subject.to_string(),
            text,
        }
    }

    pub fn upload_accepted(bucket: &str, key: &str) -> Self {
        Self::new(
            NotificationKind::UploadAccepted,
            key,
            "Image Upload notification",
            format!("We received your Image. Its URL is s3://{bucket}/{key}"),
        )
    }

    pub fn upload_rejected(key: &str) -> Self {
        Self::new(
            NotificationKind::UploadRejected,
            key,
            "File Type Rejection Notification",
            format!("Failed to process your image due to an unsupported file type: {key}."),
        )
    }

    pub fn record_deleted(key: &str) -> Self {
        Self::new(
            NotificationKind::RecordDeleted,
            key,
            "Record Deleted",
            format!("The image \"{key}\" has been deleted from the record table."),
        )
    }

    pub fn description_updated(key: &str, description: &str) -> Self {
        Self::new(
            NotificationKind::DescriptionUpdated,
            key,
            "Image Description Updated",
            format!("The description of \"{key}\" is now: {description}"),
        )
    }

    /// Body rendered as a minimal HTML document
    pub fn html(&self) -> Result<String, NotifyError> {
        NotificationHtml { text: &self.text }
            .render()
            .map_err(|e| NotifyError::Build(format!("Template rendering failed: {e}")))
    }
}

/// HTML email body; the text is escaped on render
#[derive(Template, Debug)]
#[template(path = "notification.html")]
struct NotificationHtml<'a> {
    text: &'a str,
}

/// Delivery backend for notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError>;
}

/// Email notifier using the SES v2 API
pub struct SesNotifier {
    client: SesClient,
    from: String,
    to: String,
}

impl SesNotifier {
    pub async fn new(aws: &AwsConfig, notify: &NotifyConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(aws.region.clone()))
            .load()
            .await;

        info!(from = %notify.from, to = %notify.to, "SES notifier initialized");

        Self {
            client: SesClient::new(&aws_config),
            from: notify.from.clone(),
            to: notify.to.clone(),
        }
    }

    fn content(data: impl Into<String>) -> Result<Content, NotifyError> {
        Content::builder()
            .data(data)
            .charset("UTF-8")
            .build()
            .map_err(|e| NotifyError::Build(e.to_string()))
    }
}

#[async_trait]
impl Notifier for SesNotifier {
    #[instrument(skip(self, message), fields(kind = %message.kind, key = %message.key))]
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        let body = Body::builder()
            .text(Self::content(message.text.clone())?)
            .html(Self::content(message.html()?)?)
            .build();

        let email = Message::builder()
            .subject(Self::content(message.subject.clone())?)
            .body(body)
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(&self.from)
            .destination(Destination::builder().to_addresses(&self.to).build())
            .content(EmailContent::builder().simple(email).build())
            .send()
            .await
            .map_err(|e| NotifyError::Send(e.to_string()))?;

        debug!(message_id = output.message_id().unwrap_or_default(), "Email sent");
        Ok(())
    }
}

/// Notifier that only logs, for dry runs
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        info!(
            kind = %message.kind,
            key = %message.key,
            subject = %message.subject,
            body = %message.text,
            "Notification (dry run)"
        );
        Ok(())
    }
}
