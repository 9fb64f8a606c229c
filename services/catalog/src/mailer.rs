//! Mail dispatcher: the single place notifications are sent from.
//!
//! Send failures are logged and counted; they never propagate to the caller,
//! so a broken mail backend cannot cause redelivery of the work that
//! triggered the notification.

use crate::notifier::{NotificationMessage, Notifier};
use async_trait::async_trait;
use shutter_pipeline::{EventHandler, HandlerError, RoutedEvent};
use std::sync::Arc;
use tracing::{error, info};

/// Sends notifications through a [`Notifier`]
pub struct MailDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl MailDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Send one notification; returns whether it was delivered
    pub async fn notify(&self, message: NotificationMessage) -> bool {
        match self.notifier.send(&message).await {
            Ok(()) => {
                info!(kind = %message.kind, key = %message.key, "Notification sent");
                metrics::counter!("catalog.notifications.sent", "kind" => message.kind.as_str()).increment(1);
                true
            }
            Err(e) => {
                error!(kind = %message.kind, key = %message.key, error = %e, "Failed to send notification");
                metrics::counter!("catalog.notifications.failed", "kind" => message.kind.as_str()).increment(1);
                false
            }
        }
    }
}

/// Which mail a queue consumer sends for each event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailPath {
    /// Successfully processed uploads
    Accepted,
    /// Uploads that ended in the dead-letter queue
    Rejected,
}

/// Queue handler turning events into notifications
pub struct MailQueueHandler {
    dispatcher: Arc<MailDispatcher>,
    path: MailPath,
}

impl MailQueueHandler {
    pub fn new(dispatcher: Arc<MailDispatcher>, path: MailPath) -> Self {
        Self { dispatcher, path }
    }
}

#[async_trait]
impl EventHandler for MailQueueHandler {
    async fn handle(&self, event: &RoutedEvent) -> Result<(), HandlerError> {
        let message = match self.path {
            MailPath::Accepted => NotificationMessage::upload_accepted(&event.source_collection, &event.object_key),
            MailPath::Rejected => NotificationMessage::upload_rejected(&event.object_key),
        };

        self.dispatcher.notify(message).await;
        Ok(())
    }
}
