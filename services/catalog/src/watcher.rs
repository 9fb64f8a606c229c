//! Change-stream watcher.
//!
//! Observes every record mutation and sends the notifications that depend on
//! record state: one RecordDeleted per removal, whichever path removed the
//! record, and one DescriptionUpdated when a description changes.

use crate::mailer::MailDispatcher;
use crate::notifier::{NotificationKind, NotificationMessage};
use crate::record_store::{RecordChange, RecordStore};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, instrument};

pub struct ChangeStreamWatcher {
    changes: Mutex<mpsc::UnboundedReceiver<RecordChange>>,
    dispatcher: Arc<MailDispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChangeStreamWatcher {
    /// Subscribe to the store's change stream.
    ///
    /// Changes made after this call are observed, even before [`run`](Self::run)
    /// starts.
    pub fn new(store: &dyn RecordStore, dispatcher: Arc<MailDispatcher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            changes: Mutex::new(store.subscribe()),
            dispatcher,
            shutdown_tx,
        }
    }

    /// Signal shutdown to stop watching
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Notification owed for a change, if any
    pub fn notification_for(change: &RecordChange) -> Option<NotificationMessage> {
        match change {
            RecordChange::Remove { key } => Some(NotificationMessage::record_deleted(key)),
            RecordChange::Modify {
                key,
                new_description: Some(description),
            } => Some(NotificationMessage::description_updated(key, description)),
            _ => None,
        }
    }

    /// Handle one change; returns the kind of notification sent
    pub async fn handle_change(&self, change: &RecordChange) -> Option<NotificationKind> {
        let message = Self::notification_for(change)?;
        let kind = message.kind;

        debug!(key = %change.key(), kind = %kind, "Record change needs notification");
        self.dispatcher.notify(message).await;
        Some(kind)
    }

    /// Watch until shutdown or until the change stream closes.
    ///
    /// On shutdown, changes that were already queued are handled first.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut changes = self.changes.lock().await;

        info!("Starting change-stream watcher");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    // Changes already observed still owe their notifications
                    while let Ok(change) = changes.try_recv() {
                        self.handle_change(&change).await;
                    }
                    break;
                }
                received = changes.recv() => match received {
                    Some(change) => {
                        self.handle_change(&change).await;
                    }
                    None => {
                        info!("Change stream closed");
                        break;
                    }
                }
            }
        }
    }
}
