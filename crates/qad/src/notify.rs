//! Notification sinks.

use qa_core::events::Notification;
use thiserror::Error;
use tracing::info;

use crate::ports::NotificationSink;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to enqueue notification: {0}")]
    Outbox(#[from] StorageError),
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient_id,
            assignment_id = %notification.assignment_id,
            "notification: {}",
            notification.message
        );
        Ok(())
    }
}

/// Queues notifications in the outbox table for an external deliverer.
impl NotificationSink for Storage {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.enqueue_notification(notification).await?;
        Ok(())
    }
}
