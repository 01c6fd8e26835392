//! Run loop connecting the transport to the command pipeline and the
//! notification scheduler.
//!
//! This is where the dedup contract is honored: a notification's marker
//! is written only after the transport confirms delivery, so a crash
//! between building and sending re-fires on the next tick instead of
//! dropping the alert.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use utility::streams::Notification;

use crate::{
    commands::CommandPipeline,
    format,
    scheduler::NotificationScheduler,
    transport::{ChatTransport, IncomingMessage},
};

pub struct ChatBot {
    pipeline: CommandPipeline,
    scheduler: Arc<NotificationScheduler>,
    transport: Arc<dyn ChatTransport>,
}

impl ChatBot {
    #[must_use]
    pub fn new(
        pipeline: CommandPipeline,
        scheduler: Arc<NotificationScheduler>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            pipeline,
            scheduler,
            transport,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<IncomingMessage>,
        mut notifications: mpsc::Receiver<Notification>,
        mut exit_receiver: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                message = messages.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!("Message channel closed.");
                            return;
                        }
                    }
                }

                notification = notifications.recv() => {
                    match notification {
                        Some(notification) => self.deliver(notification).await,
                        None => {
                            info!("Notification channel closed.");
                            return;
                        }
                    }
                }

                res = exit_receiver.changed() => {
                    if res.is_err() || *exit_receiver.borrow() {
                        info!(task = "Chat bot", "Shutting down.");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: IncomingMessage) {
        let Some(reply) = self.pipeline.handle(&message).await else {
            return;
        };

        if let Err(e) = self.transport.send(&message.room_id, &reply).await {
            warn!(room = %message.room_id, error = %e, "Reply delivery failed.");
        }
    }

    async fn deliver(&self, notification: Notification) {
        let text = format::notification(&notification);

        match self.transport.send(&notification.room_id, &text).await {
            Ok(()) => {
                self.scheduler
                    .mark_notified(&notification.stream, notification.minutes_until)
                    .await;
            }
            Err(e) => {
                // No marker: the next matching tick gets another chance.
                warn!(
                    room = %notification.room_id,
                    stream = %notification.stream.id,
                    error = %e,
                    "Notification delivery failed."
                );
            }
        }
    }
}
