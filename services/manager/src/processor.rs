//! Processing of messages sent by agents.
//!
//! Messaging clients push everything they receive onto the manager's inbound
//! queue. The [`MessageProcessor`] drains it and hands each notification to
//! the manager.

use std::sync::Arc;

use anyhow::Result;
use dm_messages::Message;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::manager::Manager;

/// Consumer of the inbound message queue.
pub struct MessageProcessor {
    manager: Arc<Manager>,
    inbound: mpsc::UnboundedReceiver<Message>,
}

impl MessageProcessor {
    pub fn new(manager: Arc<Manager>, inbound: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { manager, inbound }
    }

    /// Process messages until shutdown or until every sender is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting message processor");

        loop {
            tokio::select! {
                message = self.inbound.recv() => {
                    match message {
                        Some(message) => self.process(message).await,
                        None => {
                            info!("Inbound queue closed, message processor exiting");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Message processor shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Process whatever is queued right now. Returns the number of messages
    /// handled.
    pub async fn process_available(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(message) = self.inbound.try_recv() {
            self.process(message).await;
            processed += 1;
        }
        processed
    }

    async fn process(&self, message: Message) {
        match message {
            Message::Notification(notification) => {
                let kind = notification.kind();
                let application = notification.application_name().to_string();
                debug!(application = %application, kind, "Processing notification");

                if let Err(e) = self.manager.handle_notification(notification).await {
                    warn!(
                        application = %application,
                        kind,
                        error = %e,
                        "Failed to process notification"
                    );
                }
            }
            Message::Command(command) => {
                warn!(kind = command.kind(), "Ignoring command received from an agent");
            }
        }
    }
}
