//! Status-change notifications for observers.

use chrono::{DateTime, Utc};
use dm_model::{InstancePath, InstanceStatus};
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of the status-change channel.
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// An instance moved from one status to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub application: String,
    pub instance_path: InstancePath,
    pub previous: InstanceStatus,
    pub current: InstanceStatus,
    pub at: DateTime<Utc>,
}

/// Fan-out of [`StatusChange`] events.
///
/// Publishing never blocks and never fails; changes are simply dropped when
/// nobody listens.
#[derive(Clone)]
pub struct StatusNotifier {
    sender: broadcast::Sender<StatusChange>,
}

impl StatusNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.sender.subscribe()
    }

    pub fn publish(
        &self,
        application: &str,
        instance_path: &InstancePath,
        previous: InstanceStatus,
        current: InstanceStatus,
    ) {
        if previous == current {
            return;
        }
        let change = StatusChange {
            application: application.to_string(),
            instance_path: instance_path.clone(),
            previous,
            current,
            at: Utc::now(),
        };
        if self.sender.send(change).is_err() {
            debug!(instance = %instance_path, "No status observers");
        }
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new(STATUS_CHANNEL_CAPACITY)
    }
}
