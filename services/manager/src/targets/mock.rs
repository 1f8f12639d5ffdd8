//! Mock target handler for testing and development.
//!
//! Machines are just identifiers kept in a set; nothing is provisioned.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::handler::{MachineRequest, TargetError, TargetHandler, TargetProperties};

/// Handler type of [`MockTargetHandler`].
pub const MOCK_HANDLER_TYPE: &str = "mock";

/// In-process target handler.
pub struct MockTargetHandler {
    handler_type: String,

    /// Counter for generating machine IDs.
    machine_counter: AtomicU64,

    acquisitions: AtomicU64,
    releases: AtomicU64,

    /// Whether acquisitions should fail.
    fail_acquisitions: AtomicBool,

    /// Simulated provisioning latency.
    delay: Duration,

    machines: Mutex<HashSet<String>>,
}

impl MockTargetHandler {
    /// Create a new mock handler of type `mock`.
    pub fn new() -> Self {
        Self::with_type(MOCK_HANDLER_TYPE)
    }

    /// Create a mock handler registered under another type.
    pub fn with_type(handler_type: &str) -> Self {
        Self {
            handler_type: handler_type.to_string(),
            machine_counter: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            fail_acquisitions: AtomicBool::new(false),
            delay: Duration::ZERO,
            machines: Mutex::new(HashSet::new()),
        }
    }

    /// Create a mock handler that fails all acquisitions.
    pub fn failing() -> Self {
        let handler = Self::new();
        handler.set_failing(true);
        handler
    }

    /// Make every acquisition take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_acquisitions.store(failing, Ordering::SeqCst);
    }

    /// Number of acquire calls, successful or not.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    /// Machines acquired and not yet released.
    pub fn live_machines(&self) -> Vec<String> {
        let mut machines: Vec<String> = self
            .machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        machines.sort();
        machines
    }

    /// Drop a machine as if it vanished on the provider side.
    pub fn forget_machine(&self, machine_id: &str) -> bool {
        self.machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(machine_id)
    }

    fn next_machine_id(&self) -> String {
        let counter = self.machine_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{:08x}", self.handler_type, counter)
    }
}

impl Default for MockTargetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetHandler for MockTargetHandler {
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    async fn acquire(&self, request: &MachineRequest) -> Result<String, TargetError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        info!(
            application = %request.application_name,
            instance = %request.scoped_instance_path,
            "[MOCK] Acquiring machine"
        );

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail_acquisitions.load(Ordering::SeqCst) {
            return Err(TargetError::Acquisition(
                "mock handler configured to fail".to_string(),
            ));
        }

        let machine_id = self.next_machine_id();
        self.machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(machine_id.clone());
        debug!(machine_id = %machine_id, "[MOCK] Machine acquired");

        Ok(machine_id)
    }

    async fn release(
        &self,
        machine_id: &str,
        _properties: &TargetProperties,
    ) -> Result<(), TargetError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        info!(machine_id = %machine_id, "[MOCK] Releasing machine");

        if !self
            .machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(machine_id)
        {
            return Err(TargetError::Release {
                machine_id: machine_id.to_string(),
                reason: "unknown machine".to_string(),
            });
        }

        Ok(())
    }

    async fn is_machine_running(
        &self,
        machine_id: &str,
        _properties: &TargetProperties,
    ) -> Result<bool, TargetError> {
        Ok(self
            .machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(machine_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_model::InstancePath;

    fn request() -> MachineRequest {
        MachineRequest {
            application_name: "app".to_string(),
            scoped_instance_path: InstancePath::parse("/vm").unwrap(),
            properties: TargetProperties::for_handler(MOCK_HANDLER_TYPE),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let handler = MockTargetHandler::new();
        let props = TargetProperties::for_handler(MOCK_HANDLER_TYPE);

        let machine_id = handler.acquire(&request()).await.unwrap();
        assert!(machine_id.starts_with("mock-"));
        assert!(handler.is_machine_running(&machine_id, &props).await.unwrap());

        handler.release(&machine_id, &props).await.unwrap();
        assert!(!handler.is_machine_running(&machine_id, &props).await.unwrap());
        assert_eq!(handler.acquisitions(), 1);
        assert_eq!(handler.releases(), 1);

        // Releasing twice reports the unknown machine.
        assert!(handler.release(&machine_id, &props).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_handler() {
        let handler = MockTargetHandler::failing();
        let result = handler.acquire(&request()).await;
        assert!(matches!(result, Err(TargetError::Acquisition(_))));
        assert_eq!(handler.acquisitions(), 1);
        assert!(handler.live_machines().is_empty());
    }
}
