//! Target handler interface and registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use dm_model::InstancePath;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Target property naming the handler type.
pub const HANDLER_KEY: &str = "handler";

/// Errors raised by target handlers or while resolving them.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The target properties do not name a handler.
    #[error("target properties do not name a handler")]
    MissingHandlerType,

    /// No handler of the requested type is registered.
    #[error("no target handler registered for type '{0}'")]
    HandlerNotFound(String),

    /// No target properties are assigned to the instance.
    #[error("no target properties assigned to {0}")]
    NoTargetAssigned(InstancePath),

    /// The handler failed to create or reserve a machine.
    #[error("machine acquisition failed: {0}")]
    Acquisition(String),

    /// The handler failed to release a machine.
    #[error("failed to release machine {machine_id}: {reason}")]
    Release { machine_id: String, reason: String },

    /// The acquisition was superseded by an undeploy while in flight.
    #[error("acquisition for {0} was cancelled by a concurrent undeploy")]
    Cancelled(InstancePath),
}

impl TargetError {
    /// True for errors meaning "the target is not configured".
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TargetError::MissingHandlerType
                | TargetError::HandlerNotFound(_)
                | TargetError::NoTargetAssigned(_)
        )
    }
}

/// Free-form properties describing where and how to provision a machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetProperties(BTreeMap<String, String>);

impl TargetProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties selecting the given handler type.
    pub fn for_handler(handler_type: &str) -> Self {
        Self::new().with(HANDLER_KEY, handler_type)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn handler_type(&self) -> Option<&str> {
        self.get(HANDLER_KEY)
    }
}

/// Target properties of an application: a default plus per-instance overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetAssignments {
    #[serde(default)]
    pub default: Option<TargetProperties>,
    #[serde(default)]
    pub per_instance: BTreeMap<InstancePath, TargetProperties>,
}

impl TargetAssignments {
    pub fn properties_for(&self, path: &InstancePath) -> Option<&TargetProperties> {
        self.per_instance.get(path).or(self.default.as_ref())
    }
}

/// What a handler needs to provision a machine.
#[derive(Debug, Clone)]
pub struct MachineRequest {
    pub application_name: String,
    pub scoped_instance_path: InstancePath,
    pub properties: TargetProperties,
}

/// Provisioning backend interface.
#[async_trait]
pub trait TargetHandler: Send + Sync {
    /// Handler type, matched against the `handler` target property.
    fn handler_type(&self) -> &str;

    /// Create or reserve a machine. Returns its identifier.
    async fn acquire(&self, request: &MachineRequest) -> Result<String, TargetError>;

    /// Destroy or give back a machine.
    async fn release(
        &self,
        machine_id: &str,
        properties: &TargetProperties,
    ) -> Result<(), TargetError>;

    /// Whether a previously acquired machine still exists.
    async fn is_machine_running(
        &self,
        _machine_id: &str,
        _properties: &TargetProperties,
    ) -> Result<bool, TargetError> {
        Ok(true)
    }
}

/// Registry of the target handlers currently available.
#[derive(Default)]
pub struct TargetHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TargetHandler>>>,
}

impl TargetHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any handler of the same type.
    pub fn register(&self, handler: Arc<dyn TargetHandler>) {
        let handler_type = handler.handler_type().to_string();
        info!(handler_type = %handler_type, "Target handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handler_type, handler);
    }

    pub fn unregister(&self, handler_type: &str) -> Option<Arc<dyn TargetHandler>> {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handler_type);
        if removed.is_some() {
            info!(handler_type = %handler_type, "Target handler unregistered");
        }
        removed
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn TargetHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handler_type)
            .cloned()
    }

    /// Resolve the handler selected by some target properties.
    pub fn find_handler(
        &self,
        properties: &TargetProperties,
    ) -> Result<Arc<dyn TargetHandler>, TargetError> {
        let handler_type = properties
            .handler_type()
            .ok_or(TargetError::MissingHandlerType)?;
        self.get(handler_type)
            .ok_or_else(|| TargetError::HandlerNotFound(handler_type.to_string()))
    }

    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
