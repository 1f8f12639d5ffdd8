//! Managed applications.
//!
//! A [`ManagedApplication`] owns the instance forest of one application plus
//! the per-scope bookkeeping the manager keeps alongside it: awaiting
//! messages, missed heartbeats, and target assignments.
//!
//! The tree sits behind a `std::sync::RwLock`. Accessors take closures so a
//! guard can never be held across an `.await`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use dm_model::{find_instance, find_scoped_ancestor, Graph, Instance, InstancePath, InstanceStatus};
use serde::{Deserialize, Serialize};

use crate::awaiting::AwaitingMessageStore;
use crate::targets::{TargetAssignments, TargetProperties};

/// Persistent description of an application, without its instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub name: String,
    pub directory: PathBuf,
    #[serde(default)]
    pub graph: Graph,
    #[serde(default)]
    pub targets: TargetAssignments,
}

/// One deployed application and its instance forest.
pub struct ManagedApplication {
    name: String,
    directory: PathBuf,
    graph: Graph,
    instances: RwLock<Vec<Instance>>,
    targets: RwLock<TargetAssignments>,
    awaiting: AwaitingMessageStore,
    missed_heartbeats: Mutex<HashMap<InstancePath, u32>>,
}

impl ManagedApplication {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, graph: Graph) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            graph,
            instances: RwLock::new(Vec::new()),
            targets: RwLock::new(TargetAssignments::default()),
            awaiting: AwaitingMessageStore::new(),
            missed_heartbeats: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild an application from its record and restored root instances.
    pub fn from_record(record: ApplicationRecord, roots: Vec<Instance>) -> Self {
        let app = Self::new(record.name, record.directory, record.graph);
        *app.targets.write().unwrap_or_else(PoisonError::into_inner) = record.targets;
        app.with_instances(roots)
    }

    pub fn with_instances(self, roots: Vec<Instance>) -> Self {
        *self.instances.write().unwrap_or_else(PoisonError::into_inner) = roots;
        self
    }

    pub fn with_default_target(self, properties: TargetProperties) -> Self {
        self.set_default_target(properties);
        self
    }

    pub fn record(&self) -> ApplicationRecord {
        ApplicationRecord {
            name: self.name.clone(),
            directory: self.directory.clone(),
            graph: self.graph.clone(),
            targets: self.targets.read().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn awaiting(&self) -> &AwaitingMessageStore {
        &self.awaiting
    }

    // =========================================================================
    // Instance tree
    // =========================================================================

    /// Run `f` with shared access to the root instances.
    pub fn read<R>(&self, f: impl FnOnce(&[Instance]) -> R) -> R {
        let roots = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        f(&roots)
    }

    /// Run `f` with exclusive access to the root instances.
    pub fn write<R>(&self, f: impl FnOnce(&mut Vec<Instance>) -> R) -> R {
        let mut roots = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut roots)
    }

    /// Consistent copy of the whole forest.
    pub fn snapshot(&self) -> Vec<Instance> {
        self.read(|roots| roots.to_vec())
    }

    pub fn instance(&self, path: &InstancePath) -> Option<Instance> {
        self.read(|roots| find_instance(roots, path).cloned())
    }

    pub fn status(&self, path: &InstancePath) -> Option<InstanceStatus> {
        self.read(|roots| find_instance(roots, path).map(|i| i.status))
    }

    pub fn scoped_ancestor(&self, path: &InstancePath) -> Option<InstancePath> {
        self.read(|roots| find_scoped_ancestor(roots, path))
    }

    /// True if every instance of the application is `NOT_DEPLOYED`.
    pub fn is_fully_undeployed(&self) -> bool {
        self.read(|roots| roots.iter().all(Instance::is_fully_undeployed))
    }

    // =========================================================================
    // Missed heartbeats
    // =========================================================================

    pub fn missed_heartbeats(&self, scope: &InstancePath) -> u32 {
        self.missed_heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .copied()
            .unwrap_or(0)
    }

    /// Count one more missed tick for `scope` and return the new count.
    pub fn increment_missed_heartbeats(&self, scope: &InstancePath) -> u32 {
        let mut missed = self
            .missed_heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = missed.entry(scope.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn reset_missed_heartbeats(&self, scope: &InstancePath) {
        self.missed_heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope);
    }

    // =========================================================================
    // Target assignments
    // =========================================================================

    pub fn set_default_target(&self, properties: TargetProperties) {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .default = Some(properties);
    }

    pub fn set_target(&self, scope: &InstancePath, properties: TargetProperties) {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .per_instance
            .insert(scope.clone(), properties);
    }

    /// Target properties that apply to `scope`, if any.
    pub fn target_properties(&self, scope: &InstancePath) -> Option<TargetProperties> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .properties_for(scope)
            .cloned()
    }
}

impl std::fmt::Debug for ManagedApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedApplication")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_model::ComponentRef;

    fn app() -> ManagedApplication {
        let vm = Instance::new("vm", ComponentRef::new("vm", "target"))
            .with_child(Instance::new("app", ComponentRef::new("war", "script")));
        ManagedApplication::new("shop", "/tmp/shop", Graph::new()).with_instances(vec![vm])
    }

    fn path(s: &str) -> InstancePath {
        InstancePath::parse(s).unwrap()
    }

    #[test]
    fn test_tree_accessors() {
        let app = app();
        assert_eq!(app.status(&path("/vm/app")), Some(InstanceStatus::NotDeployed));
        assert_eq!(app.scoped_ancestor(&path("/vm/app")), Some(path("/vm")));
        assert!(app.instance(&path("/vm/missing")).is_none());
        assert!(app.is_fully_undeployed());

        app.write(|roots| roots[0].status = InstanceStatus::Deploying);
        assert!(!app.is_fully_undeployed());
    }

    #[test]
    fn test_missed_heartbeats() {
        let app = app();
        let vm = path("/vm");
        assert_eq!(app.missed_heartbeats(&vm), 0);
        assert_eq!(app.increment_missed_heartbeats(&vm), 1);
        assert_eq!(app.increment_missed_heartbeats(&vm), 2);
        app.reset_missed_heartbeats(&vm);
        assert_eq!(app.missed_heartbeats(&vm), 0);
    }

    #[test]
    fn test_record_round_trip() {
        let app = app().with_default_target(TargetProperties::for_handler("mock"));
        app.set_target(&path("/vm"), TargetProperties::for_handler("ec2"));

        let record = app.record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ApplicationRecord = serde_json::from_str(&json).unwrap();
        let restored = ManagedApplication::from_record(parsed, app.snapshot());

        assert_eq!(restored.name(), "shop");
        assert_eq!(
            restored
                .target_properties(&path("/vm"))
                .and_then(|p| p.handler_type().map(str::to_string)),
            Some("ec2".to_string())
        );
        assert_eq!(restored.snapshot(), app.snapshot());
    }
}
