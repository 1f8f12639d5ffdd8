//! Instances and their runtime data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ComponentRef, InstancePath, InstanceStatus};

/// Keys of the runtime facts stored in [`Instance::data`].
pub mod data_keys {
    pub const IP_ADDRESS: &str = "ip.address";
    pub const MACHINE_ID: &str = "machine.id";
    pub const APPLICATION_NAME: &str = "application.name";
    pub const RUNNING_FROM: &str = "running.from";
    pub const TARGET_ACQUIRED: &str = "target.acquired";
    pub const TARGET_HANDLER: &str = "target.handler";
}

/// Variables received from another instance's exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub instance_path: InstancePath,
    pub component_name: String,
    #[serde(default)]
    pub exported_variables: BTreeMap<String, String>,
}

/// A node of the instance tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub component: ComponentRef,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Instance>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overridden_exports: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub imports: BTreeMap<String, Vec<Import>>,
}

impl Instance {
    pub fn new(name: impl Into<String>, component: ComponentRef) -> Self {
        Self {
            name: name.into(),
            component,
            status: InstanceStatus::NotDeployed,
            children: Vec::new(),
            overridden_exports: BTreeMap::new(),
            data: BTreeMap::new(),
            imports: BTreeMap::new(),
        }
    }

    pub fn with_child(mut self, child: Instance) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_export(mut self, variable: &str, value: &str) -> Self {
        self.overridden_exports
            .insert(variable.to_string(), value.to_string());
        self
    }

    /// True if this instance owns a machine.
    pub fn is_target(&self) -> bool {
        self.component.is_target()
    }

    pub fn data_value(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn machine_id(&self) -> Option<&str> {
        self.data_value(data_keys::MACHINE_ID)
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.data_value(data_keys::IP_ADDRESS)
    }

    pub fn child(&self, name: &str) -> Option<&Instance> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Instance> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// This instance and all its descendants in pre-order, with their paths.
    ///
    /// `path` is the path of `self`.
    pub fn walk<'a>(&'a self, path: &InstancePath) -> Vec<(InstancePath, &'a Instance)> {
        let mut out = Vec::new();
        let mut stack = vec![(path.clone(), self)];

        while let Some((current_path, instance)) = stack.pop() {
            // Children pushed in reverse so the first child is visited first.
            for child in instance.children.iter().rev() {
                if let Ok(child_path) = current_path.child(&child.name) {
                    stack.push((child_path, child));
                }
            }
            out.push((current_path, instance));
        }

        out
    }

    /// Applies `f` to this instance and every descendant.
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Instance)) {
        f(self);
        for child in &mut self.children {
            child.for_each_mut(f);
        }
    }

    /// True if every instance of the subtree is `NOT_DEPLOYED`.
    pub fn is_fully_undeployed(&self) -> bool {
        self.status == InstanceStatus::NotDeployed
            && self.children.iter().all(Instance::is_fully_undeployed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Instance {
        Instance::new("vm", ComponentRef::new("vm", "target"))
            .with_child(
                Instance::new("tomcat", ComponentRef::new("tomcat", "puppet"))
                    .with_child(Instance::new("app1", ComponentRef::new("war", "script")))
                    .with_child(Instance::new("app2", ComponentRef::new("war", "script"))),
            )
            .with_child(Instance::new("mysql", ComponentRef::new("mysql", "puppet")))
    }

    #[test]
    fn test_walk_is_preorder() {
        let root = tree();
        let path = InstancePath::root("vm").unwrap();
        let paths: Vec<String> = root
            .walk(&path)
            .into_iter()
            .map(|(p, _)| p.to_string())
            .collect();

        assert_eq!(
            paths,
            vec![
                "/vm",
                "/vm/tomcat",
                "/vm/tomcat/app1",
                "/vm/tomcat/app2",
                "/vm/mysql"
            ]
        );
    }

    #[test]
    fn test_fully_undeployed() {
        let mut root = tree();
        assert!(root.is_fully_undeployed());

        root.child_mut("tomcat").unwrap().status = InstanceStatus::DeployedStarted;
        assert!(!root.is_fully_undeployed());
        assert!(root.child("mysql").unwrap().is_fully_undeployed());
    }

    #[test]
    fn test_for_each_mut_reaches_every_node() {
        let mut root = tree();
        let mut count = 0;
        root.for_each_mut(&mut |i| {
            i.status = InstanceStatus::DeployedStarted;
            count += 1;
        });
        assert_eq!(count, 5);
        assert_eq!(
            root.child("tomcat").unwrap().child("app2").unwrap().status,
            InstanceStatus::DeployedStarted
        );
    }

    #[test]
    fn test_serialization_skips_empty_collections() {
        let instance = Instance::new("vm", ComponentRef::new("vm", "target"));
        let json = serde_json::to_string(&instance).unwrap();
        assert!(!json.contains("children"));
        assert!(!json.contains("data"));

        let parsed: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, instance);
    }
}
