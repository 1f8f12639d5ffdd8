//! Minimal component graph.
//!
//! Components describe what an instance is: which installer deploys it, the
//! variables it exports and the variables it imports from other components.
//! A component may extend another one and inherit its variables. The graph is
//! user-provided, so `extends` chains may contain cycles; every traversal
//! keeps a visited set.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Installer name of components that represent a provisioned machine.
pub const TARGET_INSTALLER: &str = "target";

/// Lightweight reference from an instance to its component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    pub installer: String,
}

impl ComponentRef {
    pub fn new(name: impl Into<String>, installer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installer: installer.into(),
        }
    }

    /// True if instances of this component own a machine.
    pub fn is_target(&self) -> bool {
        self.installer == TARGET_INSTALLER
    }
}

/// How a component imports variables exported by another component.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Fully-qualified variable name (`component.variable`).
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    /// Imported from another application.
    #[serde(default)]
    pub external: bool,
}

/// A component definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub installer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Exported variable name → default value.
    #[serde(default)]
    pub exported_variables: BTreeMap<String, Option<String>>,
    /// Imported variables keyed by fully-qualified name.
    #[serde(default)]
    pub imported_variables: BTreeMap<String, ImportSpec>,
}

impl Component {
    pub fn new(name: impl Into<String>, installer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installer: installer.into(),
            ..Default::default()
        }
    }

    pub fn with_export(mut self, variable: &str, default: Option<&str>) -> Self {
        self.exported_variables
            .insert(variable.to_string(), default.map(str::to_string));
        self
    }

    pub fn with_import(mut self, variable: &str, optional: bool) -> Self {
        self.imported_variables.insert(
            variable.to_string(),
            ImportSpec {
                name: variable.to_string(),
                optional,
                external: false,
            },
        );
        self
    }

    pub fn extending(mut self, parent: &str) -> Self {
        self.extends = Some(parent.to_string());
        self
    }

    pub fn to_ref(&self) -> ComponentRef {
        ComponentRef::new(self.name.clone(), self.installer.clone())
    }
}

/// The set of components of an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    components: HashMap<String, Component>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, component: Component) {
        self.components.insert(component.name.clone(), component);
    }

    pub fn with(mut self, component: Component) -> Self {
        self.insert(component);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// The component followed by everything it extends, nearest first.
    ///
    /// Stops at the first repeated component, so cyclic `extends` chains
    /// terminate.
    pub fn lineage(&self, name: &str) -> Vec<&Component> {
        let mut visited = HashSet::new();
        let mut lineage = Vec::new();
        let mut current = self.components.get(name);

        while let Some(component) = current {
            if !visited.insert(component.name.as_str()) {
                break;
            }
            lineage.push(component);
            current = component
                .extends
                .as_deref()
                .and_then(|parent| self.components.get(parent));
        }

        lineage
    }

    /// Exported variables of a component including inherited ones, keyed by
    /// `<component>.<variable>`. Variables declared closer to the component
    /// win over inherited defaults.
    pub fn exported_variables(&self, name: &str) -> BTreeMap<String, Option<String>> {
        let mut exports = BTreeMap::new();
        for component in self.lineage(name).into_iter().rev() {
            for (variable, default) in &component.exported_variables {
                exports.insert(format!("{name}.{}", short_name(variable)), default.clone());
            }
        }
        exports
    }

    /// Imported variables of a component including inherited ones.
    pub fn imported_variables(&self, name: &str) -> BTreeMap<String, ImportSpec> {
        let mut imports = BTreeMap::new();
        for component in self.lineage(name).into_iter().rev() {
            for (variable, spec) in &component.imported_variables {
                imports.insert(variable.clone(), spec.clone());
            }
        }
        imports
    }
}

fn short_name(variable: &str) -> &str {
    variable.rsplit('.').next().unwrap_or(variable)
}
