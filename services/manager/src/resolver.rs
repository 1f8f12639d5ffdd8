//! Resolution of instance variables against the component graph.

use std::collections::BTreeMap;

use dm_model::{Graph, ImportSpec, Instance};

/// Computes the variables an instance exports and imports.
pub trait ModelResolver: Send + Sync {
    /// Exported variables with a value, keyed `<component>.<variable>`.
    fn exported_variables(&self, graph: &Graph, instance: &Instance) -> BTreeMap<String, String>;

    /// Imports declared by the instance's component, keyed by variable.
    fn imported_variables(&self, graph: &Graph, instance: &Instance)
        -> BTreeMap<String, ImportSpec>;
}

/// Component defaults overlaid with the instance's overridden exports.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultModelResolver;

impl ModelResolver for DefaultModelResolver {
    fn exported_variables(&self, graph: &Graph, instance: &Instance) -> BTreeMap<String, String> {
        let component = &instance.component.name;
        let mut exports: BTreeMap<String, String> = graph
            .exported_variables(component)
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect();

        for (variable, value) in &instance.overridden_exports {
            let key = if variable.contains('.') {
                variable.clone()
            } else {
                format!("{component}.{variable}")
            };
            exports.insert(key, value.clone());
        }

        // An exported "ip" without a value is the address of the machine.
        if let Some(ip) = instance.ip_address() {
            let key = format!("{component}.ip");
            if graph.exported_variables(component).contains_key(&key) {
                exports.entry(key).or_insert_with(|| ip.to_string());
            }
        }

        exports
    }

    fn imported_variables(
        &self,
        graph: &Graph,
        instance: &Instance,
    ) -> BTreeMap<String, ImportSpec> {
        graph.imported_variables(&instance.component.name)
    }
}
