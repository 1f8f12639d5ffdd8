//! Navigation and editing helpers over a forest of root instances.

use crate::{Instance, InstancePath, ModelError};

/// Finds the instance at `path`.
pub fn find_instance<'a>(roots: &'a [Instance], path: &InstancePath) -> Option<&'a Instance> {
    let mut segments = path.segments();
    let first = segments.next()?;
    let mut current = roots.iter().find(|r| r.name == first)?;
    for name in segments {
        current = current.child(name)?;
    }
    Some(current)
}

/// Finds the instance at `path` for mutation.
pub fn find_instance_mut<'a>(
    roots: &'a mut [Instance],
    path: &InstancePath,
) -> Option<&'a mut Instance> {
    let mut segments = path.segments();
    let first = segments.next()?;
    let mut current = roots.iter_mut().find(|r| r.name == first)?;
    for name in segments {
        current = current.child_mut(name)?;
    }
    Some(current)
}

/// Path of the nearest scoped instance at or above `path`.
///
/// Walks up the parents until a target instance is found. When none is, the
/// tree root is returned. `None` means `path` does not exist.
pub fn find_scoped_ancestor(roots: &[Instance], path: &InstancePath) -> Option<InstancePath> {
    find_instance(roots, path)?;

    let mut current = Some(path.clone());
    while let Some(candidate) = current {
        let instance = find_instance(roots, &candidate)?;
        if instance.is_target() || candidate.is_root() {
            return Some(candidate);
        }
        current = candidate.parent();
    }
    None
}

/// Every instance of the forest in pre-order, root by root.
pub fn all_instances(roots: &[Instance]) -> Vec<(InstancePath, &Instance)> {
    roots
        .iter()
        .filter_map(|root| InstancePath::root(&root.name).ok().map(|p| (p, root)))
        .flat_map(|(path, root)| root.walk(&path))
        .collect()
}

/// Paths of every scoped (target) instance in pre-order.
pub fn scoped_instances(roots: &[Instance]) -> Vec<InstancePath> {
    all_instances(roots)
        .into_iter()
        .filter(|(_, instance)| instance.is_target())
        .map(|(path, _)| path)
        .collect()
}

/// The subtree rooted at `path` in pre-order, or every instance when `path`
/// is `None`.
pub fn subtree(roots: &[Instance], path: Option<&InstancePath>) -> Vec<(InstancePath, Instance)> {
    match path {
        Some(path) => find_instance(roots, path)
            .map(|instance| {
                instance
                    .walk(path)
                    .into_iter()
                    .map(|(p, i)| (p, i.clone()))
                    .collect()
            })
            .unwrap_or_default(),
        None => all_instances(roots)
            .into_iter()
            .map(|(p, i)| (p, i.clone()))
            .collect(),
    }
}

/// Attaches `instance` under `parent` (or as a new root).
pub fn insert_instance(
    roots: &mut Vec<Instance>,
    parent: Option<&InstancePath>,
    instance: Instance,
) -> Result<InstancePath, ModelError> {
    match parent {
        None => {
            let path = InstancePath::root(&instance.name)?;
            if roots.iter().any(|r| r.name == instance.name) {
                return Err(ModelError::DuplicateName {
                    parent: "/".to_string(),
                    name: instance.name,
                });
            }
            roots.push(instance);
            Ok(path)
        }
        Some(parent_path) => {
            let path = parent_path.child(&instance.name)?;
            let parent = find_instance_mut(roots, parent_path)
                .ok_or_else(|| ModelError::InstanceNotFound(parent_path.to_string()))?;
            if parent.child(&instance.name).is_some() {
                return Err(ModelError::DuplicateName {
                    parent: parent_path.to_string(),
                    name: instance.name,
                });
            }
            parent.children.push(instance);
            Ok(path)
        }
    }
}

/// Detaches and returns the instance at `path`.
pub fn remove_instance(roots: &mut Vec<Instance>, path: &InstancePath) -> Option<Instance> {
    let siblings = match path.parent() {
        None => roots,
        Some(parent) => &mut find_instance_mut(roots, &parent)?.children,
    };
    let idx = siblings.iter().position(|i| i.name == path.name())?;
    Some(siblings.remove(idx))
}
