//! Resource bundles shipped to agents.
//!
//! Configuration files for a component live under
//! `<application dir>/graph/<component>/`; probe definitions under
//! `<application dir>/probes/<component>.measures`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dm_messages::FileBundle;
use dm_model::{Instance, InstanceStatus};

/// Extension of probe definition files.
pub const PROBE_FILE_EXTENSION: &str = "measures";

/// Builds the files an agent needs for an instance.
pub trait ResourceBundler: Send + Sync {
    /// Files needed to bring `instance` to `target`.
    ///
    /// `None` when the target state needs no configuration.
    fn configuration_bundle(
        &self,
        application_dir: &Path,
        instance: &Instance,
        target: InstanceStatus,
    ) -> io::Result<Option<FileBundle>>;

    /// Probe definitions for the component of a scoped instance, if any.
    fn probe_bundle(
        &self,
        application_dir: &Path,
        instance: &Instance,
    ) -> io::Result<Option<FileBundle>>;
}

/// Reads bundles from the application directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryBundler;

impl DirectoryBundler {
    fn component_dir(application_dir: &Path, component: &str) -> PathBuf {
        application_dir.join("graph").join(component)
    }
}

impl ResourceBundler for DirectoryBundler {
    fn configuration_bundle(
        &self,
        application_dir: &Path,
        instance: &Instance,
        target: InstanceStatus,
    ) -> io::Result<Option<FileBundle>> {
        if !target.requires_resources() {
            return Ok(None);
        }

        let root = Self::component_dir(application_dir, &instance.component.name);
        let mut bundle = FileBundle::new();
        if root.is_dir() {
            collect_files(&root, &root, &mut bundle)?;
        }
        Ok(Some(bundle))
    }

    fn probe_bundle(
        &self,
        application_dir: &Path,
        instance: &Instance,
    ) -> io::Result<Option<FileBundle>> {
        let file_name = format!("{}.{PROBE_FILE_EXTENSION}", instance.component.name);
        let path = application_dir.join("probes").join(&file_name);

        match fs::read(&path) {
            Ok(content) => Ok(Some(FileBundle::from([(file_name, content)]))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Reads every file below `dir`, keyed by its `/`-separated path from `root`.
fn collect_files(root: &Path, dir: &Path, bundle: &mut FileBundle) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, bundle)?;
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        bundle.insert(key, fs::read(&path)?);
    }

    Ok(())
}
