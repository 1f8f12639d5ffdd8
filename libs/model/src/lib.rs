//! # dm-model
//!
//! In-memory data model for the deployment manager.
//!
//! ## Concepts
//!
//! - An [`Instance`] is a node in a rooted tree. Its identity is its
//!   [`InstancePath`], the slash-joined names from the root down to it.
//! - A **scoped instance** is an instance whose component is installed by the
//!   `target` installer: it owns a machine. Every other instance runs inside
//!   the machine of its nearest scoped ancestor.
//! - Runtime facts (IP address, machine id, ...) live in the free-form
//!   `data` map under the keys in [`data_keys`].
//!
//! The component graph is only modeled as far as the manager needs it:
//! exported and imported variables, and the `extends` chain.

mod error;
mod graph;
mod helpers;
mod instance;
mod path;
mod status;

pub use error::ModelError;
pub use graph::{Component, ComponentRef, Graph, ImportSpec, TARGET_INSTALLER};
pub use helpers::*;
pub use instance::{data_keys, Import, Instance};
pub use path::InstancePath;
pub use status::InstanceStatus;
