//! Provisioning of the machines backing scoped instances.
//!
//! - `handler`: the [`TargetHandler`] interface and its registry
//! - `coordinator`: single-flight acquisition and idempotent release
//! - `mock`: an in-process handler for tests and development

mod coordinator;
mod handler;
mod mock;

pub use coordinator::{AcquisitionGuard, TargetCoordinator};
pub use handler::{
    MachineRequest, TargetAssignments, TargetError, TargetHandler, TargetHandlerRegistry,
    TargetProperties, HANDLER_KEY,
};
pub use mock::{MockTargetHandler, MOCK_HANDLER_TYPE};
