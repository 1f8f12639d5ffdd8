//! # dm-messages
//!
//! Messages exchanged between the deployment manager (DM) and the agents
//! running on provisioned machines.
//!
//! ## Design Principles
//!
//! - Messages are immutable once built; they are cloned, never edited
//! - Commands flow DM → agent, notifications flow agent → DM
//! - The wire encoding belongs to the messaging backend; [`MessageEnvelope`]
//!   and the JSON codec are provided for backends that need one
//!
//! ## Message Kinds
//!
//! Commands: set-identity, change-state, add-instance, remove-instance,
//! remove-import, resynchronize, update-probe-configuration.
//!
//! Notifications: heartbeat, machine-down, instance-changed,
//! instance-removed.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::MessageError;
pub use types::*;
