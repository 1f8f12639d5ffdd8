//! Durable state of the deployment manager.
//!
//! Applications and their instance trees are kept in SQLite so that the
//! manager can rebuild its view of every deployment after a restart.

mod store;

pub use store::{InstanceStore, RestoredInstances, SqliteInstanceStore, StoreError};
