//! Deployment Manager Library
//!
//! The deployment manager (DM) tracks a tree of instances per application,
//! provisions the machines backing scoped instances, and drives every
//! instance through its lifecycle by talking to the agents running on those
//! machines over a pluggable message bus.
//!
//! ## Architecture
//!
//! ```text
//! Manager
//! ├── ReconfigurableClient   (active messaging backend, hot-swappable)
//! ├── TargetHandlerRegistry  (provisioning backends)
//! ├── Orchestrator           (lifecycle state machine, bulk algorithms)
//! │   ├── TargetCoordinator  (single-flight machine acquisition/release)
//! │   └── AwaitingMessageStore (per scoped instance, on each application)
//! ├── HealthMonitor          (heartbeat bookkeeping)
//! └── MessageProcessor       (inbound agent notifications)
//! ```
//!
//! ## Modules
//!
//! - `application`: managed applications and their instance trees
//! - `awaiting`: queues of commands waiting for an agent to come up
//! - `lifecycle`: the orchestrator
//! - `messaging`: messaging clients, factories and the reconfigurable gateway
//! - `monitor`: heartbeat monitoring
//! - `state`: SQLite persistence of instance trees
//! - `targets`: target handlers and the acquisition coordinator

pub mod application;
pub mod awaiting;
pub mod bundle;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod messaging;
pub mod monitor;
pub mod processor;
pub mod resolver;
pub mod state;
pub mod status;
pub mod targets;

// Re-export commonly used types
pub use application::ManagedApplication;
pub use error::{BulkError, ErrorKind, ManagerError};
pub use lifecycle::Orchestrator;
pub use manager::{Manager, ManagerOptions};
pub use monitor::HealthMonitor;
pub use status::StatusChange;
