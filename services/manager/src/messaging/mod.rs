//! Messaging gateway.
//!
//! The orchestrator never talks to a message bus directly. It goes through a
//! [`ReconfigurableClient`], which holds whichever backend client is active
//! and falls back to a [`DismissClient`] when none can be built.
//!
//! - `client`: client and factory interfaces, the dismissed client
//! - `registry`: registry of client factories
//! - `reconfigurable`: the hot-swappable gateway
//! - `in_memory`: an in-process bus for tests and single-node setups

mod client;
mod in_memory;
mod reconfigurable;
mod registry;

pub use client::{
    DismissClient, InboundQueue, MessagingClient, MessagingClientFactory, MessagingConfiguration,
    MessagingError, DISMISSED_TYPE,
};
pub use in_memory::{InMemoryBus, InMemoryClient, InMemoryClientFactory, SentMessage, IN_MEMORY_TYPE};
pub use reconfigurable::ReconfigurableClient;
pub use registry::MessagingFactoryRegistry;
