//! Shared fixtures: a manager wired to the in-memory bus and the mock
//! target handler, managing a small two-machine application.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use dm_manager::messaging::{InMemoryBus, InMemoryClientFactory, IN_MEMORY_TYPE};
use dm_manager::targets::{MockTargetHandler, TargetProperties, MOCK_HANDLER_TYPE};
use dm_manager::{ManagedApplication, Manager, ManagerOptions};
use dm_messages::{Heartbeat, Message, Notification};
use dm_model::{Component, ComponentRef, Graph, Instance, InstancePath, InstanceStatus};

pub const APP: &str = "shop";

pub struct Harness {
    pub manager: Arc<Manager>,
    pub bus: Arc<InMemoryBus>,
    pub handler: Arc<MockTargetHandler>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(MockTargetHandler::new(), ManagerOptions::default()).await
    }

    pub async fn with(handler: MockTargetHandler, options: ManagerOptions) -> Self {
        Self::sharing(Arc::new(handler), options).await
    }

    /// A manager using an existing mock handler, e.g. after a restart.
    pub async fn sharing(handler: Arc<MockTargetHandler>, options: ManagerOptions) -> Self {
        let manager = Arc::new(Manager::new(options));
        let bus = Arc::new(InMemoryBus::new());

        manager
            .register_messaging_factory(Arc::new(InMemoryClientFactory::new(bus.clone())))
            .await
            .unwrap();
        manager
            .switch_messaging_backend(IN_MEMORY_TYPE)
            .await
            .unwrap();
        manager.register_target_handler(handler.clone());

        Self {
            manager,
            bus,
            handler,
        }
    }

    pub fn add_shop(&self) -> Arc<ManagedApplication> {
        self.manager.add_application(shop()).unwrap()
    }

    pub fn status(&self, p: &str) -> InstanceStatus {
        self.manager
            .application(APP)
            .unwrap()
            .status(&path(p))
            .unwrap()
    }

    pub fn instance(&self, p: &str) -> Instance {
        self.manager
            .application(APP)
            .unwrap()
            .instance(&path(p))
            .unwrap()
    }

    /// Kinds of the commands sent to the agent of `scope`, oldest first.
    pub fn sent_kinds(&self, scope: &str) -> Vec<&'static str> {
        self.bus
            .sent_to(APP, &path(scope))
            .iter()
            .map(Message::kind)
            .collect()
    }

    pub fn awaiting(&self, scope: &str) -> usize {
        self.manager
            .application(APP)
            .unwrap()
            .awaiting()
            .count_for(&path(scope))
    }

    pub async fn heartbeat(&self, scope: &str, model_required: bool) {
        self.manager
            .handle_notification(Notification::Heartbeat(Heartbeat {
                application_name: APP.to_string(),
                scoped_instance_path: path(scope),
                ip_address: Some("192.168.1.10".to_string()),
                model_required,
            }))
            .await
            .unwrap();
    }

    /// Deploy a scoped instance and let its agent call in.
    pub async fn bring_up(&self, scope: &str) {
        self.manager
            .change_instance_state(APP, &path(scope), InstanceStatus::DeployedStarted)
            .await
            .unwrap();
        self.heartbeat(scope, true).await;
        assert_eq!(self.status(scope), InstanceStatus::DeployedStarted);
    }
}

pub fn path(s: &str) -> InstancePath {
    InstancePath::parse(s).unwrap()
}

pub fn graph() -> Graph {
    Graph::new()
        .with(Component::new("vm", "target"))
        .with(
            Component::new("tomcat", "puppet")
                .with_export("port", Some("8080"))
                .with_export("ip", None),
        )
        .with(Component::new("war", "script").with_import("mysql.port", false))
        .with(Component::new("mysql", "puppet").with_export("port", Some("3306")))
}

/// `/vm/tomcat/war` and `/db/mysql`, both machines on the mock handler.
pub fn shop() -> ManagedApplication {
    shop_in("/nonexistent/shop")
}

/// The same application, reading its resources from `directory`.
pub fn shop_in(directory: impl Into<PathBuf>) -> ManagedApplication {
    let vm = Instance::new("vm", ComponentRef::new("vm", "target")).with_child(
        Instance::new("tomcat", ComponentRef::new("tomcat", "puppet"))
            .with_child(Instance::new("war", ComponentRef::new("war", "script"))),
    );
    let db = Instance::new("db", ComponentRef::new("vm", "target"))
        .with_child(Instance::new("mysql", ComponentRef::new("mysql", "puppet")));

    ManagedApplication::new(APP, directory, graph())
        .with_instances(vec![vm, db])
        .with_default_target(TargetProperties::for_handler(MOCK_HANDLER_TYPE))
}
