//! The deployment manager context.
//!
//! A [`Manager`] is built once at start-up and passed to everything that
//! needs it. It owns the application registry and wires the messaging
//! gateway, the target handlers, the orchestrator and the health monitor
//! together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dm_messages::{Message, Notification};
use dm_model::{Instance, InstancePath, InstanceStatus};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::application::ManagedApplication;
use crate::bundle::{DirectoryBundler, ResourceBundler};
use crate::config::Config;
use crate::error::{ManagerError, ManagerResult};
use crate::lifecycle::Orchestrator;
use crate::messaging::{MessagingClientFactory, ReconfigurableClient};
use crate::monitor::{HealthMonitor, DEFAULT_HEARTBEAT_THRESHOLD};
use crate::processor::MessageProcessor;
use crate::resolver::{DefaultModelResolver, ModelResolver};
use crate::state::InstanceStore;
use crate::status::{StatusChange, StatusNotifier, STATUS_CHANNEL_CAPACITY};
use crate::targets::{TargetHandler, TargetHandlerRegistry};

/// Collaborators and tunables of a [`Manager`].
#[derive(Clone)]
pub struct ManagerOptions {
    pub heartbeat_threshold: u32,
    pub resolver: Arc<dyn ModelResolver>,
    pub bundler: Arc<dyn ResourceBundler>,
    pub store: Option<Arc<dyn InstanceStore>>,
    pub status_capacity: usize,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_threshold: config.heartbeat_threshold,
            ..Self::default()
        }
    }

    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            heartbeat_threshold: DEFAULT_HEARTBEAT_THRESHOLD,
            resolver: Arc::new(DefaultModelResolver),
            bundler: Arc::new(DirectoryBundler),
            store: None,
            status_capacity: STATUS_CHANNEL_CAPACITY,
        }
    }
}

/// Deployment manager context.
pub struct Manager {
    applications: RwLock<HashMap<String, Arc<ManagedApplication>>>,
    messaging: Arc<ReconfigurableClient>,
    handlers: Arc<TargetHandlerRegistry>,
    orchestrator: Arc<Orchestrator>,
    monitor: HealthMonitor,
    store: Option<Arc<dyn InstanceStore>>,
    notifier: StatusNotifier,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl Manager {
    pub fn new(options: ManagerOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let messaging = Arc::new(ReconfigurableClient::new(inbound_tx));
        let handlers = Arc::new(TargetHandlerRegistry::new());
        let notifier = StatusNotifier::new(options.status_capacity);

        let mut orchestrator =
            Orchestrator::new(messaging.clone(), handlers.clone(), notifier.clone())
                .with_resolver(options.resolver)
                .with_bundler(options.bundler);
        if let Some(store) = &options.store {
            orchestrator = orchestrator.with_store(store.clone());
        }
        let orchestrator = Arc::new(orchestrator);
        let monitor = HealthMonitor::new(orchestrator.clone(), options.heartbeat_threshold);

        Self {
            applications: RwLock::new(HashMap::new()),
            messaging,
            handlers,
            orchestrator,
            monitor,
            store: options.store,
            notifier,
            inbound: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn messaging(&self) -> &Arc<ReconfigurableClient> {
        &self.messaging
    }

    pub fn handlers(&self) -> &Arc<TargetHandlerRegistry> {
        &self.handlers
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Receive every status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.notifier.subscribe()
    }

    /// Take the processor of the inbound queue. Only the first call gets it.
    pub fn take_processor(self: &Arc<Self>) -> Option<MessageProcessor> {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(MessageProcessor::new(self.clone(), inbound))
    }

    // =========================================================================
    // Applications
    // =========================================================================

    /// Start managing an application.
    pub fn add_application(
        &self,
        application: ManagedApplication,
    ) -> ManagerResult<Arc<ManagedApplication>> {
        let application = Arc::new(application);
        {
            let mut applications = self
                .applications
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if applications.contains_key(application.name()) {
                return Err(ManagerError::Unauthorized(format!(
                    "application {} already exists",
                    application.name()
                )));
            }
            applications.insert(application.name().to_string(), application.clone());
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save_application(&application.record()) {
                self.applications
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(application.name());
                return Err(e.into());
            }
        }
        self.orchestrator.persist(&application);
        info!(application = %application.name(), "Application added");
        Ok(application)
    }

    pub fn application(&self, name: &str) -> ManagerResult<Arc<ManagedApplication>> {
        self.applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::ApplicationNotFound(name.to_string()))
    }

    pub fn applications(&self) -> Vec<Arc<ManagedApplication>> {
        let mut applications: Vec<Arc<ManagedApplication>> = self
            .applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        applications.sort_by(|a, b| a.name().cmp(b.name()));
        applications
    }

    /// Stop managing an application. Refused while any instance is deployed.
    pub fn remove_application(&self, name: &str) -> ManagerResult<()> {
        {
            let mut applications = self
                .applications
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let application = applications
                .get(name)
                .ok_or_else(|| ManagerError::ApplicationNotFound(name.to_string()))?;
            if !application.is_fully_undeployed() {
                return Err(ManagerError::Unauthorized(format!(
                    "application {name} still has deployed instances"
                )));
            }
            applications.remove(name);
        }

        if let Some(store) = &self.store {
            store.delete_application(name)?;
        }
        info!(application = %name, "Application removed");
        Ok(())
    }

    /// Save the record of an application after its targets changed.
    pub fn save_application(&self, name: &str) -> ManagerResult<()> {
        let application = self.application(name)?;
        if let Some(store) = &self.store {
            store.save_application(&application.record())?;
        }
        Ok(())
    }

    /// Reload every stored application and reconcile it with its machines.
    ///
    /// Returns the number of applications restored.
    pub async fn restore_applications(&self) -> ManagerResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut restored = 0;
        for record in store.applications()? {
            let name = record.name.clone();
            if self.application(&name).is_ok() {
                continue;
            }

            let instances = store.restore_instances(&name)?;
            for (root, reason) in &instances.load_errors {
                error!(application = %name, root = %root, reason = %reason, "Failed to load instance");
            }

            let application = Arc::new(ManagedApplication::from_record(record, instances.roots));
            self.orchestrator.reconcile_restored(&application).await;
            self.applications
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), application);

            info!(application = %name, "Application restored");
            restored += 1;
        }

        Ok(restored)
    }

    // =========================================================================
    // Messaging and targets
    // =========================================================================

    /// Switch to another messaging backend, then ask every agent to
    /// resynchronize.
    pub async fn switch_messaging_backend(&self, messaging_type: &str) -> ManagerResult<()> {
        self.messaging
            .switch_backend(messaging_type)
            .await
            .map_err(|e| ManagerError::Configuration(e.to_string()))?;

        if self.messaging.is_dismissed() {
            return Ok(());
        }
        for application in self.applications() {
            if let Err(e) = self.orchestrator.resynchronize(&application).await {
                warn!(application = %application.name(), error = %e, "Resynchronization failed");
            }
        }
        Ok(())
    }

    pub async fn register_messaging_factory(
        &self,
        factory: Arc<dyn MessagingClientFactory>,
    ) -> ManagerResult<()> {
        self.messaging
            .register_factory(factory)
            .await
            .map_err(|e| ManagerError::Configuration(e.to_string()))
    }

    pub async fn deregister_messaging_factory(&self, messaging_type: &str) {
        self.messaging.deregister_factory(messaging_type).await;
    }

    pub fn register_target_handler(&self, handler: Arc<dyn TargetHandler>) {
        self.handlers.register(handler);
    }

    pub fn unregister_target_handler(&self, handler_type: &str) {
        self.handlers.unregister(handler_type);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn change_instance_state(
        &self,
        application: &str,
        path: &InstancePath,
        target: InstanceStatus,
    ) -> ManagerResult<()> {
        let app = self.application(application)?;
        self.orchestrator
            .change_instance_state(&app, path, target)
            .await
    }

    pub async fn deploy_and_start_all(
        &self,
        application: &str,
        start: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let app = self.application(application)?;
        self.orchestrator.deploy_and_start_all(&app, start).await
    }

    pub async fn stop_all(
        &self,
        application: &str,
        start: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let app = self.application(application)?;
        self.orchestrator.stop_all(&app, start).await
    }

    pub async fn undeploy_all(
        &self,
        application: &str,
        start: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let app = self.application(application)?;
        self.orchestrator.undeploy_all(&app, start).await
    }

    pub async fn add_instance(
        &self,
        application: &str,
        parent: Option<&InstancePath>,
        instance: Instance,
    ) -> ManagerResult<InstancePath> {
        let app = self.application(application)?;
        self.orchestrator.add_instance(&app, parent, instance).await
    }

    pub async fn remove_instance(&self, application: &str, path: &InstancePath) -> ManagerResult<()> {
        let app = self.application(application)?;
        self.orchestrator.remove_instance(&app, path).await
    }

    pub async fn resynchronize(&self, application: &str) -> ManagerResult<()> {
        let app = self.application(application)?;
        self.orchestrator.resynchronize(&app).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Run one monitor tick over every application.
    pub fn check_heartbeats(&self) -> Vec<(String, InstancePath)> {
        self.applications()
            .into_iter()
            .flat_map(|app| {
                self.monitor
                    .check(&app)
                    .into_iter()
                    .map(move |path| (app.name().to_string(), path))
            })
            .collect()
    }

    pub fn acknowledge_heartbeat(&self, application: &str, scope: &InstancePath) -> ManagerResult<()> {
        let app = self.application(application)?;
        self.monitor.acknowledge_heartbeat(&app, scope);
        Ok(())
    }

    /// Dispatch a notification received from an agent.
    pub async fn handle_notification(&self, notification: Notification) -> ManagerResult<()> {
        let app = self.application(notification.application_name())?;
        match notification {
            Notification::Heartbeat(heartbeat) => {
                self.monitor
                    .on_heartbeat_notification(&app, &heartbeat)
                    .await
            }
            Notification::MachineDown(machine_down) => {
                self.monitor.on_machine_down(&app, &machine_down).await
            }
            Notification::InstanceChanged(changed) => {
                self.orchestrator.on_instance_changed(
                    &app,
                    &changed.instance_path,
                    changed.new_status,
                    changed.imports,
                );
                Ok(())
            }
            Notification::InstanceRemoved(removed) => {
                self.orchestrator
                    .on_instance_removed(&app, &removed.instance_path);
                Ok(())
            }
        }
    }

    /// Dismiss the messaging client.
    pub async fn shutdown(&self) {
        self.messaging.close().await;
        info!("Deployment manager stopped");
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}
