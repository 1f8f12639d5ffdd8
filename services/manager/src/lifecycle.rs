//! Lifecycle orchestration.
//!
//! The [`Orchestrator`] drives instances through their states. Scoped
//! (machine-owning) instances only go up as a whole or down as a whole:
//! bringing one up acquires a machine, tearing it down releases it. Every
//! other instance is driven by change-state commands sent to the agent of
//! its nearest scoped ancestor, directly when that agent is reachable or
//! through the awaiting-message store when it will be soon.
//!
//! No tree lock is ever held across an `.await`. Per-scope ordering comes
//! from the delivery lock of the awaiting-message store.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use chrono::Utc;
use dm_messages::{
    AddInstance, ChangeState, Command, Message, RemoveImport, RemoveInstance, SetIdentity,
    UpdateProbeConfiguration,
};
use dm_model::{
    data_keys, find_instance, find_instance_mut, insert_instance, remove_instance,
    scoped_instances, subtree, Import, Instance, InstancePath, InstanceStatus,
};
use tracing::{debug, error, info, warn};

use crate::application::ManagedApplication;
use crate::bundle::{DirectoryBundler, ResourceBundler};
use crate::error::{BulkError, ManagerError, ManagerResult};
use crate::messaging::{MessagingError, ReconfigurableClient};
use crate::resolver::{DefaultModelResolver, ModelResolver};
use crate::state::InstanceStore;
use crate::status::StatusNotifier;
use crate::targets::{TargetCoordinator, TargetError, TargetHandlerRegistry};

/// Runtime facts tied to a machine; they do not survive its release.
const MACHINE_DATA: [&str; 5] = [
    data_keys::MACHINE_ID,
    data_keys::IP_ADDRESS,
    data_keys::RUNNING_FROM,
    data_keys::TARGET_ACQUIRED,
    data_keys::TARGET_HANDLER,
];

/// Lifecycle state machine and bulk algorithms.
pub struct Orchestrator {
    messaging: Arc<ReconfigurableClient>,
    targets: TargetCoordinator,
    resolver: Arc<dyn ModelResolver>,
    bundler: Arc<dyn ResourceBundler>,
    store: Option<Arc<dyn InstanceStore>>,
    notifier: StatusNotifier,
}

impl Orchestrator {
    pub fn new(
        messaging: Arc<ReconfigurableClient>,
        handlers: Arc<TargetHandlerRegistry>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            messaging,
            targets: TargetCoordinator::new(handlers),
            resolver: Arc::new(DefaultModelResolver),
            bundler: Arc::new(DirectoryBundler),
            store: None,
            notifier,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ModelResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_bundler(mut self, bundler: Arc<dyn ResourceBundler>) -> Self {
        self.bundler = bundler;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn targets(&self) -> &TargetCoordinator {
        &self.targets
    }

    pub fn messaging(&self) -> &Arc<ReconfigurableClient> {
        &self.messaging
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    // =========================================================================
    // Single-instance requests
    // =========================================================================

    /// Move an instance towards `target`, scoped or not.
    pub async fn change_instance_state(
        &self,
        app: &ManagedApplication,
        path: &InstancePath,
        target: InstanceStatus,
    ) -> ManagerResult<()> {
        let instance = self.require(app, path)?;
        if instance.is_target() {
            self.request_scoped_state(app, path, target).await
        } else {
            self.request_child_state(app, path, target).await
        }
    }

    /// Bring a scoped instance's machine up (`DEPLOYED_STARTED`) or tear it
    /// down (`NOT_DEPLOYED`). Any other target is ignored.
    pub async fn request_scoped_state(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        target: InstanceStatus,
    ) -> ManagerResult<()> {
        let instance = self.require(app, scope)?;
        if !instance.is_target() {
            return Err(ManagerError::Unauthorized(format!(
                "{scope} is not a scoped instance"
            )));
        }

        match target {
            InstanceStatus::DeployedStarted => self.deploy_scoped(app, scope).await,
            InstanceStatus::NotDeployed => self.undeploy_scope_tree(app, scope).await,
            other => {
                debug!(
                    application = %app.name(),
                    instance = %scope,
                    target = %other,
                    "Scoped instances only deploy or undeploy, ignoring"
                );
                Ok(())
            }
        }
    }

    /// Send a change-state command for a non-scoped instance.
    pub async fn request_child_state(
        &self,
        app: &ManagedApplication,
        path: &InstancePath,
        target: InstanceStatus,
    ) -> ManagerResult<()> {
        let instance = self.require(app, path)?;
        if instance.is_target() {
            return Err(ManagerError::Unauthorized(format!(
                "{path} is a scoped instance"
            )));
        }

        if !matches!(
            target,
            InstanceStatus::DeployedStarted
                | InstanceStatus::DeployedStopped
                | InstanceStatus::NotDeployed
        ) {
            debug!(
                application = %app.name(),
                instance = %path,
                target = %target,
                "Transitional target state requested, ignoring"
            );
            return Ok(());
        }

        let scope = app
            .scoped_ancestor(path)
            .ok_or_else(|| ManagerError::instance_not_found(app.name(), path))?;
        let bundle = self
            .bundler
            .configuration_bundle(app.directory(), &instance, target)
            .map_err(|source| ManagerError::Resources {
                path: path.clone(),
                source,
            })?;

        let message = Command::ChangeState(ChangeState {
            instance_path: path.clone(),
            new_state: target,
            file_name_to_file_content: bundle,
        });
        self.deliver(app, &scope, message.into()).await
    }

    // =========================================================================
    // Bulk operations
    // =========================================================================

    /// Deploy and start the subtree at `start`, or every instance.
    pub async fn deploy_and_start_all(
        &self,
        app: &ManagedApplication,
        start: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let entries = self.traversal(app, start)?;
        let mut failures = BulkError::default();

        for (path, instance) in entries {
            let result = if instance.is_target() {
                self.deploy_scoped(app, &path).await
            } else {
                self.request_child_state(app, &path, InstanceStatus::DeployedStarted)
                    .await
            };
            if let Err(e) = result {
                warn!(application = %app.name(), instance = %path, error = %e, "Deploy failed");
                failures.push(path, e);
            }
        }

        failures.into_result()
    }

    /// Stop the subtree at `start`, or every instance. Machines stay up.
    pub async fn stop_all(
        &self,
        app: &ManagedApplication,
        start: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let mut failures = BulkError::default();

        for path in self.stop_roots(app, start)? {
            if let Err(e) = self
                .request_child_state(app, &path, InstanceStatus::DeployedStopped)
                .await
            {
                warn!(application = %app.name(), instance = %path, error = %e, "Stop failed");
                failures.push(path, e);
            }
        }

        failures.into_result()
    }

    /// Undeploy the subtree at `start`, or every instance, releasing the
    /// machines of the scoped instances it contains.
    pub async fn undeploy_all(
        &self,
        app: &ManagedApplication,
        start: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let mut failures = BulkError::default();

        for path in self.stop_roots(app, start)? {
            if let Err(e) = self
                .request_child_state(app, &path, InstanceStatus::NotDeployed)
                .await
            {
                warn!(application = %app.name(), instance = %path, error = %e, "Undeploy failed");
                failures.push(path, e);
            }
        }

        // Nested machines go before the machines hosting them.
        let scopes: Vec<InstancePath> = self
            .traversal(app, start)?
            .into_iter()
            .filter(|(_, instance)| instance.is_target())
            .map(|(path, _)| path)
            .rev()
            .collect();
        for scope in scopes {
            if let Err(e) = self.undeploy_scoped(app, &scope).await {
                warn!(application = %app.name(), instance = %scope, error = %e, "Undeploy failed");
                failures.push(scope, e);
            }
        }

        failures.into_result()
    }

    /// Ask every reachable agent of `app` to send its state again.
    pub async fn resynchronize(&self, app: &ManagedApplication) -> ManagerResult<()> {
        let reachable: Vec<InstancePath> = app.read(|roots| {
            scoped_instances(roots)
                .into_iter()
                .filter(|scope| {
                    find_instance(roots, scope)
                        .is_some_and(|i| i.status == InstanceStatus::DeployedStarted)
                })
                .collect()
        });

        let mut failures = BulkError::default();
        for scope in reachable {
            if let Err(e) = self
                .deliver(app, &scope, Command::Resynchronize.into())
                .await
            {
                failures.push(scope, e);
            }
        }

        info!(application = %app.name(), "Resynchronization requested");
        failures.into_result()
    }

    // =========================================================================
    // Tree edits
    // =========================================================================

    /// Attach a new instance under `parent`, or as a new root.
    ///
    /// The new subtree starts `NOT_DEPLOYED`. When it lands inside a machine,
    /// the agent is told through the usual delivery policy.
    pub async fn add_instance(
        &self,
        app: &ManagedApplication,
        parent: Option<&InstancePath>,
        mut instance: Instance,
    ) -> ManagerResult<InstancePath> {
        instance.for_each_mut(&mut |i| {
            i.status = InstanceStatus::NotDeployed;
            i.data.clear();
        });
        let is_target = instance.is_target();
        let message_body = instance.clone();

        let path = app.write(|roots| insert_instance(roots, parent, instance))?;
        info!(application = %app.name(), instance = %path, "Instance added");
        self.persist(app);

        if let (Some(parent), false) = (parent, is_target) {
            if let Some(scope) = app.scoped_ancestor(parent) {
                let message = Command::AddInstance(AddInstance {
                    parent_path: parent.clone(),
                    instance: message_body,
                });
                self.deliver(app, &scope, message.into()).await?;
            }
        }

        Ok(path)
    }

    /// Detach an instance. Only allowed when its whole subtree is
    /// `NOT_DEPLOYED`.
    pub async fn remove_instance(
        &self,
        app: &ManagedApplication,
        path: &InstancePath,
    ) -> ManagerResult<()> {
        let scope = app
            .scoped_ancestor(path)
            .ok_or_else(|| ManagerError::instance_not_found(app.name(), path))?;

        let removed = app.write(|roots| {
            let instance = find_instance(roots, path)
                .ok_or_else(|| ManagerError::instance_not_found(app.name(), path))?;
            if !instance.is_fully_undeployed() {
                return Err(ManagerError::Unauthorized(format!(
                    "{path} cannot be removed while part of it is deployed"
                )));
            }
            remove_instance(roots, path)
                .ok_or_else(|| ManagerError::instance_not_found(app.name(), path))
        })?;

        for (removed_path, instance) in removed.walk(path) {
            if instance.is_target() {
                app.awaiting().forget(&removed_path);
                app.reset_missed_heartbeats(&removed_path);
            }
        }
        info!(application = %app.name(), instance = %path, "Instance removed");
        self.persist(app);

        if !removed.is_target() && &scope != path {
            let message = Command::RemoveInstance(RemoveInstance {
                instance_path: path.clone(),
            });
            self.deliver(app, &scope, message.into()).await?;
        }

        Ok(())
    }

    // =========================================================================
    // Agent reports
    // =========================================================================

    /// Record the status an agent reports for one of its instances.
    pub fn on_instance_changed(
        &self,
        app: &ManagedApplication,
        path: &InstancePath,
        status: InstanceStatus,
        imports: Option<BTreeMap<String, Vec<Import>>>,
    ) {
        let previous = app.write(|roots| {
            let instance = find_instance_mut(roots, path)?;
            // Machine states belong to the manager, not to agents.
            if instance.is_target() {
                return None;
            }
            if let Some(imports) = imports {
                instance.imports = imports;
            }
            Some(mem::replace(&mut instance.status, status))
        });

        match previous {
            Some(previous) => {
                self.publish(app, path, previous, status);
                self.persist(app);
            }
            None => debug!(
                application = %app.name(),
                instance = %path,
                "Ignoring status report for unknown or scoped instance"
            ),
        }
    }

    /// Drop an instance an agent reports as removed.
    pub fn on_instance_removed(&self, app: &ManagedApplication, path: &InstancePath) {
        let removed = app.write(|roots| {
            if find_instance(roots, path).is_some_and(|i| !i.is_target()) {
                remove_instance(roots, path)
            } else {
                None
            }
        });
        if removed.is_some() {
            info!(application = %app.name(), instance = %path, "Instance removed by agent");
            self.persist(app);
        }
    }

    // =========================================================================
    // Crate-internal entry points
    // =========================================================================

    /// Set the status of an instance and notify observers.
    ///
    /// Returns the previous status, or `None` if the instance is unknown.
    pub(crate) fn set_status(
        &self,
        app: &ManagedApplication,
        path: &InstancePath,
        status: InstanceStatus,
    ) -> Option<InstanceStatus> {
        let previous = app.write(|roots| {
            find_instance_mut(roots, path).map(|i| mem::replace(&mut i.status, status))
        })?;
        self.publish(app, path, previous, status);
        Some(previous)
    }

    /// Like [`Self::set_status`], but only when the current status still
    /// satisfies `expected`. The check and the write share one lock.
    pub(crate) fn set_status_if(
        &self,
        app: &ManagedApplication,
        path: &InstancePath,
        expected: impl FnOnce(&Instance) -> bool,
        status: InstanceStatus,
    ) -> Option<InstanceStatus> {
        let previous = app.write(|roots| {
            let instance = find_instance_mut(roots, path)?;
            if !expected(instance) {
                return None;
            }
            Some(mem::replace(&mut instance.status, status))
        })?;
        self.publish(app, path, previous, status);
        Some(previous)
    }

    /// Deliver queued messages to an agent that just showed up.
    ///
    /// With `model_required`, a fresh set-identity goes first and queued ones
    /// are skipped. A `DEPLOYING` or `RESTORING` scope whose queue drained is
    /// promoted to `DEPLOYED_STARTED`.
    pub(crate) async fn flush_awaiting(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        model_required: bool,
    ) -> ManagerResult<()> {
        let _delivery = app.awaiting().lock_delivery(scope).await;
        let instance = self.require(app, scope)?;
        if matches!(
            instance.status,
            InstanceStatus::NotDeployed | InstanceStatus::Undeploying
        ) {
            debug!(
                application = %app.name(),
                instance = %scope,
                status = %instance.status,
                "Scope is not deployed, nothing to flush"
            );
            return Ok(());
        }

        if model_required {
            let message = self.set_identity(app, scope, &instance);
            self.send(app, scope, &message).await?;
            self.send_probe_configuration(app, scope, &instance).await;
        }

        let sent = self
            .send_pending(app, scope, model_required)
            .await
            .map_err(|source| ManagerError::Transport {
                scope: scope.clone(),
                source,
            })?;
        if sent > 0 {
            info!(application = %app.name(), instance = %scope, sent, "Awaiting messages flushed");
        }

        let promoted = app.write(|roots| {
            let instance = find_instance_mut(roots, scope)?;
            if !matches!(
                instance.status,
                InstanceStatus::Deploying | InstanceStatus::Restoring
            ) {
                return None;
            }
            let previous = mem::replace(&mut instance.status, InstanceStatus::DeployedStarted);
            if previous == InstanceStatus::Deploying {
                instance
                    .data
                    .insert(data_keys::RUNNING_FROM.to_string(), Utc::now().to_rfc3339());
            }
            Some(previous)
        });
        if let Some(previous) = promoted {
            self.publish(app, scope, previous, InstanceStatus::DeployedStarted);
            self.persist(app);
        }

        Ok(())
    }

    /// Undeploy a scoped instance and every machine nested in it.
    pub(crate) async fn undeploy_scope_tree(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
    ) -> ManagerResult<()> {
        let scopes: Vec<InstancePath> = app.read(|roots| {
            find_instance(roots, scope)
                .map(|instance| {
                    instance
                        .walk(scope)
                        .into_iter()
                        .filter(|(_, i)| i.is_target())
                        .map(|(path, _)| path)
                        .rev()
                        .collect()
                })
                .unwrap_or_default()
        });

        let mut first_error = None;
        for nested in scopes {
            if let Err(e) = self.undeploy_scoped(app, &nested).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reconcile a freshly restored application with provisioning reality.
    ///
    /// Scoped instances whose machine still runs become `RESTORING` until
    /// their agent calls in; the others are reset to `NOT_DEPLOYED`.
    pub(crate) async fn reconcile_restored(&self, app: &ManagedApplication) {
        let scopes: Vec<(InstancePath, Instance)> = app.read(|roots| {
            scoped_instances(roots)
                .into_iter()
                .filter_map(|scope| find_instance(roots, &scope).cloned().map(|i| (scope, i)))
                .collect()
        });

        for (scope, instance) in scopes {
            let keep = match instance.machine_id() {
                Some(machine_id) => match self.targets.is_machine_running(app, &scope).await {
                    Ok(running) => {
                        if !running {
                            warn!(
                                application = %app.name(),
                                instance = %scope,
                                machine_id = %machine_id,
                                "Machine vanished while the manager was down"
                            );
                        }
                        running
                    }
                    Err(e) => {
                        warn!(
                            application = %app.name(),
                            instance = %scope,
                            error = %e,
                            "Cannot check machine, resetting instance"
                        );
                        false
                    }
                },
                None => false,
            };

            if keep {
                app.write(|roots| {
                    if let Some(i) = find_instance_mut(roots, &scope) {
                        i.status = InstanceStatus::Restoring;
                        i.data.remove(data_keys::TARGET_ACQUIRED);
                    }
                });
                info!(application = %app.name(), instance = %scope, "Instance restoring");
            } else if instance.status != InstanceStatus::NotDeployed
                || instance.machine_id().is_some()
            {
                app.write(|roots| {
                    if let Some(i) = find_instance_mut(roots, &scope) {
                        reset_machine(i);
                    }
                });
                info!(application = %app.name(), instance = %scope, "Instance reset");
            }
        }

        self.persist(app);
    }

    /// Save the instance forest of `app`, logging failures.
    pub(crate) fn persist(&self, app: &ManagedApplication) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_instances(app.name(), &app.snapshot()) {
            error!(application = %app.name(), error = %e, "Failed to save instances");
        }
    }

    // =========================================================================
    // Scoped transitions
    // =========================================================================

    async fn deploy_scoped(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
    ) -> ManagerResult<()> {
        let instance = self.require(app, scope)?;
        if instance.status != InstanceStatus::NotDeployed || instance.machine_id().is_some() {
            debug!(
                application = %app.name(),
                instance = %scope,
                status = %instance.status,
                "Scoped instance already deployed, ignoring"
            );
            return Ok(());
        }

        let (handler, properties) = self
            .targets
            .resolve(app, scope)
            .map_err(|e| target_failure(scope, e))?;

        let Some(guard) = self
            .targets
            .begin(app, scope, |i| self.set_identity(app, scope, i))
        else {
            debug!(
                application = %app.name(),
                instance = %scope,
                "Acquisition already in progress, ignoring"
            );
            return Ok(());
        };

        self.publish(
            app,
            scope,
            InstanceStatus::NotDeployed,
            InstanceStatus::Deploying,
        );
        self.persist(app);

        match self.targets.acquire(guard, handler, properties).await {
            Ok(_) => {
                self.persist(app);
                Ok(())
            }
            Err(TargetError::Cancelled(_)) => {
                debug!(application = %app.name(), instance = %scope, "Deploy superseded by undeploy");
                Ok(())
            }
            Err(e) => {
                error!(application = %app.name(), instance = %scope, error = %e, "Target acquisition failed");
                self.publish(
                    app,
                    scope,
                    InstanceStatus::Deploying,
                    InstanceStatus::NotDeployed,
                );
                self.persist(app);
                Err(target_failure(scope, e))
            }
        }
    }

    async fn undeploy_scoped(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
    ) -> ManagerResult<()> {
        let previous = {
            let _delivery = app.awaiting().lock_delivery(scope).await;
            app.write(|roots| {
                let instance = find_instance_mut(roots, scope)?;
                let idle = instance.status == InstanceStatus::NotDeployed
                    && instance.machine_id().is_none()
                    && instance.data_value(data_keys::TARGET_ACQUIRED).is_none();
                if idle || instance.status == InstanceStatus::Undeploying {
                    return None;
                }
                app.awaiting().drain_and_remove(scope);
                Some(mem::replace(
                    &mut instance.status,
                    InstanceStatus::Undeploying,
                ))
            })
        };
        let Some(previous) = previous else {
            debug!(application = %app.name(), instance = %scope, "Scoped instance not deployed, ignoring");
            return Ok(());
        };

        self.publish(app, scope, previous, InstanceStatus::Undeploying);
        info!(application = %app.name(), instance = %scope, "Undeploying scoped instance");

        let released = self.targets.release(app, scope).await;

        let changes = app.write(|roots| {
            let mut changes = Vec::new();
            if let Some(instance) = find_instance_mut(roots, scope) {
                for (path, i) in instance.walk(scope) {
                    changes.push((path, i.status, i.component.name.clone()));
                }
                reset_machine(instance);
            }
            for root in roots.iter_mut() {
                root.for_each_mut(&mut |i| {
                    for imports in i.imports.values_mut() {
                        imports.retain(|import| !import.instance_path.is_within(scope));
                    }
                    i.imports.retain(|_, imports| !imports.is_empty());
                });
            }
            app.awaiting().drain_and_remove(scope);
            changes
        });
        app.reset_missed_heartbeats(scope);

        for (path, status, _) in &changes {
            self.publish(app, path, *status, InstanceStatus::NotDeployed);
        }
        info!(application = %app.name(), instance = %scope, "Scoped instance undeployed");
        self.persist(app);

        self.broadcast_remove_imports(app, scope, &changes).await;

        released
            .map(|_| ())
            .map_err(|source| ManagerError::Provisioning {
                path: scope.clone(),
                source,
            })
    }

    /// Tell every other reachable agent that the exports of an undeployed
    /// subtree are gone.
    async fn broadcast_remove_imports(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        removed: &[(InstancePath, InstanceStatus, String)],
    ) {
        let peers: Vec<InstancePath> = app.read(|roots| {
            scoped_instances(roots)
                .into_iter()
                .filter(|peer| !peer.is_within(scope) && !scope.is_within(peer))
                .filter(|peer| {
                    find_instance(roots, peer)
                        .is_some_and(|i| i.status == InstanceStatus::DeployedStarted)
                })
                .collect()
        });

        for peer in &peers {
            for (path, _, component) in removed {
                let message = Command::RemoveImport(RemoveImport {
                    application_name: app.name().to_string(),
                    component_or_facet_name: component.clone(),
                    removed_instance_path: path.clone(),
                });
                if let Err(e) = self.deliver(app, peer, message.into()).await {
                    warn!(
                        application = %app.name(),
                        instance = %peer,
                        removed = %path,
                        error = %e,
                        "Failed to notify peer of removed exports"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Deliver a message for `scope` according to its status.
    ///
    /// Reachable scopes get it now; scopes about to become reachable get it
    /// queued; anything else drops it.
    pub(crate) async fn deliver(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        message: Message,
    ) -> ManagerResult<()> {
        let _delivery = app.awaiting().lock_delivery(scope).await;
        let status = app
            .status(scope)
            .ok_or_else(|| ManagerError::instance_not_found(app.name(), scope))?;

        match status {
            InstanceStatus::DeployedStarted => {
                if app.awaiting().count_for(scope) == 0 {
                    return self.send(app, scope, &message).await;
                }
                // Older messages are still waiting; keep them first.
                app.awaiting().store(scope, message);
                self.send_pending(app, scope, false)
                    .await
                    .map(|_| ())
                    .map_err(|source| ManagerError::Transport {
                        scope: scope.clone(),
                        source,
                    })
            }
            InstanceStatus::Deploying | InstanceStatus::Restoring | InstanceStatus::Problem => {
                debug!(
                    application = %app.name(),
                    scope = %scope,
                    kind = message.kind(),
                    status = %status,
                    "Agent not reachable yet, message queued"
                );
                app.awaiting().store(scope, message);
                Ok(())
            }
            _ => {
                debug!(
                    application = %app.name(),
                    scope = %scope,
                    kind = message.kind(),
                    status = %status,
                    "No agent to deliver to, message dropped"
                );
                Ok(())
            }
        }
    }

    async fn send(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        message: &Message,
    ) -> ManagerResult<()> {
        match self.messaging.send_to_agent(app.name(), scope, message).await {
            Ok(()) => {
                debug!(application = %app.name(), scope = %scope, kind = message.kind(), "Message sent");
                Ok(())
            }
            Err(source) => {
                warn!(
                    application = %app.name(),
                    scope = %scope,
                    kind = message.kind(),
                    error = %source,
                    "Message delivery failed"
                );
                Err(ManagerError::Transport {
                    scope: scope.clone(),
                    source,
                })
            }
        }
    }

    /// Send the queue of `scope` in order. On failure the unsent messages go
    /// back to the head of the queue.
    async fn send_pending(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        skip_set_identity: bool,
    ) -> Result<usize, MessagingError> {
        let mut pending = app.awaiting().drain_and_remove(scope).into_iter();
        let mut sent = 0;

        while let Some(message) = pending.next() {
            let is_set_identity = message.as_command().is_some_and(Command::is_set_identity);
            if skip_set_identity && is_set_identity {
                continue;
            }

            if let Err(e) = self.messaging.send_to_agent(app.name(), scope, &message).await {
                warn!(
                    application = %app.name(),
                    scope = %scope,
                    kind = message.kind(),
                    error = %e,
                    "Flush interrupted, requeueing"
                );
                let mut rest = vec![message];
                rest.extend(pending);
                app.awaiting().requeue_front(scope, rest);
                return Err(e);
            }
            sent += 1;

            if is_set_identity {
                if let Some(instance) = app.instance(scope) {
                    self.send_probe_configuration(app, scope, &instance).await;
                }
            }
        }

        Ok(sent)
    }

    async fn send_probe_configuration(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        instance: &Instance,
    ) {
        let probes = match self.bundler.probe_bundle(app.directory(), instance) {
            Ok(Some(probes)) => probes,
            Ok(None) => return,
            Err(e) => {
                warn!(application = %app.name(), instance = %scope, error = %e, "Cannot read probe files");
                return;
            }
        };

        let message: Message = Command::UpdateProbeConfiguration(UpdateProbeConfiguration {
            instance_path: scope.clone(),
            probe_resources: probes,
        })
        .into();
        // Probes are best effort; the agent runs without them.
        if let Err(e) = self.send(app, scope, &message).await {
            debug!(application = %app.name(), instance = %scope, error = %e, "Probe configuration not sent");
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn set_identity(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
        instance: &Instance,
    ) -> Message {
        let exported_variables = instance
            .walk(scope)
            .into_iter()
            .map(|(path, i)| (path, self.resolver.exported_variables(app.graph(), i)))
            .collect();

        Command::SetIdentity(SetIdentity {
            application_name: app.name().to_string(),
            scoped_instance: instance.clone(),
            exported_variables,
        })
        .into()
    }

    fn publish(
        &self,
        app: &ManagedApplication,
        path: &InstancePath,
        previous: InstanceStatus,
        current: InstanceStatus,
    ) {
        if previous == current {
            return;
        }
        info!(
            application = %app.name(),
            instance = %path,
            from = %previous,
            to = %current,
            "Instance status changed"
        );
        self.notifier.publish(app.name(), path, previous, current);
    }

    fn require(&self, app: &ManagedApplication, path: &InstancePath) -> ManagerResult<Instance> {
        app.instance(path)
            .ok_or_else(|| ManagerError::instance_not_found(app.name(), path))
    }

    /// Pre-order listing of the subtree at `start`, or of every instance.
    fn traversal(
        &self,
        app: &ManagedApplication,
        start: Option<&InstancePath>,
    ) -> ManagerResult<Vec<(InstancePath, Instance)>> {
        if let Some(path) = start {
            self.require(app, path)?;
        }
        Ok(app.read(|roots| subtree(roots, start)))
    }

    /// Instances that receive stop/undeploy commands in a bulk operation:
    /// non-scoped instances sitting right under a machine, tree roots, and
    /// the start instance itself. Agents handle the rest of each subtree.
    fn stop_roots(
        &self,
        app: &ManagedApplication,
        start: Option<&InstancePath>,
    ) -> ManagerResult<Vec<InstancePath>> {
        let entries = self.traversal(app, start)?;
        let targets: Vec<InstancePath> = entries
            .iter()
            .filter(|(_, i)| i.is_target())
            .map(|(path, _)| path.clone())
            .collect();

        Ok(entries
            .into_iter()
            .filter(|(_, instance)| !instance.is_target())
            .filter(|(path, _)| {
                Some(path) == start
                    || match path.parent() {
                        None => true,
                        Some(parent) => targets.contains(&parent),
                    }
            })
            .map(|(path, _)| path)
            .collect())
    }
}

/// Put a scoped instance back to a machine-less `NOT_DEPLOYED` subtree.
fn reset_machine(instance: &mut Instance) {
    instance.for_each_mut(&mut |i| {
        i.status = InstanceStatus::NotDeployed;
        if i.is_target() {
            for key in MACHINE_DATA {
                i.data.remove(key);
            }
        }
    });
}

fn target_failure(path: &InstancePath, error: TargetError) -> ManagerError {
    if error.is_configuration() {
        ManagerError::Configuration(format!("{path}: {error}"))
    } else {
        ManagerError::Provisioning {
            path: path.clone(),
            source: error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InMemoryBus, InMemoryClientFactory, IN_MEMORY_TYPE};
    use crate::targets::{MockTargetHandler, TargetProperties};
    use dm_model::{ComponentRef, Graph};
    use tokio::sync::mpsc;

    fn path(s: &str) -> InstancePath {
        InstancePath::parse(s).unwrap()
    }

    fn app() -> ManagedApplication {
        let vm = Instance::new("vm", ComponentRef::new("vm", "target")).with_child(
            Instance::new("tomcat", ComponentRef::new("tomcat", "puppet"))
                .with_child(Instance::new("war", ComponentRef::new("war", "script"))),
        );
        ManagedApplication::new("shop", "/nonexistent/shop", Graph::new())
            .with_instances(vec![vm])
            .with_default_target(TargetProperties::for_handler("mock"))
    }

    async fn orchestrator() -> (Orchestrator, Arc<InMemoryBus>, Arc<MockTargetHandler>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let messaging = Arc::new(ReconfigurableClient::new(tx));
        let bus = Arc::new(InMemoryBus::new());
        messaging
            .register_factory(Arc::new(InMemoryClientFactory::new(bus.clone())))
            .await
            .unwrap();
        messaging.switch_backend(IN_MEMORY_TYPE).await.unwrap();

        let handlers = Arc::new(TargetHandlerRegistry::new());
        let handler = Arc::new(MockTargetHandler::new());
        handlers.register(handler.clone());

        let orchestrator = Orchestrator::new(messaging, handlers, StatusNotifier::default());
        (orchestrator, bus, handler)
    }

    #[tokio::test]
    async fn test_stop_roots_skip_nested_children() {
        let (orchestrator, _, _) = orchestrator().await;
        let app = app();

        let roots = orchestrator.stop_roots(&app, None).unwrap();
        assert_eq!(roots, vec![path("/vm/tomcat")]);

        let roots = orchestrator
            .stop_roots(&app, Some(&path("/vm/tomcat/war")))
            .unwrap();
        assert_eq!(roots, vec![path("/vm/tomcat/war")]);
    }

    #[tokio::test]
    async fn test_child_request_dropped_when_scope_not_deployed() {
        let (orchestrator, bus, _) = orchestrator().await;
        let app = app();

        orchestrator
            .request_child_state(&app, &path("/vm/tomcat"), InstanceStatus::DeployedStarted)
            .await
            .unwrap();

        assert!(bus.sent().is_empty());
        assert_eq!(app.awaiting().count(), 0);
        assert_eq!(
            app.status(&path("/vm/tomcat")),
            Some(InstanceStatus::NotDeployed)
        );
    }

    #[tokio::test]
    async fn test_scoped_intermediate_states_are_ignored() {
        let (orchestrator, _, handler) = orchestrator().await;
        let app = app();

        for target in [InstanceStatus::Starting, InstanceStatus::DeployedStopped] {
            orchestrator
                .request_scoped_state(&app, &path("/vm"), target)
                .await
                .unwrap();
        }
        assert_eq!(handler.acquisitions(), 0);
        assert_eq!(app.status(&path("/vm")), Some(InstanceStatus::NotDeployed));
    }

    #[tokio::test]
    async fn test_scope_mismatch_is_unauthorized() {
        let (orchestrator, _, _) = orchestrator().await;
        let app = app();

        let err = orchestrator
            .request_scoped_state(&app, &path("/vm/tomcat"), InstanceStatus::DeployedStarted)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unauthorized);

        let err = orchestrator
            .request_child_state(&app, &path("/vm"), InstanceStatus::DeployedStarted)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_missing_handler_is_configuration_error_without_mutation() {
        let (orchestrator, _, _) = orchestrator().await;
        let app = app();
        app.set_default_target(TargetProperties::for_handler("ec2"));

        let err = orchestrator
            .request_scoped_state(&app, &path("/vm"), InstanceStatus::DeployedStarted)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        let vm = app.instance(&path("/vm")).unwrap();
        assert_eq!(vm.status, InstanceStatus::NotDeployed);
        assert!(vm.data.is_empty());
        assert_eq!(app.awaiting().count(), 0);
    }

    #[tokio::test]
    async fn test_direct_send_when_scope_started() {
        let (orchestrator, bus, _) = orchestrator().await;
        let app = app();
        let vm = path("/vm");

        orchestrator
            .request_scoped_state(&app, &vm, InstanceStatus::DeployedStarted)
            .await
            .unwrap();
        orchestrator.flush_awaiting(&app, &vm, false).await.unwrap();
        assert_eq!(app.status(&vm), Some(InstanceStatus::DeployedStarted));
        bus.clear();

        orchestrator
            .request_child_state(&app, &path("/vm/tomcat"), InstanceStatus::DeployedStopped)
            .await
            .unwrap();

        let sent = bus.sent_to("shop", &vm);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            Message::Command(Command::ChangeState(c))
                if c.new_state == InstanceStatus::DeployedStopped
                    && c.file_name_to_file_content.is_some()
        ));
    }

    #[tokio::test]
    async fn test_transport_error_keeps_status() {
        let (orchestrator, bus, _) = orchestrator().await;
        let app = app();
        let vm = path("/vm");

        orchestrator
            .request_scoped_state(&app, &vm, InstanceStatus::DeployedStarted)
            .await
            .unwrap();
        bus.set_fail_sends(true);

        let err = orchestrator.flush_awaiting(&app, &vm, false).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
        // Still deploying, the set-identity is back in the queue.
        assert_eq!(app.status(&vm), Some(InstanceStatus::Deploying));
        assert_eq!(app.awaiting().count_for(&vm), 1);

        bus.set_fail_sends(false);
        orchestrator.flush_awaiting(&app, &vm, false).await.unwrap();
        assert_eq!(app.status(&vm), Some(InstanceStatus::DeployedStarted));
        assert_eq!(app.awaiting().count_for(&vm), 0);
    }

    #[tokio::test]
    async fn test_instance_changed_ignores_scoped_instances() {
        let (orchestrator, _, _) = orchestrator().await;
        let app = app();

        orchestrator.on_instance_changed(&app, &path("/vm"), InstanceStatus::Problem, None);
        assert_eq!(app.status(&path("/vm")), Some(InstanceStatus::NotDeployed));

        orchestrator.on_instance_changed(
            &app,
            &path("/vm/tomcat"),
            InstanceStatus::DeployedStarted,
            None,
        );
        assert_eq!(
            app.status(&path("/vm/tomcat")),
            Some(InstanceStatus::DeployedStarted)
        );

        orchestrator.on_instance_removed(&app, &path("/vm/tomcat/war"));
        assert!(app.instance(&path("/vm/tomcat/war")).is_none());
    }
}
