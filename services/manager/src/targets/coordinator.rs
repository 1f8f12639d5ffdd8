//! Single-flight acquisition and idempotent release of targets.
//!
//! Acquisition is claimed by writing a unique token under
//! `target.acquired` in the scoped instance's data, inside the same tree
//! write lock that checks the instance is free. Only the caller holding the
//! token may record a machine for that instance. The claim is an
//! [`AcquisitionGuard`]: dropping it without committing puts the instance
//! back to `NOT_DEPLOYED`, so errors, cancellations and panics all clean up.

use std::sync::Arc;

use dm_messages::Message;
use dm_model::{
    data_keys, find_instance, find_instance_mut, Instance, InstancePath, InstanceStatus,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handler::{
    MachineRequest, TargetError, TargetHandler, TargetHandlerRegistry, TargetProperties,
};
use crate::application::ManagedApplication;

/// Claim on the acquisition of one scoped instance's machine.
pub struct AcquisitionGuard<'a> {
    app: &'a ManagedApplication,
    scope: InstancePath,
    token: String,
    committed: bool,
}

impl AcquisitionGuard<'_> {
    pub fn scope(&self) -> &InstancePath {
        &self.scope
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for AcquisitionGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let reverted = self.app.write(|roots| {
            let Some(instance) = find_instance_mut(roots, &self.scope) else {
                return false;
            };
            // Someone else (an undeploy, or a newer claim) owns the instance now.
            if instance.data_value(data_keys::TARGET_ACQUIRED) != Some(self.token.as_str())
                || instance.machine_id().is_some()
            {
                return false;
            }
            instance.data.remove(data_keys::TARGET_ACQUIRED);
            instance.status = InstanceStatus::NotDeployed;
            // Drained under the tree lock so no request can queue in between.
            self.app.awaiting().drain_and_remove(&self.scope);
            true
        });

        if reverted {
            debug!(
                application = %self.app.name(),
                instance = %self.scope,
                "Acquisition claim reverted"
            );
        }
    }
}

/// Coordinates machine acquisition and release through the handler registry.
pub struct TargetCoordinator {
    handlers: Arc<TargetHandlerRegistry>,
}

impl TargetCoordinator {
    pub fn new(handlers: Arc<TargetHandlerRegistry>) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &Arc<TargetHandlerRegistry> {
        &self.handlers
    }

    /// Find the handler and properties that apply to `scope`.
    pub fn resolve(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
    ) -> Result<(Arc<dyn TargetHandler>, TargetProperties), TargetError> {
        let properties = app
            .target_properties(scope)
            .ok_or_else(|| TargetError::NoTargetAssigned(scope.clone()))?;
        let handler = self.handlers.find_handler(&properties)?;
        Ok((handler, properties))
    }

    /// Claim `scope` for acquisition.
    ///
    /// Succeeds only when the instance is `NOT_DEPLOYED`, has no machine and
    /// no claim. On success the instance is `DEPLOYING` and the message built
    /// by `set_identity` is the first one queued for it, all under one lock.
    /// Returns `None` when the instance is not free.
    pub fn begin<'a>(
        &self,
        app: &'a ManagedApplication,
        scope: &InstancePath,
        set_identity: impl FnOnce(&Instance) -> Message,
    ) -> Option<AcquisitionGuard<'a>> {
        let token = Uuid::new_v4().to_string();

        let claimed = app.write(|roots| {
            let Some(instance) = find_instance_mut(roots, scope) else {
                return false;
            };
            if instance.status != InstanceStatus::NotDeployed
                || instance.machine_id().is_some()
                || instance.data_value(data_keys::TARGET_ACQUIRED).is_some()
            {
                return false;
            }

            instance
                .data
                .insert(data_keys::TARGET_ACQUIRED.to_string(), token.clone());
            instance
                .data
                .insert(data_keys::APPLICATION_NAME.to_string(), app.name().to_string());
            instance.status = InstanceStatus::Deploying;

            let message = set_identity(instance);
            app.awaiting().store(scope, message);
            true
        });

        claimed.then(|| AcquisitionGuard {
            app,
            scope: scope.clone(),
            token,
            committed: false,
        })
    }

    /// Ask the handler for a machine and record it on the claimed instance.
    ///
    /// If the claim was revoked while the handler worked, the fresh machine
    /// is given back and [`TargetError::Cancelled`] is returned.
    pub async fn acquire(
        &self,
        guard: AcquisitionGuard<'_>,
        handler: Arc<dyn TargetHandler>,
        properties: TargetProperties,
    ) -> Result<String, TargetError> {
        let app = guard.app;
        let request = MachineRequest {
            application_name: app.name().to_string(),
            scoped_instance_path: guard.scope.clone(),
            properties,
        };

        info!(
            application = %request.application_name,
            instance = %request.scoped_instance_path,
            handler_type = %handler.handler_type(),
            "Acquiring target"
        );

        // The guard reverts the claim if this fails.
        let machine_id = handler.acquire(&request).await?;

        let recorded = app.write(|roots| {
            let Some(instance) = find_instance_mut(roots, &guard.scope) else {
                return false;
            };
            if instance.data_value(data_keys::TARGET_ACQUIRED) != Some(guard.token.as_str()) {
                return false;
            }
            instance
                .data
                .insert(data_keys::MACHINE_ID.to_string(), machine_id.clone());
            instance.data.insert(
                data_keys::TARGET_HANDLER.to_string(),
                handler.handler_type().to_string(),
            );
            true
        });

        if !recorded {
            warn!(
                application = %request.application_name,
                instance = %request.scoped_instance_path,
                machine_id = %machine_id,
                "Instance was undeployed during acquisition, releasing machine"
            );
            if let Err(e) = handler.release(&machine_id, &request.properties).await {
                warn!(machine_id = %machine_id, error = %e, "Failed to release orphan machine");
            }
            return Err(TargetError::Cancelled(request.scoped_instance_path));
        }

        info!(
            application = %request.application_name,
            instance = %request.scoped_instance_path,
            machine_id = %machine_id,
            "Target acquired"
        );
        guard.commit();
        Ok(machine_id)
    }

    /// Forget the machine of `scope` and ask its handler to release it.
    ///
    /// Machine data and the acquisition claim are cleared before the handler
    /// is called, whatever the outcome. Returns the released machine, if any.
    pub async fn release(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
    ) -> Result<Option<String>, TargetError> {
        let taken = app.write(|roots| {
            let instance = find_instance_mut(roots, scope)?;
            let machine_id = instance.data.remove(data_keys::MACHINE_ID);
            let handler_type = instance.data.remove(data_keys::TARGET_HANDLER);
            for key in [
                data_keys::IP_ADDRESS,
                data_keys::RUNNING_FROM,
                data_keys::TARGET_ACQUIRED,
            ] {
                instance.data.remove(key);
            }
            machine_id.map(|id| (id, handler_type))
        });

        let Some((machine_id, handler_type)) = taken else {
            return Ok(None);
        };

        let properties = app
            .target_properties(scope)
            .unwrap_or_else(|| match &handler_type {
                Some(t) => TargetProperties::for_handler(t),
                None => TargetProperties::new(),
            });
        let handler = match &handler_type {
            Some(t) => self
                .handlers
                .get(t)
                .ok_or_else(|| TargetError::HandlerNotFound(t.clone())),
            None => self.handlers.find_handler(&properties),
        };

        let result = match handler {
            Ok(handler) => handler.release(&machine_id, &properties).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    application = %app.name(),
                    instance = %scope,
                    machine_id = %machine_id,
                    "Target released"
                );
                Ok(Some(machine_id))
            }
            Err(e) => {
                warn!(
                    application = %app.name(),
                    instance = %scope,
                    machine_id = %machine_id,
                    error = %e,
                    "Target release failed"
                );
                Err(e)
            }
        }
    }

    /// Whether the machine recorded on `scope` still exists.
    ///
    /// `Ok(false)` when no machine is recorded.
    pub async fn is_machine_running(
        &self,
        app: &ManagedApplication,
        scope: &InstancePath,
    ) -> Result<bool, TargetError> {
        let recorded = app.read(|roots| {
            find_instance(roots, scope).and_then(|instance| {
                instance.machine_id().map(|id| {
                    (
                        id.to_string(),
                        instance.data_value(data_keys::TARGET_HANDLER).map(str::to_string),
                    )
                })
            })
        });
        let Some((machine_id, handler_type)) = recorded else {
            return Ok(false);
        };

        let properties = app.target_properties(scope).unwrap_or_default();
        let handler = match handler_type {
            Some(t) => self
                .handlers
                .get(&t)
                .ok_or(TargetError::HandlerNotFound(t))?,
            None => self.handlers.find_handler(&properties)?,
        };
        handler.is_machine_running(&machine_id, &properties).await
    }
}
