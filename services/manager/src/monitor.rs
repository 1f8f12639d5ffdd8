//! Heartbeat-based health monitoring.
//!
//! Each tick counts one missed heartbeat for every scoped instance in a
//! steady state or restored after a restart. Past the threshold the
//! instance is flagged `PROBLEM`; the next heartbeat from its agent clears
//! the count and brings it back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dm_messages::{Heartbeat, MachineDown};
use dm_model::{
    data_keys, find_instance, find_instance_mut, scoped_instances, Instance, InstancePath,
    InstanceStatus,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::ManagedApplication;
use crate::error::{ErrorKind, ManagerResult};
use crate::lifecycle::Orchestrator;
use crate::manager::Manager;

/// Missed ticks tolerated before a scoped instance is flagged.
pub const DEFAULT_HEARTBEAT_THRESHOLD: u32 = 2;

/// Tracks agent liveness and feeds status changes back to the orchestrator.
pub struct HealthMonitor {
    orchestrator: Arc<Orchestrator>,
    threshold: u32,
}

impl HealthMonitor {
    pub fn new(orchestrator: Arc<Orchestrator>, threshold: u32) -> Self {
        Self {
            orchestrator,
            threshold,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Run one monitor tick over `app`. Returns the instances flagged
    /// `PROBLEM` by this tick.
    pub fn check(&self, app: &ManagedApplication) -> Vec<InstancePath> {
        let scopes: Vec<(InstancePath, InstanceStatus)> = app.read(|roots| {
            scoped_instances(roots)
                .into_iter()
                .filter_map(|scope| find_instance(roots, &scope).map(|i| (scope, i.status)))
                .collect()
        });

        let mut flagged = Vec::new();
        for (scope, status) in scopes {
            if !status.is_monitored() {
                // Deploying, undeploying, ... are never failures.
                app.reset_missed_heartbeats(&scope);
                continue;
            }

            let missed = app.increment_missed_heartbeats(&scope);
            debug!(
                application = %app.name(),
                instance = %scope,
                missed,
                "Heartbeat missed"
            );
            if missed <= self.threshold || status == InstanceStatus::Problem {
                continue;
            }

            // An undeploy may have finished since the snapshot above.
            let still_monitored = |i: &Instance| {
                i.status.is_monitored() && i.status != InstanceStatus::Problem
            };
            if self
                .orchestrator
                .set_status_if(app, &scope, still_monitored, InstanceStatus::Problem)
                .is_some()
            {
                warn!(
                    application = %app.name(),
                    instance = %scope,
                    missed,
                    threshold = self.threshold,
                    "Agent stopped sending heartbeats"
                );
                flagged.push(scope);
            }
        }

        if !flagged.is_empty() {
            self.orchestrator.persist(app);
        }
        flagged
    }

    /// Record a heartbeat: clears the missed count and lifts `PROBLEM`.
    pub fn acknowledge_heartbeat(&self, app: &ManagedApplication, scope: &InstancePath) {
        app.reset_missed_heartbeats(scope);

        let recovered = app.write(|roots| {
            let instance = find_instance_mut(roots, scope)?;
            let recoverable =
                instance.status == InstanceStatus::Problem && instance.machine_id().is_some();
            recoverable.then(|| {
                instance.status = InstanceStatus::DeployedStarted;
            })
        });
        if recovered.is_some() {
            info!(application = %app.name(), instance = %scope, "Agent is back");
            self.orchestrator.notifier().publish(
                app.name(),
                scope,
                InstanceStatus::Problem,
                InstanceStatus::DeployedStarted,
            );
            self.orchestrator.persist(app);
        }
    }

    /// Handle a heartbeat notification from an agent.
    ///
    /// Heartbeats naming an unknown or non-scoped instance are ignored, as
    /// are stale ones from scopes that are not deployed.
    pub async fn on_heartbeat_notification(
        &self,
        app: &ManagedApplication,
        heartbeat: &Heartbeat,
    ) -> ManagerResult<()> {
        let scope = &heartbeat.scoped_instance_path;
        let Some(instance) = app.instance(scope) else {
            debug!(application = %app.name(), instance = %scope, "Heartbeat for unknown instance");
            return Ok(());
        };
        if !instance.is_target() {
            debug!(
                application = %app.name(),
                instance = %scope,
                "Heartbeat for a non-scoped instance, ignoring"
            );
            return Ok(());
        }
        if matches!(
            instance.status,
            InstanceStatus::NotDeployed | InstanceStatus::Undeploying
        ) {
            debug!(
                application = %app.name(),
                instance = %scope,
                status = %instance.status,
                "Stale heartbeat, ignoring"
            );
            return Ok(());
        }

        if let Some(ip) = &heartbeat.ip_address {
            app.write(|roots| match find_instance_mut(roots, scope) {
                Some(instance) if instance.machine_id().is_some() => {
                    instance
                        .data
                        .insert(data_keys::IP_ADDRESS.to_string(), ip.clone());
                }
                _ => {}
            });
        }

        self.acknowledge_heartbeat(app, scope);
        if heartbeat.model_required {
            info!(application = %app.name(), instance = %scope, "Agent requested its model");
        }
        self.orchestrator
            .flush_awaiting(app, scope, heartbeat.model_required)
            .await
    }

    /// Handle an agent reporting that its machine is gone.
    ///
    /// The scope goes through the regular undeploy path so a later deploy
    /// starts from a clean instance.
    pub async fn on_machine_down(
        &self,
        app: &ManagedApplication,
        notification: &MachineDown,
    ) -> ManagerResult<()> {
        let scope = &notification.scoped_instance_path;
        let Some(instance) = app.instance(scope) else {
            debug!(application = %app.name(), instance = %scope, "Machine down for unknown instance");
            return Ok(());
        };
        if !instance.is_target() {
            debug!(application = %app.name(), instance = %scope, "Machine down for non-scoped instance");
            return Ok(());
        }

        warn!(
            application = %app.name(),
            instance = %scope,
            machine_id = instance.machine_id().unwrap_or("-"),
            "Machine reported down"
        );
        app.reset_missed_heartbeats(scope);

        match self.orchestrator.undeploy_scope_tree(app, scope).await {
            // The machine is already gone; failing to release it is expected.
            Err(e) if e.kind() == ErrorKind::Provisioning => {
                debug!(application = %app.name(), instance = %scope, error = %e, "Release of vanished machine failed");
                Ok(())
            }
            other => other,
        }
    }
}

/// Run the monitor loop until shutdown.
pub async fn run_monitor_loop(
    manager: Arc<Manager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        interval_secs = interval.as_secs(),
        threshold = manager.monitor().threshold(),
        "Starting health monitor"
    );

    let mut interval_timer = tokio::time::interval(interval);
    // The first tick completes immediately; agents get a full period.
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let flagged = manager.check_heartbeats();
                if !flagged.is_empty() {
                    warn!(count = flagged.len(), "Scoped instances flagged as PROBLEM");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Health monitor shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}
