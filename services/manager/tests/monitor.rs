//! Integration tests for health monitoring and restart recovery.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{path, Harness, APP};
use dm_manager::state::SqliteInstanceStore;
use dm_manager::targets::MockTargetHandler;
use dm_manager::ManagerOptions;
use dm_messages::{Heartbeat, MachineDown, Notification};
use dm_model::InstanceStatus;
use tempfile::tempdir;

async fn machine_down(h: &Harness, scope: &str) {
    h.manager
        .handle_notification(Notification::MachineDown(MachineDown {
            application_name: APP.to_string(),
            scoped_instance_path: path(scope),
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_silent_agent_becomes_problem_and_recovers() {
    let h = Harness::new().await;
    h.add_shop();
    h.bring_up("/vm").await;
    let mut changes = h.manager.subscribe();

    let threshold = h.manager.monitor().threshold();
    for _ in 0..threshold {
        assert!(h.manager.check_heartbeats().is_empty());
    }
    assert_eq!(
        h.manager.check_heartbeats(),
        vec![(APP.to_string(), path("/vm"))]
    );
    assert_eq!(h.status("/vm"), InstanceStatus::Problem);

    let change = changes.try_recv().unwrap();
    assert_eq!(change.instance_path, path("/vm"));
    assert_eq!(change.current, InstanceStatus::Problem);

    h.heartbeat("/vm", false).await;
    assert_eq!(h.status("/vm"), InstanceStatus::DeployedStarted);
    assert!(h.manager.check_heartbeats().is_empty());
}

#[tokio::test]
async fn test_requests_wait_while_agent_is_silent() {
    let h = Harness::new().await;
    h.add_shop();
    h.bring_up("/vm").await;

    for _ in 0..=h.manager.monitor().threshold() {
        h.manager.check_heartbeats();
    }
    assert_eq!(h.status("/vm"), InstanceStatus::Problem);

    h.manager
        .change_instance_state(APP, &path("/vm/tomcat"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();
    assert_eq!(h.awaiting("/vm"), 1);
    assert_eq!(h.sent_kinds("/vm"), vec!["set_identity"]);

    h.heartbeat("/vm", false).await;
    assert_eq!(h.awaiting("/vm"), 0);
    assert_eq!(h.sent_kinds("/vm"), vec!["set_identity", "change_state"]);
}

#[tokio::test]
async fn test_deploying_machine_is_never_flagged() {
    let h = Harness::new().await;
    h.add_shop();
    h.manager
        .change_instance_state(APP, &path("/vm"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();

    for _ in 0..10 {
        assert!(h.manager.check_heartbeats().is_empty());
    }
    assert_eq!(h.status("/vm"), InstanceStatus::Deploying);
}

#[tokio::test]
async fn test_lower_threshold_flags_sooner() {
    let options = ManagerOptions {
        heartbeat_threshold: 0,
        ..ManagerOptions::default()
    };
    let h = Harness::with(MockTargetHandler::new(), options).await;
    h.add_shop();
    h.bring_up("/db").await;

    assert_eq!(
        h.manager.check_heartbeats(),
        vec![(APP.to_string(), path("/db"))]
    );
}

#[tokio::test]
async fn test_machine_down_undeploys_scope() {
    let h = Harness::new().await;
    h.add_shop();
    h.bring_up("/vm").await;

    machine_down(&h, "/vm").await;

    let vm = h.instance("/vm");
    assert_eq!(vm.status, InstanceStatus::NotDeployed);
    assert!(vm.machine_id().is_none());
    assert!(vm.ip_address().is_none());
    assert_eq!(h.status("/vm/tomcat"), InstanceStatus::NotDeployed);
    assert_eq!(h.handler.releases(), 1);

    h.bring_up("/vm").await;
    assert_eq!(h.handler.acquisitions(), 2);
}

#[tokio::test]
async fn test_machine_down_for_vanished_machine() {
    let h = Harness::new().await;
    h.add_shop();
    h.bring_up("/vm").await;

    let machine_id = h.instance("/vm").machine_id().unwrap().to_string();
    assert!(h.handler.forget_machine(&machine_id));

    // The failed release does not surface.
    machine_down(&h, "/vm").await;
    assert_eq!(h.status("/vm"), InstanceStatus::NotDeployed);

    // Stale heartbeats from the old agent change nothing.
    h.heartbeat("/vm", true).await;
    assert_eq!(h.status("/vm"), InstanceStatus::NotDeployed);
    assert!(h.instance("/vm").ip_address().is_none());
}

#[tokio::test]
async fn test_model_request_from_child_is_ignored() {
    let h = Harness::new().await;
    h.add_shop();
    h.manager
        .change_instance_state(APP, &path("/vm"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();

    h.manager
        .handle_notification(Notification::Heartbeat(Heartbeat {
            application_name: APP.to_string(),
            scoped_instance_path: path("/vm/tomcat"),
            ip_address: None,
            model_required: true,
        }))
        .await
        .unwrap();

    assert_eq!(h.status("/vm"), InstanceStatus::Deploying);
    assert!(h.bus.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_monitor_ticks_during_undeploy_and_machine_down() {
    let options = ManagerOptions {
        heartbeat_threshold: 0,
        ..ManagerOptions::default()
    };
    let h = Harness::with(MockTargetHandler::new(), options).await;
    h.add_shop();

    for round in 0..20 {
        h.bring_up("/vm").await;
        h.bring_up("/db").await;

        let ticking = Arc::new(AtomicBool::new(true));
        let ticker = {
            let manager = h.manager.clone();
            let ticking = ticking.clone();
            tokio::spawn(async move {
                while ticking.load(Ordering::Relaxed) {
                    manager.check_heartbeats();
                    tokio::task::yield_now().await;
                }
            })
        };

        if round % 2 == 0 {
            h.manager.undeploy_all(APP, None).await.unwrap();
        } else {
            tokio::join!(machine_down(&h, "/vm"), machine_down(&h, "/db"));
        }
        ticking.store(false, Ordering::Relaxed);
        ticker.await.unwrap();

        for scope in ["/vm", "/db"] {
            let instance = h.instance(scope);
            assert_eq!(
                instance.status,
                InstanceStatus::NotDeployed,
                "{scope} after round {round}"
            );
            assert!(instance.machine_id().is_none());
        }
    }

    // Every round deployed both machines again from scratch.
    assert_eq!(h.handler.acquisitions(), 40);
    assert_eq!(h.handler.releases(), 40);
}

#[tokio::test]
async fn test_restart_restores_running_machines() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("manager.db");
    let handler = Arc::new(MockTargetHandler::new());

    {
        let store = Arc::new(SqliteInstanceStore::open(&db_path).unwrap());
        let h = Harness::sharing(handler.clone(), ManagerOptions::default().with_store(store))
            .await;
        h.add_shop();
        h.bring_up("/vm").await;
        h.bring_up("/db").await;

        // The /db machine disappears while the manager is down.
        let machine_id = h.instance("/db").machine_id().unwrap().to_string();
        assert!(handler.forget_machine(&machine_id));
        h.manager.shutdown().await;
    }

    let store = Arc::new(SqliteInstanceStore::open(&db_path).unwrap());
    let h = Harness::sharing(handler.clone(), ManagerOptions::default().with_store(store)).await;
    assert_eq!(h.manager.restore_applications().await.unwrap(), 1);

    let vm = h.instance("/vm");
    assert_eq!(vm.status, InstanceStatus::Restoring);
    assert!(vm.machine_id().is_some());

    let db = h.instance("/db");
    assert_eq!(db.status, InstanceStatus::NotDeployed);
    assert!(db.machine_id().is_none());

    // Restoring machines get the usual grace period.
    assert!(h.manager.check_heartbeats().is_empty());

    h.heartbeat("/vm", true).await;
    assert_eq!(h.status("/vm"), InstanceStatus::DeployedStarted);
    assert_eq!(h.sent_kinds("/vm"), vec!["set_identity"]);

    // Restoring twice does not duplicate applications.
    assert_eq!(h.manager.restore_applications().await.unwrap(), 0);
}
