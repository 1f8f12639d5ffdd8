//! Integration tests for the messaging gateway as the manager sees it:
//! backend switches, late factory registration and inbound processing.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{path, Harness, APP};
use dm_manager::messaging::{InMemoryClientFactory, MessagingError, IN_MEMORY_TYPE};
use dm_manager::ErrorKind;
use dm_messages::{Heartbeat, InstanceChanged, Notification};
use dm_model::InstanceStatus;

fn heartbeat(scope: &str, model_required: bool) -> Notification {
    Notification::Heartbeat(Heartbeat {
        application_name: APP.to_string(),
        scoped_instance_path: path(scope),
        ip_address: None,
        model_required,
    })
}

#[tokio::test]
async fn test_dismissed_until_factory_registers() {
    let h = Harness::new().await;
    h.add_shop();

    h.manager.switch_messaging_backend("amqp").await.unwrap();
    let messaging = h.manager.messaging();
    assert!(messaging.is_dismissed());
    assert_eq!(messaging.configured_type().as_deref(), Some("amqp"));

    // Machines can still be provisioned; the agent just cannot be reached.
    h.manager
        .change_instance_state(APP, &path("/vm"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();
    let err = h
        .manager
        .handle_notification(heartbeat("/vm", true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(h.status("/vm"), InstanceStatus::Deploying);
    assert_eq!(h.awaiting("/vm"), 1);

    h.manager
        .register_messaging_factory(Arc::new(InMemoryClientFactory::with_type(
            h.bus.clone(),
            "amqp",
        )))
        .await
        .unwrap();
    assert!(!messaging.is_dismissed());
    assert_eq!(messaging.messaging_client().messaging_type(), "amqp");

    h.manager
        .handle_notification(heartbeat("/vm", true))
        .await
        .unwrap();
    assert_eq!(h.status("/vm"), InstanceStatus::DeployedStarted);
    assert_eq!(h.sent_kinds("/vm"), vec!["set_identity"]);
}

#[tokio::test]
async fn test_deregistered_factory_dismisses_client() {
    let h = Harness::new().await;
    let messaging = h.manager.messaging();

    h.manager.deregister_messaging_factory(IN_MEMORY_TYPE).await;
    assert!(messaging.is_dismissed());
    assert_eq!(messaging.configured_type().as_deref(), Some(IN_MEMORY_TYPE));

    let result = messaging
        .send_to_agent(APP, &path("/vm"), &dm_messages::Command::Resynchronize.into())
        .await;
    assert!(matches!(result, Err(MessagingError::NotConnected)));

    // Deregistering some other type leaves the active client alone.
    h.manager
        .register_messaging_factory(Arc::new(InMemoryClientFactory::new(h.bus.clone())))
        .await
        .unwrap();
    h.manager.deregister_messaging_factory("amqp").await;
    assert!(!messaging.is_dismissed());
}

#[tokio::test]
async fn test_configuration_follows_configured_type() {
    let h = Harness::new().await;
    let messaging = h.manager.messaging();

    let configuration = BTreeMap::from([("url".to_string(), "mem://local".to_string())]);
    messaging.set_configuration(configuration.clone()).unwrap();
    assert_eq!(messaging.configuration(), Some(configuration.clone()));

    h.manager.switch_messaging_backend("amqp").await.unwrap();
    assert_eq!(messaging.configuration(), None);
    assert!(matches!(
        messaging.set_configuration(configuration),
        Err(MessagingError::TypeMismatch { .. })
    ));
}

#[tokio::test]
async fn test_switch_resynchronizes_agents() {
    let h = Harness::new().await;
    h.add_shop();
    h.bring_up("/vm").await;

    h.manager
        .register_messaging_factory(Arc::new(InMemoryClientFactory::with_type(
            h.bus.clone(),
            "amqp",
        )))
        .await
        .unwrap();
    h.manager.switch_messaging_backend("amqp").await.unwrap();

    assert_eq!(h.sent_kinds("/vm").last(), Some(&"resynchronize"));
    // Undeployed machines have no agent to ask.
    assert!(h.bus.sent_to(APP, &path("/db")).is_empty());
}

#[tokio::test]
async fn test_switch_to_unknown_backend_keeps_nothing_active() {
    let h = Harness::new().await;

    h.manager.switch_messaging_backend("http").await.unwrap();
    assert!(h.manager.messaging().is_dismissed());

    h.manager
        .switch_messaging_backend(IN_MEMORY_TYPE)
        .await
        .unwrap();
    assert!(!h.manager.messaging().is_dismissed());
}

#[tokio::test]
async fn test_inbound_notifications_are_processed() {
    let h = Harness::new().await;
    h.add_shop();
    h.manager
        .change_instance_state(APP, &path("/vm"), InstanceStatus::DeployedStarted)
        .await
        .unwrap();

    let mut processor = h.manager.take_processor().unwrap();

    h.bus.publish_to_manager(heartbeat("/vm", false)).unwrap();
    h.bus
        .publish_to_manager(Notification::InstanceChanged(InstanceChanged {
            application_name: APP.to_string(),
            instance_path: path("/vm/tomcat"),
            new_status: InstanceStatus::DeployedStarted,
            imports: None,
        }))
        .unwrap();
    // Notifications for unknown applications are logged and dropped.
    h.bus
        .publish_to_manager(Notification::Heartbeat(Heartbeat {
            application_name: "blog".to_string(),
            scoped_instance_path: path("/vm"),
            ip_address: None,
            model_required: false,
        }))
        .unwrap();

    assert_eq!(processor.process_available().await, 3);
    assert_eq!(h.status("/vm"), InstanceStatus::DeployedStarted);
    assert_eq!(h.status("/vm/tomcat"), InstanceStatus::DeployedStarted);
    assert_eq!(processor.process_available().await, 0);
}

#[tokio::test]
async fn test_inbound_survives_backend_switch() {
    let h = Harness::new().await;
    h.add_shop();
    let mut processor = h.manager.take_processor().unwrap();

    h.manager
        .register_messaging_factory(Arc::new(InMemoryClientFactory::with_type(
            h.bus.clone(),
            "amqp",
        )))
        .await
        .unwrap();
    h.manager.switch_messaging_backend("amqp").await.unwrap();

    h.bus.publish_to_manager(heartbeat("/vm", false)).unwrap();
    assert_eq!(processor.process_available().await, 1);
}
