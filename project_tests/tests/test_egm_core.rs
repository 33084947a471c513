//! Host registration, device roles and the EGM lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Fixture, Verdict, Wire, quick_settings};
use lib_g2s::configs::ProtocolConfig;
use lib_g2s::core::{
    ClassCommand, Device, Direction, EGM_HOST_ID, EgmError, HostState, RequestOptions, SessionStatus, SimpleDevice,
    StartupContext,
};

fn device(class_name: &str, id: i32, owner: i32) -> Arc<SimpleDevice> {
    Arc::new(SimpleDevice::new(class_name, id, owner))
}

#[tokio::test]
async fn test_host_zero_is_registered_at_construction() {
    let fixture = Fixture::new(quick_settings());
    let egm = fixture.core.host(EGM_HOST_ID).unwrap();
    assert!(egm.is_egm());
    assert!(egm.address().is_none());
    assert_eq!(fixture.core.hosts().len(), 1);
}

#[tokio::test]
async fn test_register_host_is_get_or_add() {
    let fixture = Fixture::new(quick_settings());
    let first = fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();
    let again = fixture.core.register_host(1, "http://elsewhere.test/g2s", false, 9).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(again.address().unwrap().host_str(), Some("host1.test"));
    assert!(fixture.core.router().is_connected(1));

    let bad = fixture.core.register_host(2, "not a uri", false, 2);
    assert!(matches!(bad, Err(EgmError::InvalidAddress { host_id: 2, .. })));
    assert!(fixture.core.host(2).is_none());
}

#[tokio::test]
async fn test_unregister_reassigns_roles_to_egm() {
    let fixture = Fixture::new(quick_settings());
    fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();
    fixture.core.register_host(2, "http://host2.test/g2s", true, 2).unwrap();

    let cabinet = device("cabinet", 1, 1);
    cabinet.roles().add_guest(1);
    let meters = device("meters", 1, 2);
    meters.roles().set_configurator(1);
    meters.roles().add_guest(1);
    meters.roles().add_guest(2);
    fixture.devices.add(cabinet.clone());
    fixture.devices.add(meters.clone());

    let removed = fixture.core.unregister_host(1).await.unwrap();
    assert!(!removed.is_registered());
    assert!(fixture.core.host(1).is_none());
    assert!(!fixture.core.router().is_connected(1));

    assert_eq!(cabinet.roles().owner(), EGM_HOST_ID);
    assert_eq!(cabinet.roles().configurator(), EGM_HOST_ID);
    assert!(cabinet.roles().guests().is_empty());

    assert_eq!(meters.roles().owner(), 2);
    assert_eq!(meters.roles().configurator(), EGM_HOST_ID);
    assert_eq!(meters.roles().guests(), vec![2]);
}

#[tokio::test]
async fn test_unregister_host_is_serialized_with_start() {
    let fixture = Fixture::new(quick_settings());
    fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();
    fixture.core.register_host(2, "http://host2.test/g2s", true, 2).unwrap();
    let leaving = device("cabinet", 1, 1);
    let staying = device("cabinet", 2, 2);
    fixture.devices.add(leaving.clone());
    fixture.devices.add(staying.clone());
    let removed = fixture.core.host(1).unwrap();

    let (started, unregistered) = tokio::join!(fixture.core.start(&[]), fixture.core.unregister_host(1));
    started.unwrap();
    unregistered.unwrap();

    assert!(fixture.core.host(1).is_none());
    assert_eq!(removed.state(), HostState::Disabled);
    assert_eq!(leaving.roles().owner(), EGM_HOST_ID);
    assert_eq!(staying.roles().owner(), 2);
    assert_eq!(fixture.core.host(2).unwrap().state(), HostState::Offline);

    fixture.core.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregister_host_zero_and_unknown_hosts_fail() {
    let fixture = Fixture::new(quick_settings());
    assert!(matches!(fixture.core.unregister_host(EGM_HOST_ID).await, Err(EgmError::ReservedHost)));
    assert!(matches!(fixture.core.unregister_host(42).await, Err(EgmError::UnknownHost(42))));
    assert!(fixture.core.host(EGM_HOST_ID).is_some());
}

#[tokio::test]
async fn test_start_opens_devices_with_default_context() {
    let fixture = Fixture::new(quick_settings());
    fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();
    fixture.core.register_host(2, "http://host2.test/g2s", true, 2).unwrap();
    let plain = device("cabinet", 1, 1);
    let reset = device("cabinet", 2, 2);
    let egm_owned = device("cabinet", 3, EGM_HOST_ID);
    fixture.devices.add(plain.clone());
    fixture.devices.add(reset.clone());
    fixture.devices.add(egm_owned.clone());

    let context = StartupContext {
        host_id: 2,
        device_reset: true,
        ..Default::default()
    };
    fixture.core.start(&[context]).await.unwrap();

    assert!(fixture.core.is_running().await);
    assert!(plain.is_open());
    assert_eq!(plain.last_context(), Some(StartupContext::for_host(1)));
    assert_eq!(reset.last_context(), Some(context));
    assert!(egm_owned.is_open());

    let host = fixture.core.host(1).unwrap();
    assert_eq!(host.state(), HostState::Offline);
    assert_eq!(fixture.core.host(EGM_HOST_ID).unwrap().state(), HostState::Disabled);

    // A second start is a no-op.
    fixture.core.start(&[]).await.unwrap();
    assert_eq!(reset.last_context(), Some(context));

    fixture.core.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_devices_and_aborts_sessions() {
    let fixture = Fixture::new(quick_settings());
    fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();
    let cabinet = device("cabinet", 1, 1);
    fixture.devices.add(cabinet.clone());
    fixture.core.start(&[]).await.unwrap();

    // No endpoint: the request waits in the queue.
    let host = fixture.core.host(1).unwrap();
    let session = host.queue().send_request(
        ClassCommand::new("cabinet", 1, "getCabinetStatus"),
        RequestOptions::new().always_send().timeout(Duration::from_secs(30)),
    );
    assert_eq!(session.status(), SessionStatus::Pending);

    fixture.core.stop().await.unwrap();
    assert!(!fixture.core.is_running().await);
    assert!(!cabinet.is_open());
    assert_eq!(session.status(), SessionStatus::Aborted);
    assert_eq!(host.state(), HostState::Disabled);
    assert_eq!(host.queue().queue().outbound_len(), 0);

    // Stopping twice is harmless.
    fixture.core.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_touches_only_named_hosts() {
    let fixture = Fixture::new(quick_settings());
    fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();
    fixture.core.register_host(2, "http://host2.test/g2s", true, 2).unwrap();
    let first = device("cabinet", 1, 1);
    let second = device("cabinet", 2, 2);
    fixture.devices.add(first.clone());
    fixture.devices.add(second.clone());

    // Ignored while stopped.
    fixture.core.restart(&[StartupContext::for_host(1)]).await;
    assert!(!first.is_open());

    fixture.core.start(&[]).await.unwrap();
    let context = StartupContext {
        host_id: 1,
        comms_lost: true,
        ..Default::default()
    };
    fixture.core.restart(&[context]).await;

    assert!(first.is_open());
    assert_eq!(first.last_context(), Some(context));
    assert_eq!(second.last_context(), Some(StartupContext::for_host(2)));

    fixture.core.stop().await.unwrap();
}

#[tokio::test]
async fn test_apply_host_permissions_diffs_roles() {
    let fixture = Fixture::new(quick_settings());
    fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();

    let claimed = device("cabinet", 1, EGM_HOST_ID);
    let released = device("cabinet", 2, 1);
    let untouched = device("cabinet", 3, EGM_HOST_ID);
    fixture.devices.add(claimed.clone());
    fixture.devices.add(released.clone());
    fixture.devices.add(untouched.clone());
    // Not in the registry yet.
    let visiting = device("bonus", 1, EGM_HOST_ID);

    let claimed_dyn: Arc<dyn Device> = claimed.clone();
    let visiting_dyn: Arc<dyn Device> = visiting.clone();
    let changed = fixture
        .core
        .apply_host_permissions(1, &[claimed_dyn.clone()], &[claimed_dyn], &[visiting_dyn])
        .unwrap();

    assert_eq!(changed.len(), 3);
    assert_eq!(claimed.roles().owner(), 1);
    assert_eq!(claimed.roles().configurator(), 1);
    assert_eq!(released.roles().owner(), EGM_HOST_ID);
    assert_eq!(released.roles().configurator(), EGM_HOST_ID);
    assert_eq!(visiting.roles().guests(), vec![1]);
    assert_eq!(untouched.roles().owner(), EGM_HOST_ID);

    // Applying the same lists again changes nothing.
    let claimed_dyn: Arc<dyn Device> = claimed.clone();
    let visiting_dyn: Arc<dyn Device> = visiting.clone();
    let again = fixture
        .core
        .apply_host_permissions(1, &[claimed_dyn.clone()], &[claimed_dyn], &[visiting_dyn])
        .unwrap();
    assert!(again.is_empty());

    assert!(matches!(
        fixture.core.apply_host_permissions(7, &[], &[], &[]),
        Err(EgmError::UnknownHost(7))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_marks_silent_host_offline() {
    let mut settings = quick_settings();
    settings.offline_timer = Duration::from_secs(3);
    let fixture = Fixture::new(settings);
    let wire = Wire::new(Verdict::Ack);
    fixture.host_with_wire(1, &wire);
    fixture.core.start(&[]).await.unwrap();

    let host = fixture.core.host(1).unwrap();
    assert_eq!(host.offline_timer(), Duration::from_secs(3));
    host.queue().set_online(true);
    assert_eq!(host.state(), HostState::Online);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(host.state(), HostState::Online);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(host.state(), HostState::Offline);

    fixture.core.stop().await.unwrap();
}

#[tokio::test]
async fn test_monitor_reports_sent_and_received_traffic() {
    let fixture = Fixture::new(quick_settings());
    let wire = Wire::new(Verdict::Respond);
    fixture.host_with_wire(1, &wire);
    fixture.core.start(&[]).await.unwrap();

    let mut subscription = fixture.core.monitor().subscribe();
    let host = fixture.core.host(1).unwrap();
    let session = host.queue().send_request(
        ClassCommand::new("communications", 1, "commsOnLine"),
        RequestOptions::new().always_send(),
    );
    assert_eq!(session.completed().await, SessionStatus::Completed);

    let sent = subscription.events.recv().await.unwrap();
    assert_eq!(sent.direction, Direction::Sent);
    assert_eq!(sent.command_type, "commsOnLine");
    let received = subscription.events.recv().await.unwrap();
    assert_eq!(received.direction, Direction::Received);
    assert_eq!(received.command_type, "commsOnLineAck");
    assert_eq!(received.session_id, sent.session_id);

    fixture.core.stop().await.unwrap();
}

#[tokio::test]
async fn test_monitor_subscription_outlives_stop() {
    let fixture = Fixture::new(quick_settings());
    let wire = Wire::new(Verdict::Ack);
    fixture.host_with_wire(1, &wire);
    let mut subscription = fixture.core.monitor().subscribe();

    fixture.core.start(&[]).await.unwrap();
    fixture.core.stop().await.unwrap();
    assert_eq!(fixture.core.monitor().subscriber_count(), 1);

    fixture.core.start(&[]).await.unwrap();
    let host = fixture.core.host(1).unwrap();
    host.queue()
        .send_notification(ClassCommand::new("cabinet", 1, "cabinetStatus"), None)
        .unwrap();

    let sent = subscription.events.recv().await.unwrap();
    assert_eq!(sent.direction, Direction::Sent);
    assert_eq!(sent.command_type, "cabinetStatus");

    fixture.core.stop().await.unwrap();
}

#[tokio::test]
async fn test_core_built_from_config_file() {
    let file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    let contents = serde_json::json!({ "egmId": "EGM_FROM_FILE", "maxQueueSize": 2 });
    serde_json::to_writer(file.as_file(), &contents).unwrap();

    let settings = ProtocolConfig::from_file(file.path()).unwrap().settings();
    let fixture = Fixture::new(settings);
    fixture.core.register_host(1, "http://host1.test/g2s", true, 1).unwrap();
    let host = fixture.core.host(1).unwrap();

    let notification = || ClassCommand::new("cabinet", 1, "cabinetStatus");
    assert!(host.queue().send_notification(notification(), None).is_ok());
    assert!(host.queue().send_notification(notification(), None).is_ok());
    assert!(host.queue().send_notification(notification(), None).is_err());
    assert_eq!(host.queue().queue().peek().unwrap().egm_id, "EGM_FROM_FILE");
}
