//! End-to-end pipeline tests over the simulated driver.
//!
//! Exercises the live path: poll task -> change detection -> listener
//! fan-out -> publisher/rule engine, all under a paused clock.

use std::sync::Arc;
use std::time::Duration;

use tagway::core::tag::{TagPack, TagSelection};
use tagway::core::value::Value;
use tagway::driver::family::{CIP_DINT, CIP_REAL};
use tagway::driver::sim::{SimDriver, SimHandle, SimTagDef};
use tagway::manager::config::{DeviceConfig, GatewaySettings};
use tagway::manager::device::DeviceStatus;
use tagway::manager::DeviceManager;
use tagway::publish::memory::MemorySink;
use tagway::publish::traits::SinkKind;
use tagway::rules::condition::{CompareOp, Condition};
use tagway::rules::engine::{RuleConfig, RuleEngine};
use tagway::rules::Action;
use tagway::driver::ProtocolFamily;

fn settings() -> GatewaySettings {
    GatewaySettings {
        name: "test-gw".to_string(),
        default_poll_interval_ms: 250,
        health_interval_ms: 10_000,
        shutdown_timeout_ms: 2_000,
    }
}

fn sim_tags() -> Vec<SimTagDef> {
    vec![
        SimTagDef::new("Speed", CIP_REAL, 0.0),
        SimTagDef::new("Counter", CIP_DINT, 0_i64),
        SimTagDef::new("Spare", CIP_DINT, 7_i64),
    ]
}

fn device_config() -> DeviceConfig {
    DeviceConfig::new("plc1", ProtocolFamily::Sim, "sim://plant1")
        .with_tag("Speed", TagSelection::default())
        .with_tag("Counter", TagSelection::default())
        .with_tag("Spare", TagSelection::disabled())
}

/// Manager + sim device + one recording sink, started and connected.
async fn gateway() -> (DeviceManager, SimHandle, Arc<MemorySink>) {
    let manager = DeviceManager::new(settings());
    let (driver, handle) = SimDriver::new("sim://plant1", sim_tags());
    manager
        .add_device(device_config(), Box::new(driver))
        .unwrap();

    let sink = Arc::new(MemorySink::new("recorder", SinkKind::Broker));
    manager.publisher().add_sink(sink.clone()).unwrap();
    manager.publisher().start_sink("recorder").await.unwrap();

    manager.start();
    manager.connect("plc1").unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    (manager, handle, sink)
}

#[tokio::test(start_paused = true)]
async fn first_poll_emits_first_observation_changes() {
    let (manager, _handle, sink) = gateway().await;

    let tags: Vec<String> = sink.updates().iter().map(|u| u.tag.clone()).collect();
    assert!(tags.contains(&"Speed".to_string()));
    assert!(tags.contains(&"Counter".to_string()));
    // Disabled tag never shows up.
    assert!(!tags.contains(&"Spare".to_string()));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repolling_unchanged_values_is_silent() {
    let (manager, _handle, sink) = gateway().await;
    sink.clear();

    // Several more poll cycles without any device-side change.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(sink.update_count(), 0);

    let stats = manager.poll_stats();
    assert!(stats.total.tags_polled > 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_tag_never_changes_and_is_excluded_from_sweeps() {
    let (manager, handle, sink) = gateway().await;
    sink.clear();

    handle.set_value("Spare", 99_i64);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(sink.updates().iter().all(|u| u.tag != "Spare"));

    // Full-table sweep also excludes it.
    manager.force_publish_all(None);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let tags: Vec<String> = sink.updates().iter().map(|u| u.tag.clone()).collect();
    assert!(tags.contains(&"Speed".to_string()));
    assert!(!tags.contains(&"Spare".to_string()));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn value_change_flows_to_sink_and_table() {
    let (manager, handle, sink) = gateway().await;
    sink.clear();

    handle.set_value("Speed", 42.5);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stored = manager.values().get("plc1", "Speed").unwrap();
    assert_eq!(stored.value, Value::Float(42.5));

    let updates = sink.updates();
    let speed = updates.iter().find(|u| u.tag == "Speed").unwrap();
    assert_eq!(speed.value.value, Value::Float(42.5));
    assert_eq!(speed.type_name, "REAL");

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn write_round_trip_is_a_change() {
    let (manager, handle, sink) = gateway().await;
    sink.clear();

    manager
        .write_tag("plc1", "Counter", &Value::Integer(1234))
        .await
        .unwrap();
    assert_eq!(handle.value("Counter"), Some(Value::Integer(1234)));

    // The next poll observes the written value as a change.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let updates = sink.updates();
    let counter = updates.iter().find(|u| u.tag == "Counter").unwrap();
    assert_eq!(counter.value.value, Value::Integer(1234));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn write_to_offline_device_fails_immediately() {
    let manager = DeviceManager::new(settings());
    let (driver, _handle) = SimDriver::new("sim://plant1", sim_tags());
    manager
        .add_device(device_config(), Box::new(driver))
        .unwrap();

    // Never connected: write must fail with a connectivity error, not queue.
    let err = manager
        .write_tag("plc1", "Counter", &Value::Integer(1))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}

#[tokio::test(start_paused = true)]
async fn force_publish_on_enable_transition() {
    let (manager, _handle, sink) = gateway().await;

    // Build a known last value while enabled, then disable.
    manager
        .set_tag_enabled("plc1", "Counter", false)
        .await
        .unwrap();
    sink.clear();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.update_count(), 0);

    // Enable again: the unchanged value reaches the sink, marked forced.
    manager
        .set_tag_enabled("plc1", "Counter", true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let updates = sink.updates();
    let forced = updates.iter().find(|u| u.tag == "Counter").unwrap();
    assert!(forced.force);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn offline_then_online_produces_error_then_value() {
    let (manager, handle, _sink) = gateway().await;
    let (_id, mut rx) = manager.add_listener();

    handle.set_offline(true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Every enabled tag transitions to an error observation.
    let mut saw_error = false;
    while let Ok(event) = rx.try_recv() {
        if event.tag == "Speed" && event.new.is_error() {
            saw_error = true;
        }
    }
    assert!(saw_error);
    assert_eq!(
        manager.list_devices()[0].status,
        DeviceStatus::Error
    );

    // Back online: auto-connect recovers and values replace the errors.
    handle.set_offline(false);
    tokio::time::sleep(Duration::from_secs(35)).await;

    let mut saw_value = false;
    while let Ok(event) = rx.try_recv() {
        if event.tag == "Speed" && !event.new.is_error() {
            saw_value = true;
        }
    }
    assert!(saw_value);
    assert_eq!(
        manager.list_devices()[0].status,
        DeviceStatus::Connected
    );

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn auto_connect_retries_after_handshake_failure() {
    let manager = DeviceManager::new(settings());
    let (driver, handle) = SimDriver::new("sim://plant1", sim_tags());
    handle.fail_next_connects(2);
    manager
        .add_device(device_config(), Box::new(driver))
        .unwrap();
    manager.start();
    manager.connect("plc1").unwrap();

    // Two failures at 500 ms and 1 s backoff, then success.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.list_devices()[0].status, DeviceStatus::Connected);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_connect_required_without_auto_connect() {
    let manager = DeviceManager::new(settings());
    let (driver, handle) = SimDriver::new("sim://plant1", sim_tags());
    handle.fail_next_connects(1);

    let mut config = device_config();
    config.auto_connect = false;
    manager.add_device(config, Box::new(driver)).unwrap();
    manager.start();
    manager.connect("plc1").unwrap();

    // Stays in Error, no automatic retry.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(manager.list_devices()[0].status, DeviceStatus::Error);

    // Manual reconnect succeeds.
    manager.connect("plc1").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.list_devices()[0].status, DeviceStatus::Connected);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn health_published_once_per_interval() {
    let (manager, _handle, sink) = gateway().await;
    let before = sink.health_messages().len();

    tokio::time::sleep(Duration::from_secs(30)).await;

    let messages = sink.health_messages();
    let after = messages.len();
    assert_eq!(after - before, 3, "one health message per 10 s interval");
    let message = &messages[after - 1];
    assert_eq!(message.device, "plc1");
    assert_eq!(message.driver, "sim");
    assert!(message.online);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sink_independence_end_to_end() {
    let (manager, handle, healthy) = gateway().await;
    let broken = Arc::new(MemorySink::new("broken", SinkKind::KeyValue));
    broken.set_failing(true);
    manager.publisher().add_sink(broken.clone()).unwrap();
    manager.publisher().start_sink("broken").await.unwrap();
    healthy.clear();

    handle.set_value("Speed", 88.0);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(healthy.updates().iter().any(|u| u.tag == "Speed"));
    assert_eq!(broken.update_count(), 0);

    let status = manager.publisher().sink_status();
    let broken_status = status.iter().find(|s| s.name == "broken").unwrap();
    let healthy_status = status.iter().find(|s| s.name == "recorder").unwrap();
    assert!(!broken_status.connected);
    assert!(broken_status.last_error.is_some());
    assert!(healthy_status.connected);
    assert!(healthy_status.delivered > 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pack_enable_publishes_members() {
    let (manager, _handle, sink) = gateway().await;
    manager
        .add_pack(TagPack {
            name: "line1".to_string(),
            members: vec![
                ("plc1".to_string(), "Speed".to_string()),
                ("plc1".to_string(), "Counter".to_string()),
            ],
            enabled: false,
            suppress_broker: false,
            suppress_kv: false,
        })
        .unwrap();
    sink.clear();

    manager.set_pack_enabled("line1", true).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let tags: Vec<String> = sink.updates().iter().map(|u| u.tag.clone()).collect();
    assert!(tags.contains(&"Speed".to_string()));
    assert!(tags.contains(&"Counter".to_string()));
    assert!(sink.updates().iter().all(|u| u.force));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rule_write_back_end_to_end() {
    let (manager, handle, _sink) = gateway().await;

    let engine = RuleEngine::new(manager.values(), Arc::new(manager.clone()));
    engine
        .add_rule(RuleConfig {
            name: "overspeed_stop".to_string(),
            enabled: true,
            conditions: vec![Condition {
                device: "plc1".to_string(),
                tag: "Speed".to_string(),
                op: CompareOp::Gt,
                value: Value::Float(100.0),
                negate: false,
            }],
            logic: Default::default(),
            debounce_ms: 0,
            cooldown_ms: 0,
            cooldown_mode: Default::default(),
            actions: vec![Action::WriteBack {
                device: "plc1".to_string(),
                tag: "Counter".to_string(),
                value: Value::Integer(-1),
            }],
            cleared_actions: vec![],
        })
        .unwrap();
    let (_id, rx) = manager.add_listener();
    engine.attach(rx);

    handle.set_value("Speed", 150.0);
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The rule fired and wrote back into the controller.
    assert_eq!(handle.value("Counter"), Some(Value::Integer(-1)));
    let status = engine.status("overspeed_stop").unwrap();
    assert_eq!(status.fire_count, 1);

    engine.shutdown();
    manager.shutdown().await;
}
