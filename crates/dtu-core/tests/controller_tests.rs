//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dtu_common::config::BridgeConfig;
use dtu_core::{
    BridgeController, BridgeRuntime, CommandSink, ControlAction, ControlCommand, CoreError,
    MaintenanceJob, MemoryStateStore, StateBrowser, TransportEvent,
};
use dtu_metrics::{new_registry, BridgeMetrics};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

#[derive(Default)]
struct RecordingSink {
    commands: Mutex<Vec<ControlCommand>>,
    fail: bool,
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn dispatch(&self, command: &ControlCommand) -> dtu_core::Result<()> {
        self.commands.lock().push(command.clone());
        if self.fail {
            return Err(CoreError::Relay("device unreachable".into()));
        }
        Ok(())
    }
}

/// Device that never answers.
struct StalledSink;

#[async_trait]
impl CommandSink for StalledSink {
    async fn dispatch(&self, _command: &ControlCommand) -> dtu_core::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn controller(config: BridgeConfig) -> (BridgeController, Arc<MemoryStateStore>) {
    let (store, _rx) = MemoryStateStore::recording();
    let store = Arc::new(store);
    (BridgeController::new(&config, store.clone()), store)
}

fn frame(body: serde_json::Value) -> TransportEvent {
    TransportEvent::Frame(body.to_string())
}

fn inverter(serial: &str, reachable: bool, power: f64) -> serde_json::Value {
    json!({
        "inverters": [{
            "serial": serial,
            "name": "Roof",
            "reachable": reachable,
            "AC": {"0": {"Power": {"v": power, "u": "W"}, "Voltage": {"v": 230.1, "u": "V"}}},
            "DC": {"0": {"Current": {"v": 1.5, "u": "A"}, "YieldDay": {"v": 800, "u": "Wh"}}},
            "INV": {"0": {"Temperature": {"v": 35.5, "u": "°C"}, "YieldTotal": {"v": 120.5, "u": "kWh"}}}
        }]
    })
}

#[tokio::test]
async fn repeated_messages_materialize_objects_once() {
    let (mut controller, store) = controller(BridgeConfig::default());
    for _ in 0..3 {
        controller
            .handle_event(frame(inverter("S1", true, 100.0)))
            .await
            .unwrap();
    }

    assert_eq!(store.extend_calls("S1"), 1);
    assert_eq!(store.extend_calls("S1.ac.phase_1"), 1);
    assert_eq!(store.extend_calls("S1.ac.phase_1.power"), 1);
    assert_eq!(store.extend_calls("S1.power_control.restart"), 1);
    assert_eq!(store.object_count(), controller.cache().len());
}

#[tokio::test]
async fn telemetry_lands_on_descriptor_paths() {
    let (mut controller, store) = controller(BridgeConfig::default());
    controller
        .handle_event(frame(inverter("S1", true, 120.5)))
        .await
        .unwrap();

    assert_eq!(store.value("S1.ac.phase_1.power"), Some(json!(120.5)));
    assert_eq!(store.value("S1.ac.phase_1.voltage"), Some(json!(230.1)));
    assert_eq!(store.value("S1.dc.input_1.current"), Some(json!(1.5)));
    assert_eq!(store.value("S1.dc.input_1.yieldday"), Some(json!(800)));
    assert_eq!(store.value("S1.temperature"), Some(json!(35.5)));
    assert_eq!(store.value("S1.yieldtotal"), Some(json!(120.5)));
    assert_eq!(store.value("S1.available"), Some(json!(true)));
    assert_eq!(store.value("S1.name"), Some(json!("Roof")));
    assert!(store.is_subscribed("S1.power_control.limit_persistent_absolute"));
}

#[tokio::test]
async fn offline_transition_zeroes_live_values_once() {
    let (mut controller, store) = controller(BridgeConfig::default());
    controller
        .handle_event(frame(inverter("S1", true, 120.5)))
        .await
        .unwrap();

    controller
        .handle_event(frame(inverter("S1", false, 55.0)))
        .await
        .unwrap();
    controller
        .handle_event(frame(inverter("S1", false, 66.0)))
        .await
        .unwrap();

    assert_eq!(store.writes_to("S1.ac.phase_1.power"), vec![json!(120.5), json!(0)]);
    assert_eq!(store.writes_to("S1.ac.phase_1.voltage"), vec![json!(230.1), json!(0)]);
    assert_eq!(store.writes_to("S1.dc.input_1.current"), vec![json!(1.5), json!(0)]);
    assert_eq!(store.writes_to("S1.temperature"), vec![json!(35.5), json!(0)]);
    assert_eq!(store.value("S1.yieldtotal"), Some(json!(120.5)));
    assert_eq!(store.value("S1.available"), Some(json!(false)));
    assert!(controller.guards().offline().contains("S1"));

    controller
        .handle_event(frame(inverter("S1", true, 77.0)))
        .await
        .unwrap();
    assert!(!controller.guards().offline().contains("S1"));
    assert_eq!(store.value("S1.ac.phase_1.power"), Some(json!(77.0)));
}

#[tokio::test]
async fn offline_handling_can_be_disabled() {
    let (mut controller, store) = controller(BridgeConfig {
        zero_on_offline: false,
        ..BridgeConfig::default()
    });
    controller
        .handle_event(frame(inverter("S1", true, 120.5)))
        .await
        .unwrap();
    controller
        .handle_event(frame(inverter("S1", false, 10.0)))
        .await
        .unwrap();

    assert_eq!(store.value("S1.ac.phase_1.power"), Some(json!(10.0)));
    assert!(controller.guards().offline().is_empty());
}

#[tokio::test]
async fn yield_totals_never_regress() {
    let (mut controller, store) = controller(BridgeConfig::default());
    for total in [100.0, 100.0, 99.0, 101.0] {
        let message = json!({"total": {"YieldTotal": {"v": total, "u": "kWh"}}});
        controller.handle_event(frame(message)).await.unwrap();
    }
    assert_eq!(
        store.writes_to("total.yieldtotal"),
        vec![json!(100.0), json!(101.0)]
    );
}

#[tokio::test]
async fn malformed_frames_are_counted_and_dropped() {
    let registry = new_registry();
    let metrics = BridgeMetrics::new(registry).unwrap();
    let (controller, store) = controller(BridgeConfig::default());
    let mut controller = controller.with_metrics(metrics.clone());

    controller
        .handle_event(TransportEvent::Frame("{\"inverters\": [".into()))
        .await
        .unwrap();
    controller
        .handle_event(TransportEvent::Frame("42".into()))
        .await
        .unwrap();

    assert_eq!(metrics.messages_malformed(), 2);
    assert_eq!(store.total_writes(), 0);
    assert_eq!(store.object_count(), 0);
}

#[tokio::test]
async fn maintenance_jobs_reset_day_and_refresh_totals() {
    let (mut controller, store) = controller(BridgeConfig::default());
    controller
        .handle_event(frame(inverter("S1", true, 120.5)))
        .await
        .unwrap();

    let zeroed = controller
        .run_maintenance(MaintenanceJob::DayEnd)
        .await
        .unwrap();
    assert_eq!(zeroed, 1);
    assert_eq!(store.value("S1.dc.input_1.yieldday"), Some(json!(0)));

    // a fresh, smaller counter for the new day is accepted again
    let next_day = json!({"inverters": [{"serial": "S1", "DC": {"0": {"YieldDay": {"v": 5}}}}]});
    controller.handle_event(frame(next_day)).await.unwrap();
    assert_eq!(store.value("S1.dc.input_1.yieldday"), Some(json!(5)));

    let refreshed = controller
        .run_maintenance(MaintenanceJob::PostMidnight)
        .await
        .unwrap();
    assert_eq!(refreshed, 1);
    assert_eq!(
        store.writes_to("S1.yieldtotal"),
        vec![json!(120.5), json!(120.5)]
    );
}

#[tokio::test]
async fn stale_day_yield_after_reset_is_held_back() {
    let (mut controller, store) = controller(BridgeConfig::default());
    let day = |value: u64| {
        frame(json!({"inverters": [{"serial": "S1", "DC": {"0": {"YieldDay": {"v": value}}}}]}))
    };

    controller.handle_event(day(12000)).await.unwrap();
    controller
        .run_maintenance(MaintenanceJob::DayEnd)
        .await
        .unwrap();
    // the device still reports yesterday's counter until it rolls over
    controller.handle_event(day(12000)).await.unwrap();
    assert_eq!(store.value("S1.dc.input_1.yieldday"), Some(json!(0)));

    controller.handle_event(day(5)).await.unwrap();
    controller.handle_event(day(800)).await.unwrap();
    assert_eq!(store.value("S1.dc.input_1.yieldday"), Some(json!(800)));
    assert_eq!(
        store.writes_to("S1.dc.input_1.yieldday"),
        vec![json!(12000), json!(0), json!(5), json!(800)]
    );
}

#[tokio::test]
async fn connection_events_drive_indicator() {
    let (mut controller, store) = controller(BridgeConfig::default());
    controller.initialize().await.unwrap();
    assert_eq!(store.value("info.connection"), Some(json!(false)));

    controller.handle_event(TransportEvent::Connected).await.unwrap();
    assert_eq!(store.value("info.connection"), Some(json!(true)));
    controller
        .handle_event(TransportEvent::Disconnected)
        .await
        .unwrap();
    assert_eq!(store.value("info.connection"), Some(json!(false)));
}

#[tokio::test]
async fn runtime_relays_user_writes_and_acknowledges() {
    let (store, writes) = MemoryStateStore::new();
    let store = Arc::new(store);
    let sink = Arc::new(RecordingSink::default());
    let controller =
        BridgeController::new(&BridgeConfig::default(), store.clone()).with_relay(sink.clone());

    let (event_tx, event_rx) = mpsc::channel(16);
    let (_job_tx, job_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = BridgeRuntime::new(controller, event_rx, writes, job_rx, shutdown_rx);
    let task = tokio::spawn(runtime.run());

    event_tx
        .send(frame(inverter("114182912345", true, 10.0)))
        .await
        .unwrap();

    let limit = dtu_core::DevicePath::new("114182912345.power_control.limit_persistent_absolute");
    for _ in 0..50 {
        if store.is_subscribed(limit.as_str()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    store.write_user(&limit, json!(80)).await.unwrap();
    store
        .write_user(
            &dtu_core::DevicePath::new("114182912345.power_control.limit_nonpersistent_relative"),
            json!("abc"),
        )
        .await
        .unwrap();

    for _ in 0..50 {
        let acked = store
            .read_state(&limit)
            .await
            .unwrap()
            .map(|state| state.ack)
            .unwrap_or(false);
        if acked {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    let commands = sink.commands.lock().clone();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].action, ControlAction::LimitPersistentAbsolute);
    assert_eq!(
        commands[0].payload(),
        json!({"serial": "114182912345", "limit_type": 256, "limit_value": 80})
    );
    assert!(store.read_state(&limit).await.unwrap().unwrap().ack);
    let rejected = store
        .read_state(&dtu_core::DevicePath::new(
            "114182912345.power_control.limit_nonpersistent_relative",
        ))
        .await
        .unwrap()
        .unwrap();
    assert!(!rejected.ack);
}

#[tokio::test]
async fn relay_failures_still_acknowledge() {
    let (store, _rx) = MemoryStateStore::new();
    let store = Arc::new(store);
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });
    let mut controller =
        BridgeController::new(&BridgeConfig::default(), store.clone()).with_relay(sink.clone());
    controller
        .handle_event(frame(inverter("S1", true, 10.0)))
        .await
        .unwrap();

    let restart = dtu_core::DevicePath::new("S1.power_control.restart");
    store.write_user(&restart, json!(true)).await.unwrap();
    controller
        .handle_user_write(dtu_core::StateChange {
            path: restart.clone(),
            value: json!(true),
        })
        .await
        .unwrap();
    assert!(store.read_state(&restart).await.unwrap().unwrap().ack);

    controller.drain_relays().await;
    assert_eq!(sink.commands.lock().len(), 1);
    assert_eq!(controller.pending_relays(), 0);
}

#[tokio::test]
async fn stalled_device_does_not_block_telemetry() {
    let (store, _rx) = MemoryStateStore::new();
    let store = Arc::new(store);
    let mut controller = BridgeController::new(&BridgeConfig::default(), store.clone())
        .with_relay(Arc::new(StalledSink));
    controller
        .handle_event(frame(inverter("S1", true, 10.0)))
        .await
        .unwrap();

    let limit = dtu_core::DevicePath::new("S1.power_control.limit_persistent_relative");
    store.write_user(&limit, json!(50)).await.unwrap();
    timeout(
        Duration::from_secs(1),
        controller.handle_user_write(dtu_core::StateChange {
            path: limit.clone(),
            value: json!(50),
        }),
    )
    .await
    .expect("write handling must not wait for the device")
    .unwrap();
    assert!(store.read_state(&limit).await.unwrap().unwrap().ack);
    assert_eq!(controller.pending_relays(), 1);

    timeout(
        Duration::from_secs(1),
        controller.handle_event(frame(inverter("S1", true, 42.0))),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(store.value("S1.ac.phase_1.power"), Some(json!(42.0)));
}

#[tokio::test]
async fn oversized_channel_index_is_ignored() {
    let (mut controller, store) = controller(BridgeConfig::default());
    controller
        .handle_event(TransportEvent::Frame(
            r#"{"inverters":[{"serial":"S1","AC":{"18446744073709551615":{"Power":{"v":1}}}}]}"#
                .into(),
        ))
        .await
        .unwrap();
    controller
        .handle_event(frame(inverter("S1", true, 7.0)))
        .await
        .unwrap();
    assert_eq!(store.value("S1.ac.phase_1.power"), Some(json!(7.0)));
    assert!(store.value("S1.ac.phase_0.power").is_none());
}
