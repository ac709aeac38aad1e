//! ---
//! dtu_section: "15-testing-qa-runbook"
//! dtu_subsection: "integration-tests"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Integration and validation tests for the bridge workspace."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use dtu_common::config::BridgeConfig;
use dtu_core::{
    BridgeController, BridgeRuntime, DevicePath, MemoryStateStore, StateBrowser, TransportEvent,
};
use dtu_metrics::{new_registry, BridgeMetrics};
use dtu_net::{HttpControlRelay, LinkTimings, WebSocketConnector};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use url::Url;

const SERIAL: &str = "114182912345";

type Posted = Arc<Mutex<Vec<Value>>>;

fn live_frame() -> String {
    json!({
        "inverters": [{
            "serial": SERIAL,
            "name": "Carport",
            "reachable": true,
            "producing": true,
            "AC": {"0": {"Power": {"v": 231.4, "u": "W"}, "Frequency": {"v": 50.01, "u": "Hz"}}},
            "DC": {"0": {"name": {"u": "East"}, "Power": {"v": 120.2, "u": "W"}},
                   "1": {"name": {"u": "West"}, "Power": {"v": 118.9, "u": "W"}}},
            "INV": {"0": {"YieldTotal": {"v": 1520.3, "u": "kWh"}}}
        }],
        "total": {"Power": {"v": 231.4, "u": "W"}, "YieldTotal": {"v": 1520.3, "u": "kWh"}}
    })
    .to_string()
}

async fn fake_device(posted: Posted) -> SocketAddr {
    let router = Router::new()
        .route(
            "/livedata",
            get(|ws: WebSocketUpgrade| async move {
                ws.on_upgrade(|mut socket| async move {
                    let _ = socket.send(Message::Text(live_frame())).await;
                    // keep answering pings until the bridge goes away
                    while let Some(Ok(_)) = socket.recv().await {}
                })
            }),
        )
        .route(
            "/api/limit/config",
            post(
                |State(posted): State<Posted>, Form(form): Form<HashMap<String, String>>| async move {
                    let data = form
                        .get("data")
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or(Value::Null);
                    posted.lock().push(data);
                    StatusCode::OK
                },
            ),
        )
        .with_state(posted);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn wait_for<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn websocket_telemetry_reaches_store_and_writes_reach_device() {
    let posted: Posted = Arc::default();
    let addr = fake_device(posted.clone()).await;

    let (store, writes) = MemoryStateStore::new();
    let store = Arc::new(store);
    let metrics = BridgeMetrics::new(new_registry()).unwrap();
    let relay = HttpControlRelay::with_base(
        Url::parse(&format!("http://{addr}")).unwrap(),
        Duration::from_secs(2),
    )
    .unwrap()
    .with_credentials("admin", Some("openDTU42"));
    let controller = BridgeController::new(&BridgeConfig::default(), store.clone())
        .with_relay(Arc::new(relay))
        .with_metrics(metrics.clone());

    let timings = LinkTimings {
        ping_interval: Duration::from_millis(200),
        pong_grace: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
    };
    let connector = WebSocketConnector::with_url(format!("ws://{addr}/livedata"), timings);

    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
    let (_job_tx, job_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport = tokio::spawn(connector.run(event_tx, shutdown_rx.clone()));
    let runtime = tokio::spawn(
        BridgeRuntime::new(controller, event_rx, writes, job_rx, shutdown_rx).run(),
    );

    wait_for(|| store.value("total.yieldtotal").is_some()).await;
    assert_eq!(store.value("info.connection"), Some(json!(true)));
    assert_eq!(store.value(&format!("{SERIAL}.ac.phase_1.power")), Some(json!(231.4)));
    assert_eq!(store.value(&format!("{SERIAL}.ac.phase_1.frequency")), Some(json!(50.01)));
    assert_eq!(store.value(&format!("{SERIAL}.dc.input_2.name")), Some(json!("West")));
    assert_eq!(store.value(&format!("{SERIAL}.yieldtotal")), Some(json!(1520.3)));
    assert_eq!(store.value(&format!("{SERIAL}.available")), Some(json!(true)));
    assert_eq!(store.value("total.power"), Some(json!(231.4)));
    assert_eq!(metrics.messages_received(), 1);

    let limit = DevicePath::new(format!("{SERIAL}.power_control.limit_nonpersistent_absolute"));
    assert!(store.is_subscribed(limit.as_str()));
    store.write_user(&limit, json!(400)).await.unwrap();

    wait_for(|| !posted.lock().is_empty()).await;
    assert_eq!(
        posted.lock()[0],
        json!({"serial": SERIAL, "limit_type": 0, "limit_value": 400})
    );
    let store_for_ack = store.clone();
    let limit_for_ack = limit.clone();
    timeout(Duration::from_secs(5), async move {
        loop {
            let state = store_for_ack.read_state(&limit_for_ack).await.unwrap();
            if state.is_some_and(|state| state.ack) {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("limit write acknowledged");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(3), transport).await.unwrap().unwrap();
    let controller = timeout(Duration::from_secs(3), runtime)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(controller.cache().contains(&limit));
}
