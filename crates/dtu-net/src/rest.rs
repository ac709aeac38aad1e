//! ---
//! dtu_section: "05-networking-external-interfaces"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Device transports, control relay and state API."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dtu_core::{DevicePath, ObjectDefinition, StateBrowser, StateValue, StoreError};
use prometheus::{Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One state as returned by the listing and lookup endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEntry {
    pub path: String,
    pub val: Value,
    pub ack: bool,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectDefinition>,
}

impl StateEntry {
    fn new(path: &DevicePath, state: StateValue, object: Option<ObjectDefinition>) -> Self {
        Self {
            path: path.to_string(),
            val: state.val,
            ack: state.ack,
            ts: state.ts,
            object,
        }
    }
}

/// Body accepted by `PUT /api/states/{path}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateWrite {
    pub val: Value,
}

struct RestState {
    store: Arc<dyn StateBrowser>,
    metrics: Option<Arc<Registry>>,
}

/// Builder used to configure and spawn the state API server.
#[derive(Clone)]
pub struct RestApiBuilder {
    listen: SocketAddr,
    store: Arc<dyn StateBrowser>,
    metrics: Option<Arc<Registry>>,
}

impl RestApiBuilder {
    pub fn new(listen: SocketAddr, store: Arc<dyn StateBrowser>) -> Self {
        Self {
            listen,
            store,
            metrics: None,
        }
    }

    /// Attach a Prometheus registry exposed at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: Arc<Registry>) -> Self {
        self.metrics = Some(registry);
        self
    }

    pub async fn spawn(self) -> anyhow::Result<RestApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "state api listening");

        let state = RestState {
            store: self.store,
            metrics: self.metrics,
        };
        let router = Router::new()
            .route("/health", get(get_health))
            .route("/metrics", get(get_metrics))
            .route("/api/states", get(list_states))
            .route("/api/states/:path", get(get_state).put(put_state))
            .with_state(Arc::new(state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "state api server exited with error");
            }
        });

        Ok(RestApiHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle returned from [`RestApiBuilder::spawn`].
pub struct RestApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RestApiHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

async fn get_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_metrics(State(state): State<Arc<RestState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };

    let encoder = TextEncoder::new();
    let families = registry.gather();
    match encoder.encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_states(State(state): State<Arc<RestState>>) -> Json<Vec<StateEntry>> {
    let entries = state
        .store
        .list_states()
        .await
        .into_iter()
        .map(|(path, value)| StateEntry::new(&path, value, None))
        .collect();
    Json(entries)
}

async fn get_state(State(state): State<Arc<RestState>>, Path(path): Path<String>) -> Response {
    let path = DevicePath::new(path);
    match state.store.read_state(&path).await {
        Ok(Some(value)) => {
            let object = state.store.object(&path).await;
            Json(StateEntry::new(&path, value, object)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("state {path} has no value yet") })),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn put_state(
    State(state): State<Arc<RestState>>,
    Path(path): Path<String>,
    Json(body): Json<StateWrite>,
) -> Response {
    let path = DevicePath::new(path);
    debug!(path = %path, val = %body.val, "user write via state api");
    match state.store.write_user(&path, body.val).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Response {
    let status = match err {
        StoreError::UnknownObject(_) => StatusCode::NOT_FOUND,
        StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtu_core::{descriptor_for, MemoryStateStore, StateChange, StateStore};
    use tokio::sync::mpsc;
    use prometheus::{IntCounter, Opts};
    use reqwest::Client;

    fn seeded_store() -> (Arc<MemoryStateStore>, mpsc::UnboundedReceiver<StateChange>) {
        let (store, rx) = MemoryStateStore::new();
        let power = descriptor_for("ac_power").unwrap();
        store.seed("S1.ac.phase_1.power", power.definition(), json!(120.5));
        let limit = descriptor_for("limit_persistent_absolute").unwrap();
        store.seed(
            "S1.power_control.limit_persistent_absolute",
            limit.definition(),
            json!(0),
        );
        (Arc::new(store), rx)
    }

    #[tokio::test]
    async fn states_can_be_listed_and_read() {
        let registry = Registry::new();
        let counter = IntCounter::with_opts(Opts::new("test_metric", "demo")).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let (store, _rx) = seeded_store();
        let handle = RestApiBuilder::new("127.0.0.1:0".parse().unwrap(), store)
            .with_metrics_registry(Arc::new(registry))
            .spawn()
            .await
            .unwrap();
        let client = Client::new();
        let base = format!("http://{}", handle.local_addr());

        let health: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({"status": "ok"}));

        let states: Vec<StateEntry> = client
            .get(format!("{base}/api/states"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(states.len(), 2);

        let power: StateEntry = client
            .get(format!("{base}/api/states/S1.ac.phase_1.power"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(power.val, json!(120.5));
        assert_eq!(power.object.unwrap().unit.as_deref(), Some("W"));

        let missing = client
            .get(format!("{base}/api/states/S2.ac.phase_1.power"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let metrics = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("test_metric"));

        drop(client);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn put_records_unacknowledged_user_write() {
        let (store, mut rx) = seeded_store();
        store
            .subscribe(&DevicePath::new("S1.power_control.limit_persistent_absolute"))
            .await
            .unwrap();
        let handle = RestApiBuilder::new("127.0.0.1:0".parse().unwrap(), store.clone())
            .spawn()
            .await
            .unwrap();
        let client = Client::new();
        let base = format!("http://{}", handle.local_addr());

        let response = client
            .put(format!(
                "{base}/api/states/S1.power_control.limit_persistent_absolute"
            ))
            .json(&json!({"val": 600}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.path.as_str(), "S1.power_control.limit_persistent_absolute");
        assert_eq!(change.value, json!(600));

        let state = store
            .read_state(&DevicePath::new("S1.power_control.limit_persistent_absolute"))
            .await
            .unwrap()
            .unwrap();
        assert!(!state.ack);

        let unknown = client
            .put(format!("{base}/api/states/nowhere"))
            .json(&json!({"val": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        drop(client);
        handle.shutdown().await.unwrap();
    }
}
