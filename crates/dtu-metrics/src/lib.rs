//! ---
//! dtu_section: "03-observability"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Metrics collection and export utilities."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Router serving the registry at `/metrics`, mountable into other servers.
pub fn metrics_router(registry: SharedRegistry) -> Router {
    Router::new().route(
        "/metrics",
        get(move || metrics_handler(registry.clone())),
    )
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = metrics_router(registry);

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to resolve metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters and gauges recorded by the telemetry bridge.
#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    registry: SharedRegistry,
    messages_received: IntCounter,
    messages_malformed: IntCounter,
    states_committed: IntCounter,
    states_suppressed: IntCounterVec,
    objects_created: IntCounter,
    transport_connections: IntCounter,
    transport_disconnections: IntCounter,
    relay_commands: IntCounterVec,
    connected: IntGauge,
}

impl BridgeMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let messages_received = IntCounter::with_opts(Opts::new(
            "dtu_bridge_messages_received_total",
            "Telemetry messages received from the device",
        ))?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_malformed = IntCounter::with_opts(Opts::new(
            "dtu_bridge_messages_malformed_total",
            "Telemetry messages dropped because they could not be decoded",
        ))?;
        registry.register(Box::new(messages_malformed.clone()))?;

        let states_committed = IntCounter::with_opts(Opts::new(
            "dtu_bridge_states_committed_total",
            "State values written to the store",
        ))?;
        registry.register(Box::new(states_committed.clone()))?;

        let states_suppressed = IntCounterVec::new(
            Opts::new(
                "dtu_bridge_states_suppressed_total",
                "State values withheld by a guard, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(states_suppressed.clone()))?;

        let objects_created = IntCounter::with_opts(Opts::new(
            "dtu_bridge_objects_created_total",
            "Device, channel and state objects materialized in the store",
        ))?;
        registry.register(Box::new(objects_created.clone()))?;

        let transport_connections = IntCounter::with_opts(Opts::new(
            "dtu_bridge_transport_connections_total",
            "Successful transport connections",
        ))?;
        registry.register(Box::new(transport_connections.clone()))?;

        let transport_disconnections = IntCounter::with_opts(Opts::new(
            "dtu_bridge_transport_disconnections_total",
            "Transport disconnections, local or remote",
        ))?;
        registry.register(Box::new(transport_disconnections.clone()))?;

        let relay_commands = IntCounterVec::new(
            Opts::new(
                "dtu_bridge_relay_commands_total",
                "Control commands relayed to the device, by action and outcome",
            ),
            &["action", "outcome"],
        )?;
        registry.register(Box::new(relay_commands.clone()))?;

        let connected = IntGauge::with_opts(Opts::new(
            "dtu_bridge_connected",
            "Indicator (0/1) whether the telemetry transport is connected",
        ))?;
        registry.register(Box::new(connected.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            messages_malformed,
            states_committed,
            states_suppressed,
            objects_created,
            transport_connections,
            transport_disconnections,
            relay_commands,
            connected,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_received(&self) {
        self.messages_received.inc();
    }

    pub fn inc_malformed(&self) {
        self.messages_malformed.inc();
    }

    pub fn inc_committed(&self) {
        self.states_committed.inc();
    }

    pub fn inc_suppressed(&self, reason: &str) {
        self.states_suppressed.with_label_values(&[reason]).inc();
    }

    pub fn inc_objects_created(&self) {
        self.objects_created.inc();
    }

    pub fn set_connected(&self, connected: bool) {
        if connected {
            self.transport_connections.inc();
        } else {
            self.transport_disconnections.inc();
        }
        self.connected.set(if connected { 1 } else { 0 });
    }

    pub fn record_relay(&self, action: &str, outcome: &str) {
        self.relay_commands
            .with_label_values(&[action, outcome])
            .inc();
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.get()
    }

    pub fn messages_malformed(&self) -> u64 {
        self.messages_malformed.get()
    }

    pub fn states_committed(&self) -> u64 {
        self.states_committed.get()
    }

    pub fn suppressed(&self, reason: &str) -> u64 {
        self.states_suppressed.with_label_values(&[reason]).get()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_metrics_register_once_per_registry() {
        let registry = new_registry();
        let metrics = BridgeMetrics::new(registry.clone()).unwrap();
        metrics.inc_received();
        metrics.inc_suppressed("offline");
        metrics.set_connected(true);
        assert_eq!(metrics.messages_received(), 1);
        assert_eq!(metrics.suppressed("offline"), 1);
        assert!(BridgeMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_text_format() {
        let registry = new_registry();
        let metrics = BridgeMetrics::new(registry.clone()).unwrap();
        metrics.inc_committed();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();

        let response = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            prometheus::TEXT_FORMAT
        );
        let body = response.text().await.unwrap();
        assert!(body.contains("dtu_bridge_states_committed_total 1"));

        server.shutdown().await.unwrap();
    }
}
