//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::model::TelemetryMessage;

/// Events published by a telemetry transport to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Raw text frame, decoded by the controller.
    Frame(String),
    /// Message already assembled by the transport (MQTT topics, HTTP poll merge).
    Message(TelemetryMessage),
}

pub type EventSender = mpsc::Sender<TransportEvent>;

/// Unified interface implemented by the WebSocket, MQTT and HTTP poll connectors.
#[async_trait]
pub trait TelemetrySource: Send {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` flips to `true`. Connection failures are handled
    /// internally; an error means the source cannot run at all.
    async fn run(
        self: Box<Self>,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}
