//! ---
//! dtu_section: "05-networking-external-interfaces"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Device transports, control relay and state API."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Network edges of the bridge: telemetry transports, the HTTP control relay
//! and the local REST state API.

pub mod mqtt;
pub mod poll;
pub mod relay;
pub mod rest;
pub mod websocket;

use anyhow::{anyhow, Result};
use dtu_common::config::{AppConfig, TransportKind};
use dtu_core::TelemetrySource;

pub use mqtt::{MqttConnector, MqttTopicDecoder};
pub use poll::{HttpPoller, PollRound};
pub use relay::{HttpControlRelay, RelayError};
pub use rest::{RestApiBuilder, RestApiHandle, StateEntry, StateWrite};
pub use websocket::{ConnectionState, LinkStateMachine, LinkTimings, WebSocketConnector};

/// Build the telemetry source selected by `transport.kind`.
pub fn source_from_config(config: &AppConfig) -> Result<Box<dyn TelemetrySource>> {
    match config.transport.kind {
        TransportKind::Websocket => Ok(Box::new(WebSocketConnector::new(
            &config.device,
            &config.transport,
        ))),
        TransportKind::Mqtt => {
            let mqtt = config
                .mqtt
                .as_ref()
                .ok_or_else(|| anyhow!("transport kind 'mqtt' requires an [mqtt] section"))?;
            Ok(Box::new(MqttConnector::new(mqtt, &config.transport)))
        }
        TransportKind::HttpPoll => Ok(Box::new(HttpPoller::new(
            &config.device,
            &config.transport,
        )?)),
    }
}
