//! ---
//! dtu_section: "05-networking-external-interfaces"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Device transports, control relay and state API."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! MQTT transport: OpenDTU publishes one value per topic below a prefix.
//! Each publish is turned into a single-field telemetry message.

use std::time::Duration;

use async_trait::async_trait;
use dtu_common::config::{MqttConfig, TransportConfig};
use dtu_core::model::{InverterRecord, TelemetryMessage};
use dtu_core::transport::{EventSender, TelemetrySource, TransportEvent};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Channel-0 fields that describe the inverter as a whole rather than phase 1.
const INVERTER_FIELDS: [&str; 5] = ["temperature", "efficiency", "powerdc", "yieldday", "yieldtotal"];

/// Positional decoder for `<prefix>/...` topics.
#[derive(Debug, Clone)]
pub struct MqttTopicDecoder {
    prefix: String,
}

impl MqttTopicDecoder {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_owned(),
        }
    }

    pub fn filter(&self) -> String {
        format!("{}/#", self.prefix)
    }

    /// Decode one publish; unknown topic shapes yield `None`.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Option<TelemetryMessage> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        let value = parse_payload(payload)?;

        match segments.as_slice() {
            ["ac", field] => Some(TelemetryMessage {
                total: Some(single(field, value)),
                ..TelemetryMessage::default()
            }),
            ["dtu", field] => Some(TelemetryMessage {
                dtu: Some(single(field, value)),
                ..TelemetryMessage::default()
            }),
            [serial, "name"] if is_serial(serial) => {
                Some(inverter(InverterRecord::new(*serial).with_field("name", value)))
            }
            [serial, "device" | "status", field] if is_serial(serial) => {
                Some(inverter(InverterRecord::new(*serial).with_field(*field, value)))
            }
            [serial, channel, field] if is_serial(serial) => {
                let channel: usize = channel.parse().ok()?;
                let record = InverterRecord::new(*serial);
                let record = match channel {
                    0 if INVERTER_FIELDS.contains(field) => {
                        record.with_field("INV", json!({ "0": single(field, value) }))
                    }
                    0 => record.with_field("AC", json!({ "0": single(field, value) })),
                    n => record.with_field(
                        "DC",
                        json!({ (n - 1).to_string(): single(field, value) }),
                    ),
                };
                Some(inverter(record))
            }
            _ => None,
        }
    }
}

fn is_serial(segment: &str) -> bool {
    !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric())
        && !matches!(segment, "ac" | "dc" | "dtu")
}

fn single(field: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(field.to_owned(), value);
    map
}

fn inverter(record: InverterRecord) -> TelemetryMessage {
    TelemetryMessage {
        inverters: Some(vec![record]),
        ..TelemetryMessage::default()
    }
}

/// Number first, then boolean words, otherwise the trimmed text.
fn parse_payload(payload: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(number) = text.parse::<i64>() {
        return Some(json!(number));
    }
    if let Ok(number) = text.parse::<f64>() {
        if number.is_finite() {
            return Some(json!(number));
        }
    }
    match text {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => Some(Value::String(text.to_owned())),
    }
}

/// Broker subscription feeding decoded topics to the controller.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    options: MqttOptions,
    decoder: MqttTopicDecoder,
    reconnect_delay: Duration,
}

impl MqttConnector {
    pub fn new(config: &MqttConfig, transport: &TransportConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(config.keep_alive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        Self {
            options,
            decoder: MqttTopicDecoder::new(&config.topic),
            reconnect_delay: transport.reconnect_delay,
        }
    }

    pub async fn run(self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 64);
        let filter = self.decoder.filter();
        let mut connected = false;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(err) = client.try_disconnect() {
                            debug!(error = %err, "mqtt disconnect request failed");
                        }
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(err) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                            warn!(topic = %filter, error = %err, "mqtt subscribe failed");
                        }
                        info!(topic = %filter, "mqtt connected");
                        connected = true;
                        if events.send(TransportEvent::Connected).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match self.decoder.decode(&publish.topic, &publish.payload) {
                            Some(message) => {
                                if events.send(TransportEvent::Message(message)).await.is_err() {
                                    break;
                                }
                            }
                            None => trace!(topic = %publish.topic, "ignoring mqtt topic"),
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "mqtt connection error");
                        if connected {
                            connected = false;
                            if events.send(TransportEvent::Disconnected).await.is_err() {
                                break;
                            }
                        }
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        if connected {
            let _ = events.send(TransportEvent::Disconnected).await;
        }
        debug!("mqtt connector stopped");
    }
}

#[async_trait]
impl TelemetrySource for MqttConnector {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn run(
        self: Box<Self>,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        MqttConnector::run(*self, events, shutdown).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtu_core::flatten::{flatten, PlanStep};

    fn state_paths(message: &TelemetryMessage) -> Vec<String> {
        flatten(message)
            .into_iter()
            .filter_map(|step| match step {
                PlanStep::Value(entry) => Some(entry.state_path().to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decodes_phase_and_input_topics() {
        let decoder = MqttTopicDecoder::new("solar/");
        assert_eq!(decoder.filter(), "solar/#");

        let ac = decoder.decode("solar/1141/0/power", b"120.5").unwrap();
        assert_eq!(state_paths(&ac), vec!["1141.ac.phase_1.power"]);

        let inv = decoder.decode("solar/1141/0/yieldtotal", b"321.1").unwrap();
        assert_eq!(state_paths(&inv), vec!["1141.yieldtotal"]);

        let dc = decoder.decode("solar/1141/2/voltage", b"31.2").unwrap();
        assert_eq!(state_paths(&dc), vec!["1141.dc.input_2.voltage"]);
    }

    #[test]
    fn decodes_status_device_and_sections() {
        let decoder = MqttTopicDecoder::new("solar");

        let status = decoder.decode("solar/1141/status/reachable", b"0").unwrap();
        let plan = flatten(&status);
        assert!(plan.iter().any(|step| matches!(
            step,
            PlanStep::Reachability { reachable: false, .. }
        )));

        let name = decoder.decode("solar/1141/name", b"Garage").unwrap();
        assert_eq!(state_paths(&name), vec!["1141.name"]);

        let device = decoder.decode("solar/1141/device/hwversion", b"1.0.0").unwrap();
        assert_eq!(state_paths(&device), vec!["1141.hwversion"]);

        let total = decoder.decode("solar/ac/power", b"900").unwrap();
        assert_eq!(state_paths(&total), vec!["total.power"]);

        let dtu = decoder.decode("solar/dtu/rssi", b"-61").unwrap();
        assert_eq!(state_paths(&dtu), vec!["dtu.sta_rssi"]);
    }

    #[test]
    fn ignores_foreign_and_unknown_topics() {
        let decoder = MqttTopicDecoder::new("solar");
        assert!(decoder.decode("other/1141/0/power", b"1").is_none());
        assert!(decoder.decode("solar/1141/x/power", b"1").is_none());
        assert!(decoder.decode("solar/1141/0/power", b"").is_none());
        assert!(decoder.decode("solar/a/b/c/d", b"1").is_none());
    }

    #[test]
    fn payload_parsing_prefers_numbers() {
        assert_eq!(parse_payload(b"42"), Some(json!(42)));
        assert_eq!(parse_payload(b" 4.5 "), Some(json!(4.5)));
        assert_eq!(parse_payload(b"true"), Some(json!(true)));
        assert_eq!(parse_payload(b"online"), Some(json!("online")));
    }
}
