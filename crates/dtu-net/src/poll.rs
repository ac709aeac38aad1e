//! ---
//! dtu_section: "05-networking-external-interfaces"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Device transports, control relay and state API."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Polling transport for devices where the live data socket is unavailable.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dtu_common::config::{DeviceConfig, TransportConfig};
use dtu_core::model::TelemetryMessage;
use dtu_core::transport::{EventSender, TelemetrySource, TransportEvent};
use dtu_rt::RateLimiter;
use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

pub const LIVEDATA_ENDPOINT: &str = "/api/livedata/status";
pub const SYSTEM_ENDPOINT: &str = "/api/system/status";
pub const NETWORK_ENDPOINT: &str = "/api/network/status";

/// Result of one polling round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollRound {
    /// Inverters and totals, absent when the live data request failed.
    pub livedata: Option<TelemetryMessage>,
    /// System and network status merged, always carrying `reachable`.
    pub dtu: Map<String, Value>,
}

impl PollRound {
    pub fn into_message(self) -> TelemetryMessage {
        let mut message = self.livedata.unwrap_or_default();
        message.dtu = Some(self.dtu);
        message
    }
}

#[derive(Debug, Clone)]
pub struct HttpPoller {
    client: Client,
    base: Url,
    credentials: Option<(String, String)>,
    interval: Duration,
}

impl HttpPoller {
    pub fn new(device: &DeviceConfig, transport: &TransportConfig) -> Result<Self> {
        let base = Url::parse(&device.http_base())
            .with_context(|| format!("invalid device address {}", device.http_base()))?;
        let mut poller = Self::with_base(base, transport.poll_interval, transport.request_timeout)?;
        if let Some(password) = &device.password {
            poller = poller.with_credentials(&device.username, password);
        }
        Ok(poller)
    }

    pub fn with_base(base: Url, interval: Duration, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base,
            credentials: None,
            interval,
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    async fn fetch(&self, endpoint: &str) -> Result<Value> {
        let url = self
            .base
            .join(endpoint)
            .with_context(|| format!("invalid endpoint {endpoint}"))?;
        let mut request = self.client.get(url);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json::<Value>().await?)
    }

    /// Query all three endpoints once.
    pub async fn poll_once(&self) -> PollRound {
        let livedata = match self.fetch(LIVEDATA_ENDPOINT).await {
            Ok(value) => match TelemetryMessage::from_value(value) {
                Ok(message) => Some(message),
                Err(err) => {
                    debug!(error = %err, "live data response is not a telemetry document");
                    None
                }
            },
            Err(err) => {
                debug!(endpoint = LIVEDATA_ENDPOINT, error = %err, "poll request failed");
                None
            }
        };

        let mut dtu = Map::new();
        let mut reachable = false;
        for endpoint in [SYSTEM_ENDPOINT, NETWORK_ENDPOINT] {
            match self.fetch(endpoint).await.and_then(into_object) {
                Ok(fields) => {
                    reachable = true;
                    dtu.extend(fields);
                }
                Err(err) => debug!(endpoint, error = %err, "poll request failed"),
            }
        }
        dtu.insert("reachable".to_owned(), Value::Bool(reachable));

        PollRound { livedata, dtu }
    }

    pub async fn run(self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let mut limiter = RateLimiter::new(self.interval);
        let mut connected = false;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = limiter.tick() => {}
            }

            let round = self.poll_once().await;
            let online = round.livedata.is_some();
            if online != connected {
                connected = online;
                let event = if online {
                    info!(base = %self.base, "device polling established");
                    TransportEvent::Connected
                } else {
                    TransportEvent::Disconnected
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            if events
                .send(TransportEvent::Message(round.into_message()))
                .await
                .is_err()
            {
                break;
            }
        }

        if connected {
            let _ = events.send(TransportEvent::Disconnected).await;
        }
        debug!("http poller stopped");
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a json object, got {other}")),
    }
}

#[async_trait]
impl TelemetrySource for HttpPoller {
    fn name(&self) -> &'static str {
        "http-poll"
    }

    async fn run(
        self: Box<Self>,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        HttpPoller::run(*self, events, shutdown).await;
        Ok(())
    }
}
