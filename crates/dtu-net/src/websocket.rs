//! ---
//! dtu_section: "05-networking-external-interfaces"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Device transports, control relay and state API."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Live data WebSocket client with heartbeat and fixed-delay reconnect.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dtu_common::config::{DeviceConfig, TransportConfig};
use dtu_core::transport::{EventSender, TelemetrySource, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    ReconnectPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    pub ping_interval: Duration,
    pub pong_grace: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl From<&TransportConfig> for LinkTimings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            pong_grace: config.pong_grace,
            reconnect_delay: config.reconnect_delay,
            connect_timeout: config.request_timeout,
        }
    }
}

/// Connection state plus the three timer deadlines of one live link.
///
/// The machine is pure; the connector drives it with the current instant and
/// sleeps until whichever deadline is set.
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: ConnectionState,
    timings: LinkTimings,
    ping_at: Option<Instant>,
    pong_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl LinkStateMachine {
    pub fn new(timings: LinkTimings) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            timings,
            ping_at: None,
            pong_deadline: None,
            reconnect_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn ping_deadline(&self) -> Option<Instant> {
        self.ping_at
    }

    pub fn pong_deadline(&self) -> Option<Instant> {
        self.pong_deadline
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;
    }

    /// Socket open: ping right away and arm the pong deadline.
    pub fn on_open(&mut self, now: Instant) {
        self.state = ConnectionState::Connected;
        self.ping_at = Some(now);
        self.arm_pong(now);
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.ping_at = Some(now + self.timings.ping_interval);
    }

    /// A pong or data frame proves the peer is alive.
    pub fn on_activity(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            self.arm_pong(now);
        }
    }

    pub fn heartbeat_expired(&self, now: Instant) -> bool {
        self.pong_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Close path. Heartbeat timers are always cleared; a reconnect is only
    /// scheduled once the socket is fully closed and replaces any pending one.
    pub fn on_close(&mut self, now: Instant, fully_closed: bool) {
        self.ping_at = None;
        self.pong_deadline = None;
        if fully_closed {
            self.state = ConnectionState::ReconnectPending;
            self.reconnect_at = Some(now + self.timings.reconnect_delay);
        } else if self.state != ConnectionState::ReconnectPending {
            self.state = ConnectionState::Closing;
        }
    }

    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.ping_at = None;
        self.pong_deadline = None;
        self.reconnect_at = None;
    }

    fn arm_pong(&mut self, now: Instant) {
        self.pong_deadline = Some(now + self.timings.ping_interval + self.timings.pong_grace);
    }
}

enum DriveExit {
    Closed,
    Shutdown,
}

/// OpenDTU `/livedata` WebSocket source.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    authorization: Option<String>,
    timings: LinkTimings,
}

impl WebSocketConnector {
    pub fn new(device: &DeviceConfig, transport: &TransportConfig) -> Self {
        let authorization = device
            .password
            .as_deref()
            .map(|password| basic_auth(&device.username, password));
        Self {
            url: device.livedata_url(),
            authorization,
            timings: LinkTimings::from(transport),
        }
    }

    pub fn with_url(url: impl Into<String>, timings: LinkTimings) -> Self {
        Self {
            url: url.into(),
            authorization: None,
            timings,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.authorization = Some(basic_auth(username, password));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> anyhow::Result<Socket> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket url {}", self.url))?;
        if let Some(authorization) = &self.authorization {
            request
                .headers_mut()
                .insert(header::AUTHORIZATION, HeaderValue::from_str(authorization)?);
        }
        let (socket, _response) = tokio::time::timeout(self.timings.connect_timeout, connect_async(request))
            .await
            .context("websocket connect timed out")??;
        Ok(socket)
    }

    /// Connect, stream frames and reconnect until shutdown.
    pub async fn run(self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let mut link = LinkStateMachine::new(self.timings);

        while !*shutdown.borrow() {
            link.begin_connect();
            debug!(url = %self.url, "connecting to live data websocket");
            let attempt = tokio::select! {
                _ = shutdown.changed() => break,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(socket) => {
                    link.on_open(Instant::now());
                    info!(url = %self.url, "live data websocket connected");
                    if events.send(TransportEvent::Connected).await.is_err() {
                        break;
                    }
                    let exit = drive(socket, &mut link, &events, &mut shutdown).await;
                    let _ = events.send(TransportEvent::Disconnected).await;
                    if matches!(exit, DriveExit::Shutdown) {
                        break;
                    }
                }
                Err(err) => {
                    debug!(url = %self.url, error = %err, "websocket connection failed");
                    link.on_close(Instant::now(), true);
                }
            }

            let Some(deadline) = link.reconnect_deadline() else {
                continue;
            };
            debug!(delay_ms = self.timings.reconnect_delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep_until(deadline) => {}
            }
        }

        link.shutdown();
        debug!(url = %self.url, "websocket connector stopped");
    }
}

async fn drive(
    mut socket: Socket,
    link: &mut LinkStateMachine,
    events: &EventSender,
    shutdown: &mut watch::Receiver<bool>,
) -> DriveExit {
    loop {
        let ping_at = link.ping_deadline();
        let pong_deadline = link.pong_deadline();

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    link.on_close(Instant::now(), false);
                    if let Err(err) = socket.close(None).await {
                        debug!(error = %err, "websocket close on shutdown failed");
                    }
                    return DriveExit::Shutdown;
                }
            }
            message = socket.next() => {
                let now = Instant::now();
                match message {
                    Some(Ok(Message::Text(text))) => {
                        link.on_activity(now);
                        if events.send(TransportEvent::Frame(text)).await.is_err() {
                            return DriveExit::Shutdown;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        link.on_activity(now);
                        match String::from_utf8(bytes) {
                            Ok(text) => {
                                if events.send(TransportEvent::Frame(text)).await.is_err() {
                                    return DriveExit::Shutdown;
                                }
                            }
                            Err(err) => debug!(error = %err, "ignoring non-utf8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => link.on_activity(now),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "websocket close frame received");
                        link.on_close(now, false);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket stream error");
                        link.on_close(now, true);
                        return DriveExit::Closed;
                    }
                    None => {
                        debug!("websocket stream ended");
                        link.on_close(now, true);
                        return DriveExit::Closed;
                    }
                }
            }
            _ = sleep_until_opt(ping_at) => {
                let now = Instant::now();
                if let Err(err) = socket.send(Message::Ping(Vec::new())).await {
                    debug!(error = %err, "websocket ping failed");
                    link.on_close(now, true);
                    return DriveExit::Closed;
                }
                link.on_ping_sent(now);
            }
            _ = sleep_until_opt(pong_deadline) => {
                let now = Instant::now();
                if link.heartbeat_expired(now) {
                    debug!("no pong within deadline, terminating websocket");
                    link.on_close(now, true);
                    return DriveExit::Closed;
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub(crate) fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[async_trait]
impl TelemetrySource for WebSocketConnector {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn run(
        self: Box<Self>,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        WebSocketConnector::run(*self, events, shutdown).await;
        Ok(())
    }
}
