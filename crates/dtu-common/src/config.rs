//! ---
//! dtu_section: "01-core-functionality"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Shared primitives and utilities for the bridge runtime."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_port() -> u16 {
    80
}

fn default_username() -> String {
    "admin".to_owned()
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_pong_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "opendtu-bridge".to_owned()
}

fn default_mqtt_topic() -> String {
    "solar".to_owned()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_day_end() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 30).unwrap_or(NaiveTime::MIN)
}

fn default_post_midnight() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 30).unwrap_or(NaiveTime::MIN)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8089))
}

/// Primary configuration object for the bridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "DTU_BRIDGE_CONFIG";

    /// Load configuration from disk, respecting the `DTU_BRIDGE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.transport.validate()?;
        if self.transport.kind == TransportKind::Mqtt {
            let mqtt = self
                .mqtt
                .as_ref()
                .ok_or_else(|| anyhow!("transport kind 'mqtt' requires an [mqtt] section"))?;
            mqtt.validate()?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// URL scheme used to reach the device web UI.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn http(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn websocket(&self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }
}

/// Connection details of the OpenDTU web interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::default(),
            host: String::new(),
            port: default_port(),
            username: default_username(),
            password: None,
        }
    }
}

impl DeviceConfig {
    /// Base URL of the HTTP API, e.g. `http://192.168.1.20:80`.
    pub fn http_base(&self) -> String {
        format!("{}://{}:{}", self.scheme.http(), self.host, self.port)
    }

    /// Live data WebSocket endpoint.
    pub fn livedata_url(&self) -> String {
        format!(
            "{}://{}:{}/livedata",
            self.scheme.websocket(),
            self.host,
            self.port
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("device.host must be configured"));
        }
        if self.port == 0 {
            return Err(anyhow!("device.port must be non-zero"));
        }
        Ok(())
    }
}

/// Telemetry transport strategies.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Websocket,
    Mqtt,
    HttpPoll,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_ping_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ping_interval: Duration,
    #[serde(default = "default_pong_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub pong_grace: Duration,
    #[serde(default = "default_reconnect_delay", rename = "reconnect_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            ping_interval: default_ping_interval(),
            pong_grace: default_pong_grace(),
            reconnect_delay: default_reconnect_delay(),
            poll_interval: default_poll_interval(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval.is_zero() {
            return Err(anyhow!("transport.ping_interval must be non-zero"));
        }
        if self.kind == TransportKind::HttpPoll && self.poll_interval.is_zero() {
            return Err(anyhow!("transport.poll_interval must be non-zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
}

impl MqttConfig {
    pub fn validate(&self) -> Result<()> {
        if self.broker_host.trim().is_empty() {
            return Err(anyhow!("mqtt.broker_host must be configured"));
        }
        if self.topic.trim().trim_matches('/').is_empty() {
            return Err(anyhow!("mqtt.topic must not be empty"));
        }
        if self.keep_alive < Duration::from_secs(1) {
            return Err(anyhow!("mqtt.keep_alive must be at least one second"));
        }
        Ok(())
    }
}

/// Policy used to guard yield counters against regressions.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum YieldGuardPolicy {
    /// Commit only values strictly greater than the last committed one.
    #[default]
    Monotonic,
    /// Reject non-positive values without consulting prior state.
    PositiveOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_true")]
    pub zero_on_offline: bool,
    #[serde(default)]
    pub protect_names: bool,
    #[serde(default)]
    pub yield_guard: YieldGuardPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            zero_on_offline: true,
            protect_names: false,
            yield_guard: YieldGuardPolicy::default(),
        }
    }
}

/// Local wall-clock times of the daily yield maintenance jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_day_end")]
    pub day_end: NaiveTime,
    #[serde(default = "default_post_midnight")]
    pub post_midnight: NaiveTime,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            day_end: default_day_end(),
            post_midnight: default_post_midnight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_logging: bool,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            file_logging: false,
            directory: default_logging_directory(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_api_listen(),
        }
    }
}
