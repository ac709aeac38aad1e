//! ---
//! dtu_section: "01-core-functionality"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Shared primitives and utilities for the bridge runtime."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Shared primitives for the OpenDTU bridge workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! the daemon and the transport crates.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, BridgeConfig, DeviceConfig, LoggingConfig, MaintenanceConfig,
    MetricsConfig, MqttConfig, Scheme, TransportConfig, TransportKind, YieldGuardPolicy,
};
pub use logging::{init_tracing, LogFormat};
