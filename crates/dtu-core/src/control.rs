//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Mapping of user writes on `<serial>.power_control.*` to device commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};

use crate::descriptor::descriptor_for;
use crate::errors::Result;
use crate::path::DevicePath;

pub const LIMIT_ENDPOINT: &str = "/api/limit/config";
pub const POWER_ENDPOINT: &str = "/api/power/config";

const CONTROL_CHANNEL: &str = "power_control";

/// Control operations exposed on every inverter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    LimitPersistentRelative,
    LimitPersistentAbsolute,
    LimitNonPersistentRelative,
    LimitNonPersistentAbsolute,
    PowerOn,
    PowerOff,
    Restart,
}

impl ControlAction {
    /// OpenDTU `limit_type` code for limit actions.
    pub fn limit_type(&self) -> Option<u16> {
        match self {
            ControlAction::LimitPersistentRelative => Some(257),
            ControlAction::LimitPersistentAbsolute => Some(256),
            ControlAction::LimitNonPersistentRelative => Some(1),
            ControlAction::LimitNonPersistentAbsolute => Some(0),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> &'static str {
        if self.limit_type().is_some() {
            LIMIT_ENDPOINT
        } else {
            POWER_ENDPOINT
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::LimitPersistentRelative => "limit_persistent_relative",
            ControlAction::LimitPersistentAbsolute => "limit_persistent_absolute",
            ControlAction::LimitNonPersistentRelative => "limit_nonpersistent_relative",
            ControlAction::LimitNonPersistentAbsolute => "limit_nonpersistent_absolute",
            ControlAction::PowerOn => "power_on",
            ControlAction::PowerOff => "power_off",
            ControlAction::Restart => "restart",
        }
    }
}

/// A fully resolved command addressed to one inverter.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    pub serial: String,
    pub action: ControlAction,
    /// Limit as written; integers stay integers on the wire.
    pub limit_value: Option<Number>,
}

impl ControlCommand {
    pub fn endpoint(&self) -> &'static str {
        self.action.endpoint()
    }

    /// JSON document sent as the `data` form field.
    pub fn payload(&self) -> Value {
        match (self.action, self.action.limit_type()) {
            (_, Some(limit_type)) => json!({
                "serial": self.serial,
                "limit_type": limit_type,
                "limit_value": self.limit_value.clone().unwrap_or_else(|| Number::from(0)),
            }),
            (ControlAction::PowerOn, None) => json!({ "serial": self.serial, "power": true }),
            (ControlAction::PowerOff, None) => json!({ "serial": self.serial, "power": false }),
            (_, None) => json!({ "serial": self.serial, "restart": true }),
        }
    }
}

/// Outcome of interpreting a user write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteIntent {
    Command(ControlCommand),
    /// Control path with a value that cannot be sent; the write stays unacknowledged.
    Rejected { path: DevicePath, reason: String },
    /// Not a power-control state.
    Ignored,
}

/// Interpret an unacknowledged write on `path`.
pub fn interpret_write(path: &DevicePath, value: &Value) -> WriteIntent {
    let segments: Vec<&str> = path.segments().collect();
    let [serial, channel, field] = segments.as_slice() else {
        return WriteIntent::Ignored;
    };
    if serial.is_empty() || *channel != CONTROL_CHANNEL {
        return WriteIntent::Ignored;
    }
    let Some(action) = descriptor_for(field).and_then(|descriptor| descriptor.command) else {
        return WriteIntent::Ignored;
    };

    let limit_value = if action.limit_type().is_some() {
        match numeric(value) {
            Some(limit) => Some(limit),
            None => {
                return WriteIntent::Rejected {
                    path: path.clone(),
                    reason: format!("limit value {value} is not numeric"),
                }
            }
        }
    } else {
        None
    };

    WriteIntent::Command(ControlCommand {
        serial: (*serial).to_owned(),
        action,
        limit_value,
    })
}

fn numeric(value: &Value) -> Option<Number> {
    match value {
        Value::Number(number) => Some(number.clone()),
        Value::String(text) => {
            let text = text.trim();
            match text.parse::<i64>() {
                Ok(limit) => Some(Number::from(limit)),
                Err(_) => text.parse::<f64>().ok().and_then(Number::from_f64),
            }
        }
        _ => None,
    }
}

/// Outbound side of the relay, implemented by the HTTP client in `dtu-net`.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn dispatch(&self, command: &ControlCommand) -> Result<()>;
}
