//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Static state descriptor table.
//!
//! Every field the bridge understands is described once here, keyed by its
//! canonical lower-cased key (`ac_power`, `inv_temperature`, `dtu_uptime`, ...).
//! The `id` is relative to the record root (inverter serial, `total` or `dtu`)
//! and may contain the `%count%` placeholder for repeated structures.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control::ControlAction;
use crate::store::{ObjectDefinition, ObjectKind};

/// Declared type of a state's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Number,
    Boolean,
    Text,
}

/// Pure getter applied to a raw telemetry value before it is guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTransform {
    /// OpenDTU `{ "v": .., "u": .., "d": .. }` measurement; yields `v`.
    Measurement,
    /// Label carried in the unit slot, e.g. DC input names `{ "u": "South" }`.
    Label,
    /// Boolean flag that may arrive as bool, number or string.
    Flag,
    /// Anything rendered as text.
    Text,
}

impl ValueTransform {
    /// Returns `None` when the raw value has no usable representation.
    pub fn apply(&self, raw: &Value) -> Option<Value> {
        match self {
            ValueTransform::Measurement => match raw {
                Value::Object(map) => map.get("v").filter(|v| !v.is_null()).cloned(),
                Value::Number(_) | Value::Bool(_) => Some(raw.clone()),
                Value::String(text) => text
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                _ => None,
            },
            ValueTransform::Label => match raw {
                Value::Object(map) => map.get("u").and_then(Value::as_str).map(Value::from),
                Value::String(_) => Some(raw.clone()),
                _ => None,
            },
            ValueTransform::Flag => parse_flag(raw).map(Value::Bool),
            ValueTransform::Text => match raw {
                Value::String(_) => Some(raw.clone()),
                Value::Number(number) => Some(Value::String(number.to_string())),
                Value::Bool(flag) => Some(Value::String(flag.to_string())),
                _ => None,
            },
        }
    }
}

/// Interpret bools, `0`/`1` and `"true"`/`"false"` as a flag.
pub fn parse_flag(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_f64().map(|n| n != 0.0),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Some(true),
            "false" | "0" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateDescriptor {
    pub key: &'static str,
    pub id: &'static str,
    pub name: &'static str,
    pub role: &'static str,
    pub kind: ValueKind,
    pub unit: Option<&'static str>,
    pub writable: bool,
    pub transform: Option<ValueTransform>,
    pub command: Option<ControlAction>,
}

impl StateDescriptor {
    fn new(key: &'static str, id: &'static str, name: &'static str, kind: ValueKind) -> Self {
        let (role, transform) = match kind {
            ValueKind::Number => ("value", Some(ValueTransform::Measurement)),
            ValueKind::Boolean => ("indicator", Some(ValueTransform::Flag)),
            ValueKind::Text => ("text", Some(ValueTransform::Text)),
        };
        Self {
            key,
            id,
            name,
            role,
            kind,
            unit: None,
            writable: false,
            transform,
            command: None,
        }
    }

    fn number(key: &'static str, id: &'static str, name: &'static str) -> Self {
        Self::new(key, id, name, ValueKind::Number)
    }

    fn flag(key: &'static str, id: &'static str, name: &'static str) -> Self {
        Self::new(key, id, name, ValueKind::Boolean)
    }

    fn text(key: &'static str, id: &'static str, name: &'static str) -> Self {
        Self::new(key, id, name, ValueKind::Text)
    }

    fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    fn role(mut self, role: &'static str) -> Self {
        self.role = role;
        self
    }

    fn transform(mut self, transform: ValueTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    fn command(mut self, action: ControlAction) -> Self {
        self.writable = true;
        self.command = Some(action);
        self
    }

    /// Run the getter, or pass the raw value through when there is none.
    pub fn read(&self, raw: &Value) -> Option<Value> {
        match &self.transform {
            Some(transform) => transform.apply(raw),
            None => Some(raw.clone()),
        }
    }

    /// Object metadata used when the state is materialized.
    pub fn definition(&self) -> ObjectDefinition {
        ObjectDefinition {
            kind: ObjectKind::State,
            name: self.name.to_owned(),
            description: None,
            role: Some(self.role.to_owned()),
            value_kind: Some(self.kind),
            unit: self.unit.map(str::to_owned),
            writable: self.writable,
        }
    }
}

fn build_table() -> Vec<StateDescriptor> {
    use StateDescriptor as D;

    vec![
        // inverter root
        D::text("name", "name", "Name"),
        D::number("data_age", "data_age", "Data age").unit("s"),
        D::flag("poll_enabled", "poll_enabled", "Polling enabled"),
        D::flag("reachable", "available", "Reachable").role("indicator.reachable"),
        D::flag("producing", "producing", "Producing").role("indicator.working"),
        D::number("limit_relative", "limit_relative", "Limit relative").unit("%"),
        D::number("limit_absolute", "limit_absolute", "Limit absolute").unit("W"),
        D::number("events", "events", "Event log entries"),
        D::text("hwpartnumber", "hwpartnumber", "Hardware part number"),
        D::text("hwversion", "hwversion", "Hardware version"),
        D::text("fwbuildversion", "fwbuildversion", "Firmware build version"),
        D::text("fwbuilddatetime", "fwbuilddatetime", "Firmware build date"),
        D::text("bootloaderversion", "bootloaderversion", "Bootloader version"),
        // power control
        D::number(
            "limit_persistent_relative",
            "power_control.limit_persistent_relative",
            "Limit persistent relative",
        )
        .unit("%")
        .role("level")
        .command(ControlAction::LimitPersistentRelative),
        D::number(
            "limit_persistent_absolute",
            "power_control.limit_persistent_absolute",
            "Limit persistent absolute",
        )
        .unit("W")
        .role("level")
        .command(ControlAction::LimitPersistentAbsolute),
        D::number(
            "limit_nonpersistent_relative",
            "power_control.limit_nonpersistent_relative",
            "Limit non-persistent relative",
        )
        .unit("%")
        .role("level")
        .command(ControlAction::LimitNonPersistentRelative),
        D::number(
            "limit_nonpersistent_absolute",
            "power_control.limit_nonpersistent_absolute",
            "Limit non-persistent absolute",
        )
        .unit("W")
        .role("level")
        .command(ControlAction::LimitNonPersistentAbsolute),
        D::flag("power_on", "power_control.power_on", "Power on")
            .role("button")
            .command(ControlAction::PowerOn),
        D::flag("power_off", "power_control.power_off", "Power off")
            .role("button")
            .command(ControlAction::PowerOff),
        D::flag("restart", "power_control.restart", "Restart")
            .role("button")
            .command(ControlAction::Restart),
        // AC phases
        D::number("ac_power", "ac.phase_%count%.power", "Power")
            .unit("W")
            .role("value.power"),
        D::number("ac_voltage", "ac.phase_%count%.voltage", "Voltage")
            .unit("V")
            .role("value.voltage"),
        D::number("ac_current", "ac.phase_%count%.current", "Current")
            .unit("A")
            .role("value.current"),
        D::number("ac_frequency", "ac.phase_%count%.frequency", "Frequency")
            .unit("Hz")
            .role("value.frequency"),
        D::number("ac_powerfactor", "ac.phase_%count%.power_factor", "Power factor"),
        D::number(
            "ac_reactivepower",
            "ac.phase_%count%.reactive_power",
            "Reactive power",
        )
        .unit("var")
        .role("value.power.reactive"),
        // DC inputs
        D::text("dc_name", "dc.input_%count%.name", "Name").transform(ValueTransform::Label),
        D::number("dc_power", "dc.input_%count%.power", "Power")
            .unit("W")
            .role("value.power"),
        D::number("dc_voltage", "dc.input_%count%.voltage", "Voltage")
            .unit("V")
            .role("value.voltage"),
        D::number("dc_current", "dc.input_%count%.current", "Current")
            .unit("A")
            .role("value.current"),
        D::number("dc_yieldday", "dc.input_%count%.yieldday", "Yield day")
            .unit("Wh")
            .role("value.energy"),
        D::number("dc_yieldtotal", "dc.input_%count%.yieldtotal", "Yield total")
            .unit("kWh")
            .role("value.energy"),
        D::number("dc_irradiation", "dc.input_%count%.irradiation", "Irradiation").unit("%"),
        // inverter block
        D::number("inv_temperature", "temperature", "Temperature")
            .unit("°C")
            .role("value.temperature"),
        D::number("inv_power dc", "power_dc", "Power DC")
            .unit("W")
            .role("value.power"),
        D::number("inv_powerdc", "power_dc", "Power DC")
            .unit("W")
            .role("value.power"),
        D::number("inv_yieldday", "yieldday", "Yield day")
            .unit("Wh")
            .role("value.energy"),
        D::number("inv_yieldtotal", "yieldtotal", "Yield total")
            .unit("kWh")
            .role("value.energy"),
        D::number("inv_efficiency", "efficiency", "Efficiency").unit("%"),
        // totals
        D::number("total_power", "power", "Total power")
            .unit("W")
            .role("value.power"),
        D::number("total_yieldday", "yieldday", "Total yield day")
            .unit("Wh")
            .role("value.energy"),
        D::number("total_yieldtotal", "yieldtotal", "Total yield")
            .unit("kWh")
            .role("value.energy"),
        // dtu
        D::text("dtu_hostname", "hostname", "Hostname"),
        D::number("dtu_uptime", "uptime", "Uptime").unit("s"),
        D::text("dtu_sdkversion", "sdkversion", "SDK version"),
        D::text("dtu_git_hash", "git_hash", "Firmware revision"),
        D::number("dtu_heap_total", "heap_total", "Heap total").unit("B"),
        D::number("dtu_heap_used", "heap_used", "Heap used").unit("B"),
        D::number("dtu_cpu_freq", "cpu_freq", "CPU frequency").unit("MHz"),
        D::number("dtu_sta_rssi", "sta_rssi", "WiFi RSSI")
            .unit("dBm")
            .role("value.signal"),
        D::number("dtu_rssi", "sta_rssi", "WiFi RSSI")
            .unit("dBm")
            .role("value.signal"),
        D::text("dtu_sta_ssid", "sta_ssid", "WiFi SSID"),
        D::text("dtu_network_ip", "network_ip", "IP address"),
        D::text("dtu_ip", "network_ip", "IP address"),
        D::flag("dtu_reachable", "available", "Reachable").role("indicator.reachable"),
        // adapter
        D::flag("info_connection", "connection", "Device or service connected")
            .role("indicator.connected"),
    ]
}

static DESCRIPTORS: Lazy<HashMap<&'static str, StateDescriptor>> = Lazy::new(|| {
    build_table()
        .into_iter()
        .map(|descriptor| (descriptor.key, descriptor))
        .collect()
});

/// Keys of the power-control states, in creation order.
pub const POWER_CONTROL_KEYS: [&str; 7] = [
    "limit_persistent_relative",
    "limit_persistent_absolute",
    "limit_nonpersistent_relative",
    "limit_nonpersistent_absolute",
    "power_on",
    "power_off",
    "restart",
];

/// Look up a descriptor by canonical key. Lookup is case-insensitive.
pub fn descriptor_for(key: &str) -> Option<&'static StateDescriptor> {
    DESCRIPTORS
        .get(key)
        .or_else(|| DESCRIPTORS.get(key.to_lowercase().as_str()))
}

pub fn power_control_descriptors() -> impl Iterator<Item = &'static StateDescriptor> {
    POWER_CONTROL_KEYS.iter().filter_map(|key| descriptor_for(key))
}
