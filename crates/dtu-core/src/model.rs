//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Typed shape of one OpenDTU live data document.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::{CoreError, Result};

/// One decoded telemetry document. Any subset of the sections may be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverters: Option<Vec<InverterRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtu: Option<Map<String, Value>>,
}

impl TelemetryMessage {
    /// Decode a text frame. Non-object documents and wrongly typed sections are rejected.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(CoreError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn is_empty(&self) -> bool {
        self.inverters.as_ref().map_or(true, |inv| inv.is_empty())
            && self.total.is_none()
            && self.dtu.is_none()
    }
}

/// Per-inverter record; everything except the serial is kept as raw fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InverterRecord {
    #[serde(
        default,
        deserialize_with = "serial_from_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub serial: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl InverterRecord {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }
}

fn serial_from_value<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(serial)) if !serial.trim().is_empty() => Some(serial),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Highest AC/DC/INV index accepted. Larger keys are dropped.
pub const MAX_BLOCK_INDEX: usize = 255;

/// Entries of an AC/DC/INV block, which OpenDTU sends either as an array or
/// as an object keyed by decimal indices. Result is ordered by index.
pub fn indexed_entries(value: &Value) -> Vec<(usize, &Map<String, Value>)> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .take(MAX_BLOCK_INDEX + 1)
            .filter_map(|(index, item)| item.as_object().map(|obj| (index, obj)))
            .collect(),
        Value::Object(map) => {
            let mut entries: Vec<_> = map
                .iter()
                .filter_map(|(key, item)| {
                    let index = key.parse::<usize>().ok().filter(|i| *i <= MAX_BLOCK_INDEX)?;
                    item.as_object().map(|obj| (index, obj))
                })
                .collect();
            entries.sort_by_key(|(index, _)| *index);
            entries
        }
        _ => Vec::new(),
    }
}
