//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Turns one telemetry message into an ordered materialization plan.
//!
//! The flattener is pure: it never touches the store. The controller walks the
//! returned steps in order, so objects always precede the values written below
//! them and the reachability transition of an inverter precedes its values.

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::descriptor::{descriptor_for, parse_flag, power_control_descriptors, StateDescriptor};
use crate::model::{indexed_entries, InverterRecord, TelemetryMessage};
use crate::path::DevicePath;
use crate::store::ObjectDefinition;

pub const TOTAL_ROOT: &str = "total";
pub const DTU_ROOT: &str = "dtu";

const REACHABLE: &str = "reachable";

#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    /// Device or channel (or fixed state) that must exist before anything below it.
    Materialize {
        path: DevicePath,
        definition: ObjectDefinition,
    },
    /// Offline-set transition for an inverter.
    Reachability { serial: String, reachable: bool },
    Value(FlatEntry),
}

/// One `(path, raw value)` pair with a known descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatEntry {
    /// Record root the descriptor id is relative to.
    pub root: DevicePath,
    /// Channel the field was found in.
    pub channel: DevicePath,
    pub key: String,
    pub index: Option<usize>,
    pub raw: Value,
    pub descriptor: &'static StateDescriptor,
}

impl FlatEntry {
    /// Channel-relative path as emitted, e.g. `<serial>.ac.phase_1.ac_power`.
    pub fn emitted_path(&self) -> DevicePath {
        self.channel.child(&self.key)
    }

    /// Materialized state path, e.g. `<serial>.ac.phase_1.power`.
    pub fn state_path(&self) -> DevicePath {
        self.root.resolve(self.descriptor.id, self.index)
    }
}

/// Build the plan for a whole message: inverters first, then `total`, then `dtu`.
pub fn flatten(message: &TelemetryMessage) -> Vec<PlanStep> {
    let mut plan = Vec::new();

    for record in message.inverters.iter().flatten() {
        flatten_inverter(record, &mut plan);
    }

    if let Some(total) = &message.total {
        let root = DevicePath::new(TOTAL_ROOT);
        plan.push(PlanStep::Materialize {
            path: root.clone(),
            definition: ObjectDefinition::channel("Total", Some("Sum over all inverters")),
        });
        push_fields(&mut plan, &root, &root, "total_", None, total);
    }

    if let Some(dtu) = &message.dtu {
        let root = DevicePath::new(DTU_ROOT);
        plan.push(PlanStep::Materialize {
            path: root.clone(),
            definition: ObjectDefinition::device("OpenDTU Device", None),
        });
        push_fields(&mut plan, &root, &root, "dtu_", None, dtu);
    }

    plan
}

fn flatten_inverter(record: &InverterRecord, plan: &mut Vec<PlanStep>) {
    let Some(serial) = record.serial.as_deref() else {
        debug!("skipping inverter record without serial");
        return;
    };
    let root = DevicePath::new(serial);

    plan.push(PlanStep::Materialize {
        path: root.clone(),
        definition: ObjectDefinition::device(record.name().unwrap_or(serial), Some("Inverter")),
    });

    let control = root.child("power_control");
    plan.push(PlanStep::Materialize {
        path: control,
        definition: ObjectDefinition::channel("Power control", None),
    });
    for descriptor in power_control_descriptors() {
        plan.push(PlanStep::Materialize {
            path: root.child(descriptor.id),
            definition: descriptor.definition(),
        });
    }

    if let Some((_, raw)) = record
        .fields
        .iter()
        .find(|(field, _)| field.eq_ignore_ascii_case(REACHABLE))
    {
        if let Some(reachable) = parse_flag(raw) {
            plan.push(PlanStep::Reachability {
                serial: serial.to_owned(),
                reachable,
            });
        }
        push_entry(plan, &root, &root, REACHABLE.to_owned(), None, raw);
    }

    for (field, raw) in &record.fields {
        match field.to_ascii_lowercase().as_str() {
            REACHABLE => {}
            "ac" => push_block(plan, &root, raw, "ac", "AC", "phase", "Phase", "ac_"),
            "dc" => push_block(plan, &root, raw, "dc", "DC", "input", "DC Input", "dc_"),
            "inv" => {
                if let Some((_, entry)) = indexed_entries(raw).into_iter().find(|(i, _)| *i == 0) {
                    push_fields(plan, &root, &root, "inv_", None, entry);
                }
            }
            lowered => push_entry(plan, &root, &root, lowered.to_owned(), None, raw),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn push_block(
    plan: &mut Vec<PlanStep>,
    root: &DevicePath,
    raw: &Value,
    channel_id: &str,
    channel_name: &str,
    member_id: &str,
    member_name: &str,
    prefix: &str,
) {
    let channel = root.child(channel_id);
    plan.push(PlanStep::Materialize {
        path: channel.clone(),
        definition: ObjectDefinition::channel(channel_name, None),
    });
    for (index, entry) in indexed_entries(raw) {
        let Some(number) = index.checked_add(1) else {
            continue;
        };
        let member = channel.child(&format!("{member_id}_{number}"));
        plan.push(PlanStep::Materialize {
            path: member.clone(),
            definition: ObjectDefinition::channel(format!("{member_name} {number}"), None),
        });
        push_fields(plan, root, &member, prefix, Some(number), entry);
    }
}

fn push_fields(
    plan: &mut Vec<PlanStep>,
    root: &DevicePath,
    channel: &DevicePath,
    prefix: &str,
    index: Option<usize>,
    fields: &Map<String, Value>,
) {
    for (field, raw) in fields {
        let key = format!("{prefix}{}", field.to_lowercase());
        push_entry(plan, root, channel, key, index, raw);
    }
}

fn push_entry(
    plan: &mut Vec<PlanStep>,
    root: &DevicePath,
    channel: &DevicePath,
    key: String,
    index: Option<usize>,
    raw: &Value,
) {
    match descriptor_for(&key) {
        Some(descriptor) => plan.push(PlanStep::Value(FlatEntry {
            root: root.clone(),
            channel: channel.clone(),
            key,
            index,
            raw: raw.clone(),
            descriptor,
        })),
        None => trace!(key = %key, channel = %channel, "dropping unknown field"),
    }
}
