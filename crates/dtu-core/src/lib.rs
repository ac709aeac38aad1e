//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Core of the OpenDTU bridge: flattens live data into device paths,
//! materializes objects once, guards values and maps control writes.

pub mod cache;
pub mod control;
pub mod controller;
pub mod descriptor;
pub mod errors;
pub mod flatten;
pub mod guard;
pub mod model;
pub mod path;
pub mod store;
pub mod transport;

pub use cache::ObjectCache;
pub use control::{interpret_write, CommandSink, ControlAction, ControlCommand, WriteIntent};
pub use controller::{BridgeController, BridgeRuntime, MaintenanceJob};
pub use descriptor::{descriptor_for, StateDescriptor, ValueKind, ValueTransform};
pub use errors::{CoreError, Result};
pub use flatten::{flatten, FlatEntry, PlanStep};
pub use guard::{GuardPipeline, OfflineSet, SuppressReason, Verdict, YieldGuardCache};
pub use model::{InverterRecord, TelemetryMessage};
pub use path::DevicePath;
pub use store::{
    MemoryStateStore, ObjectDefinition, ObjectKind, StateBrowser, StateChange, StateStore,
    StateValue, StoreError,
};
pub use transport::{EventSender, TelemetrySource, TransportEvent};
