//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Value guards applied between the flattener and the store.

use std::collections::{HashMap, HashSet};

use dtu_common::config::{BridgeConfig, YieldGuardPolicy};
use serde_json::Value;

use crate::descriptor::StateDescriptor;
use crate::path::DevicePath;
use crate::store::{StateStore, StoreResult};

/// Terminal field names reset to zero while an inverter is unreachable.
pub const ZERO_ON_OFFLINE: [&str; 8] = [
    "current",
    "irradiation",
    "power",
    "voltage",
    "frequency",
    "power_dc",
    "reactive_power",
    "temperature",
];

pub fn zeroed_when_offline(path: &DevicePath) -> bool {
    ZERO_ON_OFFLINE.contains(&path.terminal())
}

pub fn is_yield_path(path: &DevicePath) -> bool {
    path.as_str().contains("yield")
}

/// Serials currently considered unreachable.
#[derive(Debug, Default, Clone)]
pub struct OfflineSet {
    serials: HashSet<String>,
}

impl OfflineSet {
    pub fn contains(&self, serial: &str) -> bool {
        self.serials.contains(serial)
    }

    /// Returns `true` when the serial was not offline before.
    pub fn mark_offline(&mut self, serial: &str) -> bool {
        self.serials.insert(serial.to_owned())
    }

    pub fn mark_online(&mut self, serial: &str) -> bool {
        self.serials.remove(serial)
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

/// Last committed value per yield path, seeded lazily from the store.
///
/// A path reset at end of day is held until the device rolls its counter: values at or above the
/// pre-reset total are stale and rejected, and the first lower value becomes the new baseline.
#[derive(Debug, Default, Clone)]
pub struct YieldGuardCache {
    last: HashMap<DevicePath, f64>,
    held: HashMap<DevicePath, f64>,
}

impl YieldGuardCache {
    pub fn get(&self, path: &DevicePath) -> Option<f64> {
        self.last.get(path).copied()
    }

    pub fn record(&mut self, path: &DevicePath, value: f64) {
        self.last.insert(path.clone(), value);
    }

    /// Reset `path` to zero, holding it against the pre-reset total `previous`.
    /// A repeated reset keeps the higher of the existing hold and `previous`.
    pub fn reset_day(&mut self, path: &DevicePath, previous: Option<f64>) {
        self.record(path, 0.0);
        let ceiling = previous
            .into_iter()
            .chain(self.held(path))
            .fold(0.0_f64, f64::max);
        if ceiling > 0.0 {
            self.held.insert(path.clone(), ceiling);
        } else {
            self.held.remove(path);
        }
    }

    /// Pre-reset total while `path` waits for the device rollover.
    pub fn held(&self, path: &DevicePath) -> Option<f64> {
        self.held.get(path).copied()
    }

    /// Applies the post-reset hold. `None` when `path` is not held.
    fn admit_held(&mut self, path: &DevicePath, candidate: f64) -> Option<bool> {
        let ceiling = self.held(path)?;
        if candidate >= ceiling {
            return Some(false);
        }
        self.held.remove(path);
        self.record(path, candidate);
        Some(true)
    }

    async fn seed(&mut self, store: &dyn StateStore, path: &DevicePath) -> StoreResult<Option<f64>> {
        if let Some(value) = self.get(path) {
            return Ok(Some(value));
        }
        let stored = store
            .get_state(path)
            .await?
            .and_then(|state| state.val.as_f64());
        if let Some(value) = stored {
            self.record(path, value);
        }
        Ok(stored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The getter produced no value.
    Untransformable,
    Offline,
    YieldRegression,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::Untransformable => "untransformable",
            SuppressReason::Offline => "offline",
            SuppressReason::YieldRegression => "yield_regression",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Commit(Value),
    Suppress(SuppressReason),
}

/// Transform, offline suppression and yield guard, in that order.
#[derive(Debug, Clone)]
pub struct GuardPipeline {
    zero_on_offline: bool,
    policy: YieldGuardPolicy,
    offline: OfflineSet,
    yields: YieldGuardCache,
}

impl GuardPipeline {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            zero_on_offline: config.zero_on_offline,
            policy: config.yield_guard,
            offline: OfflineSet::default(),
            yields: YieldGuardCache::default(),
        }
    }

    pub fn zero_on_offline(&self) -> bool {
        self.zero_on_offline
    }

    pub fn offline(&self) -> &OfflineSet {
        &self.offline
    }

    pub fn offline_mut(&mut self) -> &mut OfflineSet {
        &mut self.offline
    }

    pub fn yields(&self) -> &YieldGuardCache {
        &self.yields
    }

    pub fn yields_mut(&mut self) -> &mut YieldGuardCache {
        &mut self.yields
    }

    pub async fn evaluate(
        &mut self,
        store: &dyn StateStore,
        path: &DevicePath,
        descriptor: &StateDescriptor,
        raw: &Value,
    ) -> StoreResult<Verdict> {
        let Some(value) = descriptor.read(raw) else {
            return Ok(Verdict::Suppress(SuppressReason::Untransformable));
        };

        if self.zero_on_offline && self.offline.contains(path.root()) && zeroed_when_offline(path)
        {
            return Ok(Verdict::Suppress(SuppressReason::Offline));
        }

        if is_yield_path(path) && !self.admit_yield(store, path, &value).await? {
            return Ok(Verdict::Suppress(SuppressReason::YieldRegression));
        }

        Ok(Verdict::Commit(value))
    }

    async fn admit_yield(
        &mut self,
        store: &dyn StateStore,
        path: &DevicePath,
        value: &Value,
    ) -> StoreResult<bool> {
        let Some(candidate) = value.as_f64() else {
            return Ok(false);
        };
        if let Some(admitted) = self.yields.admit_held(path, candidate) {
            return Ok(admitted);
        }
        match self.policy {
            YieldGuardPolicy::PositiveOnly => Ok(candidate > 0.0),
            YieldGuardPolicy::Monotonic => {
                let admitted = match self.yields.seed(store, path).await? {
                    Some(last) => candidate > last,
                    None => true,
                };
                if admitted {
                    self.yields.record(path, candidate);
                }
                Ok(admitted)
            }
        }
    }
}
