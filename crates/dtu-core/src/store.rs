//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! State store collaborator and its in-memory implementation.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::descriptor::ValueKind;
use crate::path::DevicePath;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no object registered at {0}")]
    UnknownObject(String),
    #[error("state store backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Device,
    Channel,
    State,
}

/// Metadata merged into the store for a device, channel or state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDefinition {
    pub kind: ObjectKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_kind: Option<ValueKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub writable: bool,
}

impl ObjectDefinition {
    pub fn device(name: impl Into<String>, description: Option<&str>) -> Self {
        Self {
            kind: ObjectKind::Device,
            name: name.into(),
            description: description.map(str::to_owned),
            role: None,
            value_kind: None,
            unit: None,
            writable: false,
        }
    }

    pub fn channel(name: impl Into<String>, description: Option<&str>) -> Self {
        Self {
            kind: ObjectKind::Channel,
            ..Self::device(name, description)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    pub val: Value,
    pub ack: bool,
    pub ts: DateTime<Utc>,
}

/// Unacknowledged write on a subscribed path.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub path: DevicePath,
    pub value: Value,
}

/// Operations the bridge needs from the hierarchical state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Merge object metadata. With `preserve_name` an existing object keeps its name.
    async fn extend_object(
        &self,
        path: &DevicePath,
        definition: ObjectDefinition,
        preserve_name: bool,
    ) -> StoreResult<()>;

    /// Request notifications for unacknowledged writes on `path`.
    async fn subscribe(&self, path: &DevicePath) -> StoreResult<()>;

    async fn get_state(&self, path: &DevicePath) -> StoreResult<Option<StateValue>>;

    /// Unconditional write.
    async fn set_state(&self, path: &DevicePath, value: Value, ack: bool) -> StoreResult<()>;

    /// Write only when value or ack differ from the stored state. Returns whether it wrote.
    async fn set_state_changed(
        &self,
        path: &DevicePath,
        value: Value,
        ack: bool,
    ) -> StoreResult<bool>;
}

/// Read/write surface used by the REST state API.
#[async_trait]
pub trait StateBrowser: Send + Sync {
    async fn list_states(&self) -> Vec<(DevicePath, StateValue)>;

    async fn read_state(&self, path: &DevicePath) -> StoreResult<Option<StateValue>>;

    async fn object(&self, path: &DevicePath) -> Option<ObjectDefinition>;

    /// Write as a user would: unacknowledged, notifying subscribers.
    async fn write_user(&self, path: &DevicePath, value: Value) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct StoreInner {
    objects: IndexMap<DevicePath, ObjectDefinition>,
    states: IndexMap<DevicePath, StateValue>,
    subscriptions: HashSet<DevicePath>,
    extend_calls: IndexMap<DevicePath, usize>,
    /// Write history, kept only by stores built with [`MemoryStateStore::recording`].
    writes: Option<Vec<(DevicePath, Value)>>,
}

/// Process-local state store used by the daemon and the test suites.
#[derive(Debug)]
pub struct MemoryStateStore {
    inner: RwLock<StoreInner>,
    notifier: mpsc::UnboundedSender<StateChange>,
}

impl MemoryStateStore {
    /// Create a store together with the receiver of its write notifications.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        Self::with_inner(StoreInner::default())
    }

    /// Like [`MemoryStateStore::new`], but every committed write is also appended to a history
    /// readable through [`MemoryStateStore::writes_to`]. Memory grows with each write.
    pub fn recording() -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        Self::with_inner(StoreInner {
            writes: Some(Vec::new()),
            ..StoreInner::default()
        })
    }

    fn with_inner(inner: StoreInner) -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        let (notifier, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: RwLock::new(inner),
                notifier,
            },
            rx,
        )
    }

    /// Number of `extend_object` calls made for `path`.
    pub fn extend_calls(&self, path: &str) -> usize {
        self.inner
            .read()
            .extend_calls
            .get(&DevicePath::from(path))
            .copied()
            .unwrap_or_default()
    }

    pub fn object_count(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn object_paths(&self) -> Vec<DevicePath> {
        self.inner.read().objects.keys().cloned().collect()
    }

    pub fn value(&self, path: &str) -> Option<Value> {
        self.inner
            .read()
            .states
            .get(&DevicePath::from(path))
            .map(|state| state.val.clone())
    }

    /// Every value actually written to `path`, in order. Empty unless recording.
    pub fn writes_to(&self, path: &str) -> Vec<Value> {
        let path = DevicePath::from(path);
        self.inner
            .read()
            .writes
            .iter()
            .flatten()
            .filter(|(written, _)| *written == path)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn total_writes(&self) -> usize {
        self.inner.read().writes.as_ref().map_or(0, Vec::len)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.read().writes.is_some()
    }

    pub fn is_subscribed(&self, path: &str) -> bool {
        self.inner
            .read()
            .subscriptions
            .contains(&DevicePath::from(path))
    }

    /// Seed a state without going through the write log.
    pub fn seed(&self, path: &str, definition: ObjectDefinition, value: Value) {
        let path = DevicePath::from(path);
        let mut inner = self.inner.write();
        inner.objects.insert(path.clone(), definition);
        inner.states.insert(
            path,
            StateValue {
                val: value,
                ack: true,
                ts: Utc::now(),
            },
        );
    }

    fn write(&self, path: &DevicePath, value: Value, ack: bool) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if !inner.objects.contains_key(path) {
            return Err(StoreError::UnknownObject(path.to_string()));
        }
        if let Some(writes) = inner.writes.as_mut() {
            writes.push((path.clone(), value.clone()));
        }
        inner.states.insert(
            path.clone(),
            StateValue {
                val: value,
                ack,
                ts: Utc::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn extend_object(
        &self,
        path: &DevicePath,
        definition: ObjectDefinition,
        preserve_name: bool,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        *inner.extend_calls.entry(path.clone()).or_default() += 1;
        match inner.objects.get_mut(path) {
            Some(existing) => {
                let name = std::mem::take(&mut existing.name);
                *existing = definition;
                if preserve_name && !name.is_empty() {
                    existing.name = name;
                }
            }
            None => {
                inner.objects.insert(path.clone(), definition);
            }
        }
        trace!(path = %path, "object extended");
        Ok(())
    }

    async fn subscribe(&self, path: &DevicePath) -> StoreResult<()> {
        self.inner.write().subscriptions.insert(path.clone());
        Ok(())
    }

    async fn get_state(&self, path: &DevicePath) -> StoreResult<Option<StateValue>> {
        Ok(self.inner.read().states.get(path).cloned())
    }

    async fn set_state(&self, path: &DevicePath, value: Value, ack: bool) -> StoreResult<()> {
        self.write(path, value, ack)
    }

    async fn set_state_changed(
        &self,
        path: &DevicePath,
        value: Value,
        ack: bool,
    ) -> StoreResult<bool> {
        let unchanged = self
            .inner
            .read()
            .states
            .get(path)
            .map(|state| state.val == value && state.ack == ack)
            .unwrap_or(false);
        if unchanged {
            return Ok(false);
        }
        self.write(path, value, ack)?;
        Ok(true)
    }
}

#[async_trait]
impl StateBrowser for MemoryStateStore {
    async fn list_states(&self) -> Vec<(DevicePath, StateValue)> {
        self.inner
            .read()
            .states
            .iter()
            .map(|(path, state)| (path.clone(), state.clone()))
            .collect()
    }

    async fn read_state(&self, path: &DevicePath) -> StoreResult<Option<StateValue>> {
        let inner = self.inner.read();
        if !inner.objects.contains_key(path) {
            return Err(StoreError::UnknownObject(path.to_string()));
        }
        Ok(inner.states.get(path).cloned())
    }

    async fn object(&self, path: &DevicePath) -> Option<ObjectDefinition> {
        self.inner.read().objects.get(path).cloned()
    }

    async fn write_user(&self, path: &DevicePath, value: Value) -> StoreResult<()> {
        self.write(path, value.clone(), false)?;
        if self.is_subscribed(path.as_str()) {
            let change = StateChange {
                path: path.clone(),
                value,
            };
            if self.notifier.send(change).is_err() {
                debug!(path = %path, "no listener for state change");
            }
        }
        Ok(())
    }
}
