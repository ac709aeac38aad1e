//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use indexmap::IndexMap;
use tracing::debug;

use crate::path::DevicePath;
use crate::store::{ObjectDefinition, ObjectKind, StateStore, StoreResult};

/// Paths whose metadata has been created during this process lifetime.
///
/// Entries are only ever added; the store owns the objects afterwards.
#[derive(Debug, Default)]
pub struct ObjectCache {
    entries: IndexMap<DevicePath, ObjectKind>,
    protect_names: bool,
}

impl ObjectCache {
    pub fn new(protect_names: bool) -> Self {
        Self {
            entries: IndexMap::new(),
            protect_names,
        }
    }

    pub fn contains(&self, path: &DevicePath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn kind(&self, path: &DevicePath) -> Option<ObjectKind> {
        self.entries.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Materialized states at or below `root`.
    pub fn states_under<'a>(&'a self, root: &'a str) -> impl Iterator<Item = &'a DevicePath> + 'a {
        self.states().filter(move |path| path.is_under(root))
    }

    /// Materialized states whose terminal segment equals `terminal`.
    pub fn states_ending_with<'a>(
        &'a self,
        terminal: &'a str,
    ) -> impl Iterator<Item = &'a DevicePath> + 'a {
        self.states().filter(move |path| path.terminal() == terminal)
    }

    fn states(&self) -> impl Iterator<Item = &DevicePath> {
        self.entries
            .iter()
            .filter(|(_, kind)| **kind == ObjectKind::State)
            .map(|(path, _)| path)
    }

    /// Create the object unless already cached; subscribe writable states.
    ///
    /// Returns `true` when the store was touched.
    pub async fn ensure_materialized(
        &mut self,
        store: &dyn StateStore,
        path: &DevicePath,
        definition: ObjectDefinition,
    ) -> StoreResult<bool> {
        if self.entries.contains_key(path) {
            return Ok(false);
        }
        let kind = definition.kind;
        let writable = definition.writable;
        store
            .extend_object(path, definition, self.protect_names)
            .await?;
        if writable {
            store.subscribe(path).await?;
        }
        self.entries.insert(path.clone(), kind);
        debug!(path = %path, kind = ?kind, "object materialized");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    #[tokio::test]
    async fn repeated_materialization_touches_store_once() {
        let (store, _rx) = MemoryStateStore::new();
        let mut cache = ObjectCache::new(false);
        let path = DevicePath::new("1141.ac");

        for _ in 0..3 {
            cache
                .ensure_materialized(&store, &path, ObjectDefinition::channel("AC", None))
                .await
                .unwrap();
        }

        assert_eq!(store.extend_calls("1141.ac"), 1);
        assert_eq!(cache.kind(&path), Some(ObjectKind::Channel));
    }

    #[tokio::test]
    async fn writable_states_are_subscribed() {
        let (store, _rx) = MemoryStateStore::new();
        let mut cache = ObjectCache::new(false);
        let descriptor = crate::descriptor::descriptor_for("restart").unwrap();
        let path = DevicePath::new("1141").child(descriptor.id);

        cache
            .ensure_materialized(&store, &path, descriptor.definition())
            .await
            .unwrap();

        assert!(store.is_subscribed("1141.power_control.restart"));
        assert_eq!(cache.states_under("1141").count(), 1);
        assert_eq!(cache.states_ending_with("restart").count(), 1);
    }
}
