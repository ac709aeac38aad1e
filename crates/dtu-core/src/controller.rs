//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Single-task event loop tying transport events, user writes and the daily
//! maintenance jobs to the state store.

use std::sync::Arc;

use dtu_common::config::BridgeConfig;
use dtu_metrics::BridgeMetrics;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::cache::ObjectCache;
use crate::control::{interpret_write, CommandSink, WriteIntent};
use crate::descriptor::descriptor_for;
use crate::errors::Result;
use crate::flatten::{flatten, FlatEntry, PlanStep};
use crate::guard::{zeroed_when_offline, GuardPipeline, Verdict};
use crate::model::TelemetryMessage;
use crate::path::DevicePath;
use crate::store::{ObjectDefinition, StateChange, StateStore};
use crate::transport::TransportEvent;

pub const INFO_ROOT: &str = "info";
const CONNECTION_KEY: &str = "info_connection";

/// Daily jobs triggered by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceJob {
    /// Zero every `yieldday` state before the device rolls its counter.
    DayEnd,
    /// Re-publish every `yieldtotal` state with its stored value.
    PostMidnight,
}

/// Owns the object cache and guard state; all mutation happens on one task.
pub struct BridgeController {
    store: Arc<dyn StateStore>,
    relay: Option<Arc<dyn CommandSink>>,
    metrics: Option<BridgeMetrics>,
    cache: ObjectCache,
    guards: GuardPipeline,
    relays: JoinSet<()>,
}

impl BridgeController {
    pub fn new(config: &BridgeConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            relay: None,
            metrics: None,
            cache: ObjectCache::new(config.protect_names),
            guards: GuardPipeline::new(config),
            relays: JoinSet::new(),
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn CommandSink>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn guards(&self) -> &GuardPipeline {
        &self.guards
    }

    /// Control commands still in flight.
    pub fn pending_relays(&self) -> usize {
        self.relays.len()
    }

    /// Wait for every in-flight control command to finish.
    pub async fn drain_relays(&mut self) {
        while let Some(joined) = self.relays.join_next().await {
            log_relay_join(joined);
        }
    }

    /// Create the `info.connection` indicator and mark it disconnected.
    pub async fn initialize(&mut self) -> Result<()> {
        let info = DevicePath::new(INFO_ROOT);
        self.materialize(&info, ObjectDefinition::channel("Information", None))
            .await?;
        if let Some(descriptor) = descriptor_for(CONNECTION_KEY) {
            let path = info.child(descriptor.id);
            self.materialize(&path, descriptor.definition()).await?;
            self.store.set_state_changed(&path, json!(false), true).await?;
        }
        Ok(())
    }

    pub async fn handle_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Connected => self.set_connected(true).await,
            TransportEvent::Disconnected => self.set_connected(false).await,
            TransportEvent::Frame(text) => self.handle_frame(&text).await,
            TransportEvent::Message(message) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_received();
                }
                self.apply_message(&message).await
            }
        }
    }

    /// Decode and apply one text frame. Malformed frames are dropped.
    pub async fn handle_frame(&mut self, text: &str) -> Result<()> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_received();
        }
        match TelemetryMessage::decode(text) {
            Ok(message) => self.apply_message(&message).await,
            Err(err) => {
                warn!(error = %err, bytes = text.len(), "dropping malformed telemetry frame");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_malformed();
                }
                Ok(())
            }
        }
    }

    pub async fn apply_message(&mut self, message: &TelemetryMessage) -> Result<()> {
        for step in flatten(message) {
            match step {
                PlanStep::Materialize { path, definition } => {
                    self.materialize(&path, definition).await?;
                }
                PlanStep::Reachability { serial, reachable } => {
                    self.set_reachable(&serial, reachable).await?;
                }
                PlanStep::Value(entry) => self.commit_entry(&entry).await?,
            }
        }
        Ok(())
    }

    async fn materialize(&mut self, path: &DevicePath, definition: ObjectDefinition) -> Result<()> {
        let created = self
            .cache
            .ensure_materialized(self.store.as_ref(), path, definition)
            .await?;
        if created {
            if let Some(metrics) = &self.metrics {
                metrics.inc_objects_created();
            }
        }
        Ok(())
    }

    async fn commit_entry(&mut self, entry: &FlatEntry) -> Result<()> {
        let path = entry.state_path();
        self.materialize(&path, entry.descriptor.definition())
            .await?;

        let verdict = self
            .guards
            .evaluate(self.store.as_ref(), &path, entry.descriptor, &entry.raw)
            .await?;
        match verdict {
            Verdict::Commit(value) => {
                if self.store.set_state_changed(&path, value, true).await? {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_committed();
                    }
                }
            }
            Verdict::Suppress(reason) => {
                trace!(path = %path, reason = reason.as_str(), "value suppressed");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_suppressed(reason.as_str());
                }
            }
        }
        Ok(())
    }

    async fn set_reachable(&mut self, serial: &str, reachable: bool) -> Result<()> {
        if reachable {
            if self.guards.offline_mut().mark_online(serial) {
                info!(serial, "inverter reachable again");
            }
            return Ok(());
        }
        if !self.guards.zero_on_offline() || self.guards.offline().contains(serial) {
            return Ok(());
        }

        let targets: Vec<DevicePath> = self
            .cache
            .states_under(serial)
            .filter(|path| zeroed_when_offline(path))
            .cloned()
            .collect();
        for path in &targets {
            self.store.set_state_changed(path, json!(0), true).await?;
        }
        self.guards.offline_mut().mark_offline(serial);
        info!(serial, zeroed = targets.len(), "inverter unreachable, live values zeroed");
        Ok(())
    }

    async fn set_connected(&mut self, connected: bool) -> Result<()> {
        if let Some(metrics) = &self.metrics {
            metrics.set_connected(connected);
        }
        if let Some(descriptor) = descriptor_for(CONNECTION_KEY) {
            let path = DevicePath::new(INFO_ROOT).child(descriptor.id);
            if self.cache.contains(&path) {
                self.store
                    .set_state_changed(&path, json!(connected), true)
                    .await?;
            }
        }
        if connected {
            info!("telemetry transport connected");
        } else {
            debug!("telemetry transport disconnected");
        }
        Ok(())
    }

    pub async fn run_maintenance(&mut self, job: MaintenanceJob) -> Result<usize> {
        match job {
            MaintenanceJob::DayEnd => self.end_of_day().await,
            MaintenanceJob::PostMidnight => self.post_midnight().await,
        }
    }

    /// Zero all `yieldday` states. Each stays held against yesterday's total until the device
    /// reports a lower counter.
    pub async fn end_of_day(&mut self) -> Result<usize> {
        let targets: Vec<DevicePath> = self.cache.states_ending_with("yieldday").cloned().collect();
        for path in &targets {
            let stored = self
                .store
                .get_state(path)
                .await?
                .and_then(|state| state.val.as_f64());
            let previous = match (self.guards.yields().get(path), stored) {
                (Some(cached), Some(stored)) => Some(cached.max(stored)),
                (cached, stored) => cached.or(stored),
            };
            self.store.set_state(path, json!(0), true).await?;
            self.guards.yields_mut().reset_day(path, previous);
        }
        info!(states = targets.len(), "end-of-day yield reset");
        Ok(targets.len())
    }

    /// Rewrite all `yieldtotal` states with their current value.
    pub async fn post_midnight(&mut self) -> Result<usize> {
        let targets: Vec<DevicePath> =
            self.cache.states_ending_with("yieldtotal").cloned().collect();
        let mut written = 0;
        for path in &targets {
            if let Some(state) = self.store.get_state(path).await? {
                self.store.set_state(path, state.val, true).await?;
                written += 1;
            }
        }
        info!(states = written, "post-midnight yield total refresh");
        Ok(written)
    }

    /// Relay an unacknowledged write on a power-control state to the device.
    ///
    /// The command is posted on its own task and the write is acknowledged right away, whatever
    /// the device answers.
    pub async fn handle_user_write(&mut self, change: StateChange) -> Result<()> {
        let command = match interpret_write(&change.path, &change.value) {
            WriteIntent::Command(command) => command,
            WriteIntent::Rejected { path, reason } => {
                warn!(path = %path, reason = %reason, "ignoring control write");
                return Ok(());
            }
            WriteIntent::Ignored => {
                trace!(path = %change.path, "write outside power control ignored");
                return Ok(());
            }
        };

        let action = command.action.as_str();
        match &self.relay {
            Some(relay) => {
                let relay = Arc::clone(relay);
                let metrics = self.metrics.clone();
                self.relays.spawn(async move {
                    let outcome = match relay.dispatch(&command).await {
                        Ok(()) => {
                            info!(serial = %command.serial, action, "control command relayed");
                            "sent"
                        }
                        Err(err) => {
                            warn!(serial = %command.serial, action, error = %err, "control command failed");
                            "failed"
                        }
                    };
                    if let Some(metrics) = metrics {
                        metrics.record_relay(action, outcome);
                    }
                });
            }
            None => {
                warn!(serial = %command.serial, action, "no control relay configured");
                self.record_relay(action, "skipped");
            }
        }

        self.store.set_state(&change.path, change.value, true).await?;
        Ok(())
    }

    fn record_relay(&self, action: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_relay(action, outcome);
        }
    }
}

fn log_relay_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        warn!(error = %err, "control command task failed");
    }
}

/// Event loop driving a [`BridgeController`] until shutdown.
pub struct BridgeRuntime {
    controller: BridgeController,
    events: mpsc::Receiver<TransportEvent>,
    writes: mpsc::UnboundedReceiver<StateChange>,
    maintenance: mpsc::Receiver<MaintenanceJob>,
    shutdown: watch::Receiver<bool>,
}

impl BridgeRuntime {
    pub fn new(
        controller: BridgeController,
        events: mpsc::Receiver<TransportEvent>,
        writes: mpsc::UnboundedReceiver<StateChange>,
        maintenance: mpsc::Receiver<MaintenanceJob>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            controller,
            events,
            writes,
            maintenance,
            shutdown,
        }
    }

    /// Process events sequentially; returns the controller once stopped.
    pub async fn run(mut self) -> Result<BridgeController> {
        self.controller.initialize().await?;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("bridge runtime shutdown signal received");
                        break;
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!("transport event channel closed");
                        break;
                    };
                    if let Err(err) = self.controller.handle_event(event).await {
                        warn!(error = %err, "failed to apply transport event");
                    }
                }
                Some(change) = self.writes.recv() => {
                    if let Err(err) = self.controller.handle_user_write(change).await {
                        warn!(error = %err, "failed to handle state write");
                    }
                }
                Some(job) = self.maintenance.recv() => {
                    if let Err(err) = self.controller.run_maintenance(job).await {
                        warn!(job = ?job, error = %err, "maintenance job failed");
                    }
                }
                Some(joined) = self.controller.relays.join_next() => log_relay_join(joined),
            }
        }

        if self.controller.pending_relays() > 0 {
            debug!(pending = self.controller.pending_relays(), "waiting for control commands");
        }
        self.controller.drain_relays().await;
        Ok(self.controller)
    }
}
