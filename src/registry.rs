//! Device Registry and Candidate Pool
//!
//! Two things live here:
//!
//! 1. [`DeviceCaps`] and [`DeviceFactory`] — the plugin API for device
//!    types. Factories are registered with the [`CandidateRegistry`] at
//!    startup and instantiate a capability bag from a candidate's TOML
//!    configuration.
//! 2. [`DeviceTable`] — the arena of device records built from the
//!    candidate pool. Records are addressed by a stable [`DeviceIndex`];
//!    a separate map resolves a bound [`Position`] back to its index.
//!    Records are constructed once at startup and live for the process
//!    lifetime; only their bindings and tallies change.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Composition Root (main.rs)                      │
//! │  registry.register_factory(Box::new(SimHubFactory));           │
//! │  registry.register_factory(Box::new(SimLeafFactory));          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CandidateRegistry                          │
//! │  factories: HashMap<device_type, Box<dyn DeviceFactory>>       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │ build_table(&config)
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DeviceTable                              │
//! │  records: Vec<DeviceRecord>   by_position: Position → index    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::config::{CandidateDecl, NodeConfig};
use crate::device::{
    BusInterface, Capability, DeviceKind, DiagnosticsSource, ErrorTally, HubControl, Lifecycle,
    MetadataSource, Position, Presence, SleepWake, TelemetrySource,
};
use crate::error::{AppResult, NodeError};
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Device Capability Bag
// =============================================================================

/// Container for the capability trait objects a device exposes.
///
/// A device simply does not populate a capability it lacks; callers check
/// the `Option` instead of invoking a stub. Factories build this with the
/// builder methods.
#[derive(Default, Clone)]
pub struct DeviceCaps {
    /// Presence probe (every discoverable device has one).
    pub presence: Option<Arc<dyn Presence>>,
    /// Telemetry query.
    pub telemetry: Option<Arc<dyn TelemetrySource>>,
    /// Diagnostic query.
    pub diagnostics: Option<Arc<dyn DiagnosticsSource>>,
    /// Metadata query.
    pub metadata: Option<Arc<dyn MetadataSource>>,
    /// Initialization lifecycle.
    pub lifecycle: Option<Arc<dyn Lifecycle>>,
    /// Sleep/wake in place.
    pub sleep_wake: Option<Arc<dyn SleepWake>>,
    /// Hub sub-port control (hubs only).
    pub hub: Option<Arc<dyn HubControl>>,
    /// Device-owned error counter.
    pub errors: Option<Arc<dyn ErrorTally>>,
}

impl DeviceCaps {
    /// Create an empty capability bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// List the capabilities this bag exposes.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.presence.is_some() {
            caps.push(Capability::Presence);
        }
        if self.telemetry.is_some() {
            caps.push(Capability::Telemetry);
        }
        if self.diagnostics.is_some() {
            caps.push(Capability::Diagnostics);
        }
        if self.metadata.is_some() {
            caps.push(Capability::Metadata);
        }
        if self.lifecycle.is_some() {
            caps.push(Capability::Lifecycle);
        }
        if self.sleep_wake.is_some() {
            caps.push(Capability::SleepWake);
        }
        if self.hub.is_some() {
            caps.push(Capability::SubPorts);
        }
        if self.errors.is_some() {
            caps.push(Capability::Errors);
        }
        caps
    }

    // Builder methods

    /// Set the presence probe.
    pub fn with_presence(mut self, p: Arc<dyn Presence>) -> Self {
        self.presence = Some(p);
        self
    }

    /// Set the telemetry source.
    pub fn with_telemetry(mut self, t: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(t);
        self
    }

    /// Set the diagnostics source.
    pub fn with_diagnostics(mut self, d: Arc<dyn DiagnosticsSource>) -> Self {
        self.diagnostics = Some(d);
        self
    }

    /// Set the metadata source.
    pub fn with_metadata(mut self, m: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(m);
        self
    }

    /// Set the lifecycle implementation.
    pub fn with_lifecycle(mut self, l: Arc<dyn Lifecycle>) -> Self {
        self.lifecycle = Some(l);
        self
    }

    /// Set the sleep/wake implementation.
    pub fn with_sleep_wake(mut self, s: Arc<dyn SleepWake>) -> Self {
        self.sleep_wake = Some(s);
        self
    }

    /// Set the hub sub-port controller.
    pub fn with_hub(mut self, h: Arc<dyn HubControl>) -> Self {
        self.hub = Some(h);
        self
    }

    /// Set the device-owned error counter.
    pub fn with_errors(mut self, e: Arc<dyn ErrorTally>) -> Self {
        self.errors = Some(e);
        self
    }
}

// =============================================================================
// Device Factory Trait
// =============================================================================

/// Trait for factories that create device capability bags.
///
/// Each device type implements this to register itself with the
/// [`CandidateRegistry`]. Factories are registered once at startup and live
/// for the program's lifetime.
///
/// # Error Handling
///
/// `validate()` should give descriptive, actionable feedback before any
/// hardware is touched; `build()` may open transports but must not probe
/// the bus — presence is discovery's job.
pub trait DeviceFactory: Send + Sync + 'static {
    /// Device type key used in the candidate declaration's `type` field.
    fn device_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities instances of this type provide.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate a candidate's configuration without instantiating.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the device's capability bag.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceCaps>>;
}

// =============================================================================
// Device Table (Arena)
// =============================================================================

/// Stable index of a device record in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIndex(usize);

impl DeviceIndex {
    /// Raw index value (for logging).
    pub fn id(&self) -> usize {
        self.0
    }
}

/// One device in the table: identity, binding state, tallies, capabilities.
pub struct DeviceRecord {
    /// Declared identifier (unique across the pool).
    pub name: String,
    /// Device family.
    pub kind: DeviceKind,
    /// Electrical interface.
    pub interface: BusInterface,
    /// Keep port power applied during sleep (leafs; propagated onto the
    /// owning hub during discovery).
    pub keep_powered: bool,
    /// Bound position, `None` until discovery assigns one. Core-kind
    /// devices never carry a position; they are always reachable.
    pub position: Option<Position>,
    /// Candidate-pool status: true once bound or exhausted this run.
    pub tested: bool,
    /// Whether `begin` has already run (init pass sends diagnostics
    /// instead of re-running it).
    pub begun: bool,
    /// Cumulative error tally (discovery misses, failed reads).
    pub error_count: u32,
    /// The capabilities this device exposes.
    pub caps: DeviceCaps,
}

impl DeviceRecord {
    /// True when this device can be energized for a query: core devices
    /// always, others only once bound to a real slot.
    pub fn is_reachable(&self) -> bool {
        match self.kind {
            DeviceKind::Core => true,
            _ => self
                .position
                .map(|p| p.is_energizable() || p.is_core())
                .unwrap_or(false),
        }
    }
}

/// Arena of device records plus the position → index map.
#[derive(Default)]
pub struct DeviceTable {
    records: Vec<DeviceRecord>,
    by_position: HashMap<Position, DeviceIndex>,
}

impl DeviceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, returning its stable index.
    pub fn push(&mut self, record: DeviceRecord) -> DeviceIndex {
        let idx = DeviceIndex(self.records.len());
        self.records.push(record);
        idx
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All indices in declaration order.
    pub fn indices(&self) -> impl Iterator<Item = DeviceIndex> {
        (0..self.records.len()).map(DeviceIndex)
    }

    /// Immutable access to a record.
    pub fn record(&self, idx: DeviceIndex) -> &DeviceRecord {
        &self.records[idx.0]
    }

    /// Mutable access to a record.
    pub fn record_mut(&mut self, idx: DeviceIndex) -> &mut DeviceRecord {
        &mut self.records[idx.0]
    }

    /// Bind a record to a position.
    ///
    /// Refuses to rebind an occupied position or an already-bound record;
    /// discovery's first-match-wins scan makes both programming errors.
    pub fn bind(&mut self, idx: DeviceIndex, position: Position) -> Result<()> {
        if let Some(holder) = self.by_position.get(&position) {
            anyhow::bail!(
                "position {} already bound to '{}'",
                position,
                self.records[holder.0].name
            );
        }
        let record = &mut self.records[idx.0];
        if record.position.is_some() {
            anyhow::bail!("device '{}' is already bound", record.name);
        }
        record.position = Some(position);
        record.tested = true;
        self.by_position.insert(position, idx);
        Ok(())
    }

    /// Resolve a bound position to its device.
    pub fn device_at(&self, position: Position) -> Option<DeviceIndex> {
        self.by_position.get(&position).copied()
    }

    /// Clear all bindings and candidate status so discovery can re-run.
    pub fn reset_bindings(&mut self) {
        self.by_position.clear();
        for record in &mut self.records {
            if record.kind != DeviceKind::Core {
                record.position = None;
                record.tested = false;
                record.begun = false;
            }
        }
    }

    /// Untested candidates of one kind, in declaration order.
    pub fn untested(&self, kind: DeviceKind) -> Vec<DeviceIndex> {
        self.indices()
            .filter(|&i| {
                let r = self.record(i);
                r.kind == kind && !r.tested
            })
            .collect()
    }

    /// Bound hubs in declaration order.
    pub fn bound_hubs(&self) -> Vec<DeviceIndex> {
        self.indices()
            .filter(|&i| {
                let r = self.record(i);
                r.kind == DeviceKind::Hub && r.position.is_some()
            })
            .collect()
    }

    /// Bound leafs in declaration order.
    pub fn bound_leafs(&self) -> Vec<DeviceIndex> {
        self.indices()
            .filter(|&i| {
                let r = self.record(i);
                r.kind == DeviceKind::Leaf && r.position.is_some()
            })
            .collect()
    }

    /// Increment a device's error tally.
    pub fn tally_error(&mut self, idx: DeviceIndex) {
        self.records[idx.0].error_count = self.records[idx.0].error_count.saturating_add(1);
    }

    /// True when any declared candidate remains unbound (the aggregate
    /// "missing sensor" indicator).
    pub fn any_missing(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.kind != DeviceKind::Core && r.position.is_none())
    }
}

// =============================================================================
// Candidate Registry
// =============================================================================

/// Registry of device factories, keyed by device type.
#[derive(Default)]
pub struct CandidateRegistry {
    factories: HashMap<&'static str, Box<dyn DeviceFactory>>,
}

impl CandidateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Later registrations replace earlier ones with
    /// the same type key.
    pub fn register_factory(&mut self, factory: Box<dyn DeviceFactory>) {
        self.factories.insert(factory.device_type(), factory);
    }

    /// Look up a factory by type key.
    pub fn factory(&self, device_type: &str) -> Option<&dyn DeviceFactory> {
        self.factories.get(device_type).map(|f| f.as_ref())
    }

    /// Build the device table from the configured candidate pool.
    ///
    /// Validates every declaration before instantiating anything, so a bad
    /// pool fails fast with the offending candidate named.
    pub async fn build_table(&self, config: &NodeConfig) -> AppResult<DeviceTable> {
        let mut decls: Vec<(&CandidateDecl, DeviceKind)> = Vec::new();
        for decl in config.enabled_candidates(DeviceKind::Hub) {
            decls.push((decl, DeviceKind::Hub));
        }
        for decl in config.enabled_candidates(DeviceKind::Leaf) {
            decls.push((decl, DeviceKind::Leaf));
        }

        for (decl, _) in &decls {
            let factory = self
                .factory(&decl.r#type)
                .ok_or_else(|| NodeError::UnknownDeviceType(decl.r#type.clone()))?;
            factory.validate(&decl.config).map_err(|e| {
                NodeError::Configuration(format!("candidate '{}': {}", decl.id, e))
            })?;
        }

        let mut table = DeviceTable::new();
        for (decl, kind) in decls {
            // Lookup cannot fail after the validation sweep above.
            let Some(factory) = self.factory(&decl.r#type) else {
                return Err(NodeError::UnknownDeviceType(decl.r#type.clone()));
            };
            let caps = factory.build(decl.config.clone()).await.map_err(|e| {
                NodeError::Configuration(format!("candidate '{}' failed to build: {}", decl.id, e))
            })?;
            let idx = table.push(DeviceRecord {
                name: decl.id.clone(),
                kind,
                interface: decl.interface,
                keep_powered: decl.keep_powered,
                position: None,
                tested: false,
                begun: false,
                error_count: 0,
                caps,
            });
            tracing::debug!(
                device = %decl.id,
                device_type = %decl.r#type,
                index = idx.id(),
                "registered candidate"
            );
        }
        Ok(table)
    }
}
