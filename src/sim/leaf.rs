//! Simulated leaf sensors and the controller's core monitor.

use crate::device::{
    Capability, DiagnosticsSource, MetadataSource, Presence, SleepWake, TelemetrySource,
};
use crate::registry::{DeviceCaps, DeviceFactory};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::backplane::SimBackplane;

/// Simulated leaf sensor on a hub sub-port (or core-wired when
/// `hub_slot == 0`).
///
/// Presence resolves through the backplane's physical-world registry: the
/// leaf answers only when its hub's slot is energized and the hub has its
/// sub-port powered with data enabled.
pub struct SimLeaf {
    name: String,
    backplane: Arc<SimBackplane>,
    hub_slot: u8,
    port: u8,
    fields: Vec<String>,
    values: Vec<f64>,
    noise: f64,
    always_fail: bool,
    rng: Mutex<StdRng>,
    sleeping: AtomicBool,
    sleeps: AtomicU32,
    wakes: AtomicU32,
}

impl SimLeaf {
    /// Create a leaf physically plugged at (`hub_slot`, `port`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backplane: Arc<SimBackplane>,
        name: impl Into<String>,
        hub_slot: u8,
        port: u8,
        fields: Vec<String>,
        values: Vec<f64>,
        noise: f64,
        seed: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            backplane,
            hub_slot,
            port,
            fields,
            values,
            noise,
            always_fail: false,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            sleeping: AtomicBool::new(false),
            sleeps: AtomicU32::new(0),
            wakes: AtomicU32::new(0),
        })
    }

    fn with_always_fail(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Whether the sensor is currently in its low-power state.
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Relaxed)
    }

    /// Times `sleep` ran.
    pub fn sleep_count(&self) -> u32 {
        self.sleeps.load(Ordering::Relaxed)
    }

    /// Times `wake` ran.
    pub fn wake_count(&self) -> u32 {
        self.wakes.load(Ordering::Relaxed)
    }

    fn reachable(&self) -> bool {
        if self.hub_slot == 0 {
            return true;
        }
        self.backplane
            .hub_at(self.hub_slot)
            .map(|hub| hub.port_live(self.port))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Presence for SimLeaf {
    async fn probe(&self) -> Result<bool> {
        Ok(self.reachable())
    }
}

#[async_trait]
impl TelemetrySource for SimLeaf {
    async fn telemetry(&self) -> Result<serde_json::Value> {
        let mut fragment = serde_json::Map::new();
        fragment.insert("name".to_string(), json!(self.name));
        for (i, field) in self.fields.iter().enumerate() {
            let value = if self.always_fail || !self.reachable() {
                serde_json::Value::Null
            } else {
                let base = self.values.get(i).copied().unwrap_or(0.0);
                let sample = if self.noise > 0.0 {
                    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                    base + rng.gen_range(-self.noise..self.noise)
                } else {
                    base
                };
                json!(sample)
            };
            fragment.insert(field.clone(), value);
        }
        Ok(serde_json::Value::Object(fragment))
    }
}

#[async_trait]
impl DiagnosticsSource for SimLeaf {
    async fn diagnostics(&self, verbosity: u8) -> Result<serde_json::Value> {
        let mut fragment = serde_json::Map::new();
        fragment.insert("name".to_string(), json!(self.name));
        fragment.insert("sleeping".to_string(), json!(self.is_sleeping()));
        if verbosity >= 3 {
            fragment.insert("plug".to_string(), json!(format!("{}:{}", self.hub_slot, self.port)));
            fragment.insert("sleeps".to_string(), json!(self.sleep_count()));
            fragment.insert("wakes".to_string(), json!(self.wake_count()));
        }
        Ok(serde_json::Value::Object(fragment))
    }
}

#[async_trait]
impl MetadataSource for SimLeaf {
    async fn metadata(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "name": self.name,
            "model": "sim-leaf",
            "fields": self.fields,
        }))
    }
}

#[async_trait]
impl SleepWake for SimLeaf {
    async fn sleep(&self) -> Result<()> {
        self.sleeping.store(true, Ordering::Relaxed);
        self.sleeps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn wake(&self) -> Result<()> {
        self.sleeping.store(false, Ordering::Relaxed);
        self.wakes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// Core monitor (controller built-in)
// =============================================================================

/// The controller's own housekeeping device: uptime and supply voltage.
/// Always present, no position, no power sequencing.
pub struct SimCoreMonitor {
    started: Instant,
    batt_v: f64,
}

impl SimCoreMonitor {
    /// Create a monitor reporting the given supply voltage.
    pub fn new(batt_v: f64) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            batt_v,
        })
    }
}

#[async_trait]
impl TelemetrySource for SimCoreMonitor {
    async fn telemetry(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "name": "controller",
            "uptime_s": self.started.elapsed().as_secs(),
            "batt_v": self.batt_v,
        }))
    }
}

#[async_trait]
impl DiagnosticsSource for SimCoreMonitor {
    async fn diagnostics(&self, _verbosity: u8) -> Result<serde_json::Value> {
        Ok(json!({
            "name": "controller",
            "uptime_s": self.started.elapsed().as_secs(),
        }))
    }
}

#[async_trait]
impl MetadataSource for SimCoreMonitor {
    async fn metadata(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "name": "controller",
            "model": "sim-core",
        }))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Configuration for a simulated leaf candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct SimLeafConfig {
    /// Hub slot the sensor is physically plugged behind (0 = core-wired).
    #[serde(default)]
    pub hub_slot: u8,
    /// Sub-port on that hub.
    #[serde(default)]
    pub port: u8,
    /// Candidate id used in fragments.
    #[serde(default)]
    pub name: String,
    /// Reported field names.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    /// Base values, one per field.
    #[serde(default)]
    pub values: Vec<f64>,
    /// Uniform noise half-width applied to each value.
    #[serde(default)]
    pub noise: f64,
    /// Report nulls for every field (dead probe).
    #[serde(default)]
    pub always_fail: bool,
    /// RNG seed for reproducible noise.
    #[serde(default)]
    pub seed: u64,
}

fn default_fields() -> Vec<String> {
    vec!["value".to_string()]
}

/// Factory for simulated leaf sensors, bound to one backplane.
pub struct SimLeafFactory {
    backplane: Arc<SimBackplane>,
}

impl SimLeafFactory {
    /// Create a factory wiring leafs through `backplane`.
    pub fn new(backplane: Arc<SimBackplane>) -> Self {
        Self { backplane }
    }
}

static SIM_LEAF_CAPABILITIES: &[Capability] = &[
    Capability::Presence,
    Capability::Telemetry,
    Capability::Diagnostics,
    Capability::Metadata,
    Capability::SleepWake,
];

impl DeviceFactory for SimLeafFactory {
    fn device_type(&self) -> &'static str {
        "sim_leaf"
    }

    fn name(&self) -> &'static str {
        "Simulated Leaf Sensor"
    }

    fn capabilities(&self) -> &'static [Capability] {
        SIM_LEAF_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SimLeafConfig = config.clone().try_into()?;
        if cfg.hub_slot > 0 && cfg.port == 0 {
            anyhow::bail!("a leaf behind a hub needs a sub-port");
        }
        if !cfg.values.is_empty() && cfg.values.len() != cfg.fields.len() {
            anyhow::bail!(
                "{} values for {} fields",
                cfg.values.len(),
                cfg.fields.len()
            );
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceCaps>> {
        let backplane = self.backplane.clone();
        Box::pin(async move {
            let cfg: SimLeafConfig = config.try_into()?;
            let name = if cfg.name.is_empty() {
                format!("leaf-{}:{}", cfg.hub_slot, cfg.port)
            } else {
                cfg.name
            };
            let mut leaf = SimLeaf {
                name,
                backplane,
                hub_slot: cfg.hub_slot,
                port: cfg.port,
                fields: cfg.fields,
                values: cfg.values,
                noise: cfg.noise,
                always_fail: false,
                rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
                sleeping: AtomicBool::new(false),
                sleeps: AtomicU32::new(0),
                wakes: AtomicU32::new(0),
            };
            if cfg.always_fail {
                leaf = leaf.with_always_fail();
            }
            let leaf = Arc::new(leaf);
            Ok(DeviceCaps::new()
                .with_presence(leaf.clone())
                .with_telemetry(leaf.clone())
                .with_diagnostics(leaf.clone())
                .with_metadata(leaf.clone())
                .with_sleep_wake(leaf))
        })
    }
}
