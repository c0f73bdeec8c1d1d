//! Simulated bus hub.

use crate::bus::Backplane;
use crate::device::{
    BusInterface, Capability, DiagnosticsSource, HubControl, InitReport, Lifecycle,
    MetadataSource, Presence,
};
use crate::registry::{DeviceCaps, DeviceFactory};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::backplane::SimBackplane;

struct PortState {
    power: Vec<bool>,
    data: Vec<bool>,
}

/// Simulated bus-expander hub.
///
/// Physically occupies `home_slot` on the shared backplane (slot 0 means
/// the candidate is declared but not plugged in). Answers its presence
/// probe only while the backplane has its slot energized.
pub struct SimHub {
    name: String,
    home_slot: u8,
    interface: BusInterface,
    ports: u8,
    backplane: Arc<SimBackplane>,
    state: Mutex<PortState>,
    fault: AtomicBool,
    begun: AtomicU32,
    restarts: AtomicU32,
}

impl SimHub {
    /// Create a hub and install it on the backplane when `home_slot` > 0.
    pub fn install(
        backplane: Arc<SimBackplane>,
        name: impl Into<String>,
        home_slot: u8,
        interface: BusInterface,
        ports: u8,
    ) -> Arc<Self> {
        let hub = Arc::new(Self {
            name: name.into(),
            home_slot,
            interface,
            ports,
            backplane: backplane.clone(),
            state: Mutex::new(PortState {
                power: vec![false; ports as usize + 1],
                data: vec![false; ports as usize + 1],
            }),
            fault: AtomicBool::new(false),
            begun: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
        });
        if home_slot > 0 {
            backplane.install_hub(home_slot, hub.clone());
        }
        hub
    }

    /// Assert the fault line; cleared when slot power is cycled.
    pub fn assert_fault(&self) {
        self.fault.store(true, Ordering::Relaxed);
    }

    /// Electrical interface (the backplane handshake consults this).
    pub fn interface(&self) -> BusInterface {
        self.interface
    }

    /// Slot this hub physically occupies (0 = not plugged in).
    pub fn home_slot(&self) -> u8 {
        self.home_slot
    }

    /// Times `begin` has run.
    pub fn begun_count(&self) -> u32 {
        self.begun.load(Ordering::Relaxed)
    }

    /// Times `restart` has run.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Whether `port` currently has power.
    pub fn port_power(&self, port: u8) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (port as usize) < state.power.len() && state.power[port as usize]
    }

    /// Whether `port` currently has data enabled.
    pub fn port_data(&self, port: u8) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (port as usize) < state.data.len() && state.data[port as usize]
    }

    /// A leaf on `port` is reachable: slot energized, port power + data up.
    pub fn port_live(&self, port: u8) -> bool {
        self.backplane.is_energized(self.home_slot)
            && self.port_power(port)
            && self.port_data(port)
    }

    /// Rail reaction to losing slot power.
    pub(super) fn on_power_loss(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for p in state.power.iter_mut() {
            *p = false;
        }
        for d in state.data.iter_mut() {
            *d = false;
        }
        // The fault latch is reset by a power cycle.
        self.fault.store(false, Ordering::Relaxed);
    }

    fn check_port(&self, port: u8) -> Result<()> {
        if port == 0 || port > self.ports {
            anyhow::bail!("hub '{}' port {} out of range 1..={}", self.name, port, self.ports);
        }
        Ok(())
    }

    fn reachable(&self) -> Result<()> {
        if !self.backplane.is_powered(self.home_slot) {
            anyhow::bail!("hub '{}' is not powered", self.name);
        }
        Ok(())
    }
}

#[async_trait]
impl Presence for SimHub {
    async fn probe(&self) -> Result<bool> {
        Ok(self.home_slot > 0 && self.backplane.is_energized(self.home_slot))
    }
}

#[async_trait]
impl HubControl for SimHub {
    fn num_sub_ports(&self) -> u8 {
        self.ports
    }

    async fn set_port_power(&self, port: u8, on: bool) -> Result<()> {
        self.check_port(port)?;
        self.reachable()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.power[port as usize] = on;
        if !on {
            state.data[port as usize] = false;
        }
        Ok(())
    }

    async fn set_port_data(&self, port: u8, on: bool) -> Result<()> {
        self.check_port(port)?;
        self.reachable()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if on && !state.power[port as usize] {
            // Powering a port implicitly when data is requested matches the
            // expander silicon: the data switch routes through the LDO.
            state.power[port as usize] = true;
        }
        state.data[port as usize] = on;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.reachable()?;
        self.restarts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for port in 1..=self.ports as usize {
            state.power[port] = true;
            state.data[port] = false;
        }
        Ok(())
    }

    async fn fault_asserted(&self) -> Result<bool> {
        Ok(self.fault.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl Lifecycle for SimHub {
    async fn begin(&self) -> Result<InitReport> {
        self.reachable()?;
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(InitReport::ok(json!({
            "name": self.name,
            "ports": self.ports,
            "bus": self.interface.label(),
        })))
    }
}

#[async_trait]
impl DiagnosticsSource for SimHub {
    async fn diagnostics(&self, verbosity: u8) -> Result<serde_json::Value> {
        let mut fragment = serde_json::Map::new();
        fragment.insert("name".to_string(), json!(self.name));
        fragment.insert("restarts".to_string(), json!(self.restart_count()));
        if verbosity >= 3 {
            let powered: Vec<u8> = (1..=self.ports)
                .filter(|&p| self.port_power(p))
                .collect();
            fragment.insert("slot".to_string(), json!(self.home_slot));
            fragment.insert("ports_powered".to_string(), json!(powered));
        }
        Ok(serde_json::Value::Object(fragment))
    }
}

#[async_trait]
impl MetadataSource for SimHub {
    async fn metadata(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "name": self.name,
            "model": "sim-hub",
            "ports": self.ports,
            "bus": self.interface.label(),
        }))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Configuration for a simulated hub candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct SimHubConfig {
    /// Slot the hub is physically plugged into (0 = declared but absent).
    #[serde(default)]
    pub slot: u8,
    /// Number of sub-ports.
    #[serde(default = "default_ports")]
    pub ports: u8,
    /// Electrical interface; keep aligned with the candidate declaration.
    #[serde(default = "default_interface")]
    pub interface: BusInterface,
    /// Candidate id (stamped by the factory caller for fragment names).
    #[serde(default)]
    pub name: String,
    /// Power up with the fault line asserted.
    #[serde(default)]
    pub fault_at_start: bool,
}

fn default_ports() -> u8 {
    4
}

fn default_interface() -> BusInterface {
    BusInterface::I2c
}

/// Factory for simulated hubs, bound to one backplane.
pub struct SimHubFactory {
    backplane: Arc<SimBackplane>,
}

impl SimHubFactory {
    /// Create a factory installing hubs onto `backplane`.
    pub fn new(backplane: Arc<SimBackplane>) -> Self {
        Self { backplane }
    }
}

static SIM_HUB_CAPABILITIES: &[Capability] = &[
    Capability::Presence,
    Capability::SubPorts,
    Capability::Lifecycle,
    Capability::Diagnostics,
    Capability::Metadata,
];

impl DeviceFactory for SimHubFactory {
    fn device_type(&self) -> &'static str {
        "sim_hub"
    }

    fn name(&self) -> &'static str {
        "Simulated Bus Hub"
    }

    fn capabilities(&self) -> &'static [Capability] {
        SIM_HUB_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SimHubConfig = config.clone().try_into()?;
        if cfg.ports == 0 {
            anyhow::bail!("sim hub needs at least one port");
        }
        if cfg.slot > self.backplane.num_slots() {
            anyhow::bail!(
                "slot {} exceeds carrier's {} slots",
                cfg.slot,
                self.backplane.num_slots()
            );
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceCaps>> {
        let backplane = self.backplane.clone();
        Box::pin(async move {
            let cfg: SimHubConfig = config.try_into()?;
            let name = if cfg.name.is_empty() {
                format!("hub-slot{}", cfg.slot)
            } else {
                cfg.name
            };
            let hub = SimHub::install(backplane, name, cfg.slot, cfg.interface, cfg.ports);
            if cfg.fault_at_start {
                hub.assert_fault();
            }
            Ok(DeviceCaps::new()
                .with_presence(hub.clone())
                .with_hub(hub.clone())
                .with_lifecycle(hub.clone())
                .with_diagnostics(hub.clone())
                .with_metadata(hub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Backplane;

    #[tokio::test]
    async fn test_presence_requires_energized_slot() {
        let bp = SimBackplane::new(2);
        let hub = SimHub::install(bp.clone(), "h", 1, BusInterface::I2c, 4);

        assert!(!hub.probe().await.unwrap());
        bp.set_slot_power(1, true).await.unwrap();
        bp.set_slot_data(1, true).await.unwrap();
        assert!(hub.probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_absent_hub_never_answers() {
        let bp = SimBackplane::new(2);
        let hub = SimHub::install(bp.clone(), "ghost", 0, BusInterface::I2c, 4);
        bp.set_slot_power(1, true).await.unwrap();
        bp.set_slot_data(1, true).await.unwrap();
        assert!(!hub.probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_power_cycle_clears_fault_and_ports() {
        let bp = SimBackplane::new(1);
        let hub = SimHub::install(bp.clone(), "h", 1, BusInterface::SerialBus, 2);
        bp.set_slot_power(1, true).await.unwrap();

        hub.assert_fault();
        hub.set_port_power(1, true).await.unwrap();
        assert!(hub.fault_asserted().await.unwrap());

        bp.set_slot_power(1, false).await.unwrap();
        assert!(!hub.fault_asserted().await.unwrap());
        assert!(!hub.port_power(1));
    }

    #[tokio::test]
    async fn test_restart_powers_ports_with_data_off() {
        let bp = SimBackplane::new(1);
        let hub = SimHub::install(bp.clone(), "h", 1, BusInterface::I2c, 3);
        bp.set_slot_power(1, true).await.unwrap();

        hub.set_port_data(2, true).await.unwrap();
        hub.restart().await.unwrap();

        for port in 1..=3 {
            assert!(hub.port_power(port), "port {port} unpowered after restart");
            assert!(!hub.port_data(port), "port {port} data left on");
        }
        assert_eq!(hub.restart_count(), 1);
    }

    #[tokio::test]
    async fn test_hub_control_fails_without_slot_power() {
        let bp = SimBackplane::new(1);
        let hub = SimHub::install(bp, "h", 1, BusInterface::I2c, 2);
        assert!(hub.set_port_power(1, true).await.is_err());
        assert!(hub.restart().await.is_err());
    }

    #[tokio::test]
    async fn test_factory_builds_caps() {
        let bp = SimBackplane::new(2);
        let factory = SimHubFactory::new(bp.clone());
        assert_eq!(factory.device_type(), "sim_hub");

        let config = toml::Value::Table(toml::toml! {
            slot = 2
            ports = 3
            interface = "serial_bus"
        });
        factory.validate(&config).unwrap();
        let caps = factory.build(config).await.unwrap();
        assert!(caps.hub.is_some());
        assert!(caps.presence.is_some());
        assert!(bp.hub_at(2).is_some());
    }

    #[tokio::test]
    async fn test_factory_rejects_out_of_range_slot() {
        let bp = SimBackplane::new(2);
        let factory = SimHubFactory::new(bp);
        let config = toml::Value::Table(toml::toml! {
            slot = 9
        });
        assert!(factory.validate(&config).is_err());
    }
}
