//! Device Capability Model
//!
//! This module defines fine-grained capability traits that hubs and leaf
//! sensors implement. Instead of one monolithic `Device` trait with stub
//! methods returning empty sentinels, devices implement exactly the
//! capabilities they support:
//!
//! - A bus hub implements: `Presence + HubControl + Lifecycle + DiagnosticsSource`
//! - A soil probe might implement: `Presence + TelemetrySource + SleepWake`
//! - The controller's own clock reports only `TelemetrySource + MetadataSource`
//!
//! The set a device exposes lives in [`crate::registry::DeviceCaps`], a bag
//! of `Option<Arc<dyn ...>>` populated by the device's factory. Code that
//! needs a capability checks the `Option`; a missing capability is a skipped
//! query, never a runtime sentinel.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Query capabilities return `serde_json::Value` object fragments; the packet
//! assembler serializes them and owns the byte budget. A fragment of
//! `Value::Null` means "nothing to report this pass" and is skipped.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Position
// =============================================================================

/// Physical address of a device after discovery: (hub slot, sub-port).
///
/// Both coordinates are 1-based. `hub_slot == 0` means unassigned;
/// `sub_port == 0` means "unassigned, or is itself a hub occupying the
/// slot". Leaf sensors wired straight to the controller use
/// [`Position::CORE`] = (0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Controller expansion slot, 1-based (0 = unassigned).
    pub hub_slot: u8,
    /// Hub sub-port, 1-based (0 = unassigned or hub-occupies-slot).
    pub sub_port: u8,
}

impl Position {
    /// The controller itself: leaf sensors with a core interface live here.
    pub const CORE: Position = Position {
        hub_slot: 0,
        sub_port: 0,
    };

    /// Position of a hub bound to `slot`.
    pub fn hub(slot: u8) -> Self {
        Position {
            hub_slot: slot,
            sub_port: 0,
        }
    }

    /// Position of a leaf on `slot`/`port`.
    pub fn leaf(slot: u8, port: u8) -> Self {
        Position {
            hub_slot: slot,
            sub_port: port,
        }
    }

    /// True for (0, 0), the directly-wired controller position.
    pub fn is_core(&self) -> bool {
        self.hub_slot == 0 && self.sub_port == 0
    }

    /// True when this position names an energizable path (a real slot).
    ///
    /// A leaf with `sub_port == 0` on a non-zero slot would be a hub, not a
    /// leaf; leaf positions are only energizable with both coordinates set.
    pub fn is_energizable(&self) -> bool {
        self.hub_slot > 0
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hub_slot, self.sub_port)
    }
}

// =============================================================================
// Bus Interface Kind
// =============================================================================

/// Electrical interface a device speaks on the shared bus.
///
/// Hubs use {DirectGpio, I2c, SerialBus, None}; leaf sensors use
/// {DirectGpio, I2c, SerialBus, Core}. The sequencer selects the matching
/// port-direction/electrical mode before enabling data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusInterface {
    /// Direct GPIO lines routed through the slot.
    DirectGpio,
    /// Addressed I2C expander behind the slot.
    I2c,
    /// Shared asynchronous serial bus (multidrop).
    SerialBus,
    /// Wired straight to the controller; no slot, always reachable.
    Core,
    /// No data interface (power-only hub).
    None,
}

impl BusInterface {
    /// Human-readable label for logs and metadata fragments.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DirectGpio => "direct_gpio",
            Self::I2c => "i2c",
            Self::SerialBus => "serial_bus",
            Self::Core => "core",
            Self::None => "none",
        }
    }
}

// =============================================================================
// Device Kind
// =============================================================================

/// Tagged variant over the three device families.
///
/// The few call sites that branch on family (power policy, whether to
/// recurse into sub-ports) pattern-match on this instead of downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Built into the controller; always present, no coordinate.
    Core,
    /// Bus expander occupying one controller slot, owning 1..N sub-ports.
    Hub,
    /// Terminal measurement device on a hub sub-port or the core position.
    Leaf,
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: Presence Test
///
/// The discovery probe. Implementations answer "is my hardware electrically
/// reachable right now?" under the assumption that the sequencer has already
/// energized exactly one candidate path.
///
/// # Contract
/// - Must be side-effect free beyond the probe transaction itself
/// - Must complete within the discovery settle budget (tens of ms)
/// - `Ok(false)` and `Err` both mean "not here" to discovery; `Err` is
///   additionally logged
#[async_trait]
pub trait Presence: Send + Sync {
    /// Probe for the device on the currently energized path.
    async fn probe(&self) -> Result<bool>;
}

/// Capability: Telemetry Query
///
/// Devices that produce measurement data each logging cycle.
///
/// # Contract
/// - Returns a JSON object fragment (`{"name":...,"fields"...}` content)
/// - A failed read is reported as null-valued fields, not an `Err`; `Err`
///   is reserved for transport-level surprises and increments the device's
///   error tally
/// - `Value::Null` means "nothing to report" and is skipped by the assembler
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Produce this cycle's telemetry fragment.
    async fn telemetry(&self) -> Result<serde_json::Value>;
}

/// Capability: Diagnostic Query
///
/// # Contract
/// - `verbosity` ranges 1 (minimal) to 5 (maximum); implementations clamp
/// - Same fragment conventions as [`TelemetrySource`]
#[async_trait]
pub trait DiagnosticsSource: Send + Sync {
    /// Produce a diagnostic fragment at the given verbosity.
    async fn diagnostics(&self, verbosity: u8) -> Result<serde_json::Value>;
}

/// Capability: Metadata Query
///
/// Static identification data (model, serial, firmware revision), typically
/// read once and transmitted on demand rather than every cycle.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Produce the device's metadata fragment.
    async fn metadata(&self) -> Result<serde_json::Value>;
}

/// Outcome of a device's `begin` initialization.
#[derive(Debug, Clone)]
pub struct InitReport {
    /// Fragment folded into the init-pass frame (may be `Value::Null`).
    pub fragment: serde_json::Value,
    /// Device cannot operate; surfaced on the status indicator.
    pub critical_fault: bool,
    /// Device degraded but usable.
    pub recoverable_fault: bool,
}

impl InitReport {
    /// A clean init with the given fragment.
    pub fn ok(fragment: serde_json::Value) -> Self {
        Self {
            fragment,
            critical_fault: false,
            recoverable_fault: false,
        }
    }
}

/// Capability: Initialization Lifecycle
///
/// Runs once after a device is bound to a position (hubs during discovery,
/// leafs during the init pass). Fault flags are aggregated across all
/// devices for the status indicator; they never halt other devices.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Complete device initialization on its energized path.
    async fn begin(&self) -> Result<InitReport>;
}

/// Capability: Sleep/Wake
///
/// Leaf sensors flagged `keep_powered` are put to sleep in place instead of
/// having their port power cut; every bound leaf is woken after slot power
/// returns.
#[async_trait]
pub trait SleepWake: Send + Sync {
    /// Enter the device's low-power state (power stays applied).
    async fn sleep(&self) -> Result<()>;

    /// Return from low-power state.
    async fn wake(&self) -> Result<()>;
}

/// Capability: Device-Owned Error Counter
///
/// Devices that keep their own failure tally (a serial sensor counts
/// exhausted retry budgets internally). The error pass sums this with the
/// table-level tally when deciding what to report.
pub trait ErrorTally: Send + Sync {
    /// Errors accumulated by the device itself.
    fn error_count(&self) -> u32;
}

/// Capability: Hub Sub-Port Control
///
/// Bus expanders that gate power and data per sub-port independently.
///
/// # Contract
/// - Ports are 1-based, `1..=num_sub_ports()`
/// - `restart` power-cycles every sub-port and leaves them powered with
///   data disabled
/// - `fault_asserted` samples the hub's fault line; a faulted hub is
///   power-cycled once before `begin`
#[async_trait]
pub trait HubControl: Send + Sync {
    /// Number of sub-ports this hub exposes.
    fn num_sub_ports(&self) -> u8;

    /// Gate power to one sub-port.
    async fn set_port_power(&self, port: u8, on: bool) -> Result<()>;

    /// Gate data to one sub-port.
    async fn set_port_data(&self, port: u8, on: bool) -> Result<()>;

    /// Disable data on every sub-port.
    async fn all_ports_data_off(&self) -> Result<()> {
        for port in 1..=self.num_sub_ports() {
            self.set_port_data(port, false).await?;
        }
        Ok(())
    }

    /// Power-cycle all sub-ports (used by the wake sequence).
    async fn restart(&self) -> Result<()>;

    /// Sample the hub's fault line.
    async fn fault_asserted(&self) -> Result<bool> {
        Ok(false)
    }
}

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for introspection and metadata output.
///
/// Mirrors the capability traits as an enum for listing what a device
/// supports without checking each trait object individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Answers discovery probes ([`Presence`])
    Presence,
    /// Produces telemetry fragments ([`TelemetrySource`])
    Telemetry,
    /// Produces diagnostic fragments ([`DiagnosticsSource`])
    Diagnostics,
    /// Produces metadata fragments ([`MetadataSource`])
    Metadata,
    /// Has an initialization lifecycle ([`Lifecycle`])
    Lifecycle,
    /// Supports sleep/wake in place ([`SleepWake`])
    SleepWake,
    /// Owns gated sub-ports ([`HubControl`])
    SubPorts,
    /// Keeps its own error tally ([`ErrorTally`])
    Errors,
}

impl Capability {
    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Presence => "Presence",
            Self::Telemetry => "Telemetry",
            Self::Diagnostics => "Diagnostics",
            Self::Metadata => "Metadata",
            Self::Lifecycle => "Lifecycle",
            Self::SleepWake => "Sleep/Wake",
            Self::SubPorts => "Sub-Ports",
            Self::Errors => "Error Tally",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_core() {
        assert!(Position::CORE.is_core());
        assert!(!Position::CORE.is_energizable());
        assert!(!Position::hub(1).is_core());
        assert!(Position::hub(1).is_energizable());
        assert!(Position::leaf(2, 3).is_energizable());
    }

    #[test]
    fn test_position_display() {
        assert_eq!(Position::leaf(2, 3).to_string(), "2:3");
        assert_eq!(Position::hub(1).to_string(), "1:0");
    }

    #[test]
    fn test_interface_labels() {
        assert_eq!(BusInterface::SerialBus.label(), "serial_bus");
        assert_eq!(BusInterface::Core.label(), "core");
    }

    #[test]
    fn test_interface_serde_round_trip() {
        let json = serde_json::to_string(&BusInterface::DirectGpio).unwrap();
        assert_eq!(json, "\"direct_gpio\"");
        let back: BusInterface = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BusInterface::DirectGpio);
    }

    struct NullHub;

    #[async_trait]
    impl HubControl for NullHub {
        fn num_sub_ports(&self) -> u8 {
            3
        }
        async fn set_port_power(&self, _port: u8, _on: bool) -> Result<()> {
            Ok(())
        }
        async fn set_port_data(&self, _port: u8, _on: bool) -> Result<()> {
            Ok(())
        }
        async fn restart(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hub_defaults() {
        let hub = NullHub;
        assert!(hub.all_ports_data_off().await.is_ok());
        assert!(!hub.fault_asserted().await.unwrap());
    }
}
