//! Node Configuration
//!
//! Strongly-typed configuration loading for the sensing node. Configuration
//! is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables (prefixed with FIELDLOG_)
//!
//! The candidate pool — the set of hub and leaf-sensor types this node could
//! possibly carry — is fixed here at config time. Discovery binds candidates
//! to physical positions at runtime; it never invents devices that are not
//! declared below.
//!
//! # Example
//! ```no_run
//! use fieldlog::config::NodeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::load_from("config/node.toml")?;
//! println!("Node: {}", config.node.name);
//! # Ok(())
//! # }
//! ```

use crate::device::{BusInterface, DeviceKind};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node-level settings.
    pub node: NodeSection,
    /// Discovery and bus sequencing timings.
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Hub candidates, in declaration order (discovery tie-break order).
    #[serde(default)]
    pub hubs: Vec<CandidateDecl>,
    /// Leaf-sensor candidates, in declaration order.
    #[serde(default)]
    pub sensors: Vec<CandidateDecl>,
}

/// Node identity and framing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Operator-assigned short node id ("" = fall back to hardware id).
    #[serde(default)]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Measurement cycle period.
    #[serde(with = "humantime_serde", default = "default_log_period")]
    pub log_period: Duration,
    /// Hard byte budget for one outgoing message frame.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// Number of physical hub slots on the carrier board.
    #[serde(default = "default_hub_slots")]
    pub hub_slots: u8,
    /// Diagnostic verbosity for the diagnostic pass (1..=5).
    #[serde(default = "default_verbosity")]
    pub diagnostic_verbosity: u8,
    /// Number of configured backhaul transports (reported in metadata).
    #[serde(default = "default_backhaul_count")]
    pub backhaul_count: u8,
    /// Power-save mode label reported in metadata ("off", "standby", "deep").
    #[serde(default = "default_power_save")]
    pub power_save: String,
}

/// Discovery/bus timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Bounded wait for the generic addressed-bus handshake.
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    /// Settle delay after enabling a data path.
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            settle: default_settle(),
        }
    }
}

/// One candidate declaration in the pool.
///
/// `kind` is implied by the section it appears in (`[[hubs]]` vs
/// `[[sensors]]`); the registry stamps it when building the device table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDecl {
    /// Unique device identifier (appears in every fragment).
    pub id: String,
    /// Factory key (e.g. "sim_hub", "serial_probe").
    pub r#type: String,
    /// Electrical interface this candidate speaks.
    pub interface: BusInterface,
    /// Leaf only: keep port power applied during sleep.
    #[serde(default)]
    pub keep_powered: bool,
    /// Whether this candidate participates in discovery.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Device-specific configuration (dynamic, passed to the factory).
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_period() -> Duration {
    Duration::from_secs(900)
}

fn default_max_message_length() -> usize {
    1024
}

fn default_hub_slots() -> u8 {
    4
}

fn default_verbosity() -> u8 {
    2
}

fn default_backhaul_count() -> u8 {
    1
}

fn default_power_save() -> String {
    "standby".to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_settle() -> Duration {
    Duration::from_millis(10)
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl NodeConfig {
    /// Load configuration from a TOML file merged with FIELDLOG_ env vars.
    ///
    /// Environment variables override file values, e.g.
    /// `FIELDLOG_NODE_LOG_LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FIELDLOG_").split("_"))
            .extract()
    }

    /// Load configuration from an in-memory TOML string (demo/tests).
    pub fn load_str(toml_text: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::string(toml_text))
            .merge(Env::prefixed("FIELDLOG_").split("_"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.node.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.node.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.node.hub_slots == 0 {
            return Err("hub_slots must be at least 1".to_string());
        }

        if !(1..=5).contains(&self.node.diagnostic_verbosity) {
            return Err(format!(
                "Invalid diagnostic_verbosity {}. Must be 1-5",
                self.node.diagnostic_verbosity
            ));
        }

        // The frame envelope (header + suffix) needs headroom for at least
        // one small fragment; anything tighter is a deployment mistake.
        if self.node.max_message_length < 128 {
            return Err(format!(
                "max_message_length {} too small (minimum 128)",
                self.node.max_message_length
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for decl in self.hubs.iter().chain(self.sensors.iter()) {
            if !ids.insert(&decl.id) {
                return Err(format!("Duplicate candidate id: {}", decl.id));
            }
        }

        for hub in &self.hubs {
            if hub.interface == BusInterface::Core {
                return Err(format!(
                    "Hub '{}' declares a core interface; hubs occupy slots",
                    hub.id
                ));
            }
        }
        for sensor in &self.sensors {
            if sensor.interface == BusInterface::None {
                return Err(format!(
                    "Sensor '{}' declares no interface; leafs must be reachable",
                    sensor.id
                ));
            }
        }

        Ok(())
    }

    /// Enabled candidates of one kind, in declaration order.
    pub fn enabled_candidates(&self, kind: DeviceKind) -> Vec<&CandidateDecl> {
        let list = match kind {
            DeviceKind::Hub => &self.hubs,
            DeviceKind::Leaf => &self.sensors,
            DeviceKind::Core => return Vec::new(),
        };
        list.iter().filter(|decl| decl.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
            [node]
            name = "ridge-07"

            [[hubs]]
            id = "bh1"
            type = "sim_hub"
            interface = "serial_bus"

            [[sensors]]
            id = "soil1"
            type = "sim_leaf"
            interface = "serial_bus"
            keep_powered = true
        "#
    }

    #[test]
    fn test_load_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();

        let config = NodeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.node.name, "ridge-07");
        assert_eq!(config.node.hub_slots, 4);
        assert_eq!(config.node.max_message_length, 1024);
        assert_eq!(config.discovery.settle, Duration::from_millis(10));
        assert_eq!(config.hubs.len(), 1);
        assert!(config.sensors[0].keep_powered);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
            [node]
            name = "x"

            [[sensors]]
            id = "dup"
            type = "sim_leaf"
            interface = "i2c"

            [[sensors]]
            id = "dup"
            type = "sim_leaf"
            interface = "i2c"
        "#,
        )
        .unwrap();

        let config = NodeConfig::load_from(file.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.contains("Duplicate candidate id"), "got: {err}");
    }

    #[test]
    fn test_validate_rejects_core_hub() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
            [node]
            name = "x"

            [[hubs]]
            id = "h"
            type = "sim_hub"
            interface = "core"
        "#,
        )
        .unwrap();

        let config = NodeConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_candidates_filters_disabled() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
            [node]
            name = "x"

            [[sensors]]
            id = "a"
            type = "sim_leaf"
            interface = "i2c"

            [[sensors]]
            id = "b"
            type = "sim_leaf"
            interface = "i2c"
            enabled = false
        "#,
        )
        .unwrap();

        let config = NodeConfig::load_from(file.path()).unwrap();
        let enabled = config.enabled_candidates(DeviceKind::Leaf);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "a");
    }
}
