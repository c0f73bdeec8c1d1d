//! Power/Sleep Sequencing
//!
//! Between measurement cycles the node drops everything it can. Two
//! device-driven passes over the bound topology:
//!
//! - **Sleep**: leafs without `keep_powered` lose their port power; leafs
//!   with it are put to sleep in place. Hubs with no `keep_powered` leaf
//!   attached lose slot power entirely, and empty slots are powered off.
//! - **Wake**: every slot is powered, each hub's `restart` re-enables its
//!   sub-ports (data left disabled so the next energize starts from a known
//!   state), and each bound leaf is briefly data-enabled to wake.
//!
//! Sleep followed by Wake restores every bound position's reachability
//! without re-running discovery. Failures here are logged and skipped —
//! a sensor that missed its wake call shows up as nulls in the next data
//! pass, which is the established failure surface.

use crate::bus::{BusPath, BusSequencer};
use crate::device::Position;
use crate::registry::DeviceTable;

/// Sleep pass over the bound topology.
pub async fn sleep_all(table: &DeviceTable, bus: &BusSequencer) {
    // Leafs first: port power cuts need their hub still powered.
    for idx in table.bound_leafs() {
        let record = table.record(idx);
        let Some(position) = record.position else {
            continue;
        };

        if position.is_core() {
            if record.keep_powered {
                if let Some(sleep_wake) = record.caps.sleep_wake.clone() {
                    if let Err(e) = sleep_wake.sleep().await {
                        tracing::warn!(device = %record.name, error = %e, "core sleep failed");
                    }
                }
            }
            continue;
        }

        let Some(hub_ctl) = table
            .device_at(Position::hub(position.hub_slot))
            .and_then(|hub_idx| table.record(hub_idx).caps.hub.clone())
        else {
            continue;
        };

        if record.keep_powered {
            let Some(sleep_wake) = record.caps.sleep_wake.clone() else {
                continue;
            };
            let path = BusPath::to_leaf(position, record.interface, hub_ctl);
            let slept = bus
                .with_exclusive_access(&path, || async { sleep_wake.sleep().await })
                .await;
            if let Err(e) = slept {
                tracing::warn!(device = %record.name, error = %e, "sleep failed");
            }
        } else {
            let hub_iface = table
                .device_at(Position::hub(position.hub_slot))
                .map(|i| table.record(i).interface)
                .unwrap_or(record.interface);
            let path = BusPath::to_hub(position.hub_slot, hub_iface);
            let port = position.sub_port;
            let hub_for_cut = hub_ctl.clone();
            let cut = bus
                .with_exclusive_access(&path, || async {
                    hub_for_cut.set_port_power(port, false).await
                })
                .await;
            if let Err(e) = cut {
                tracing::warn!(device = %record.name, error = %e, "port power cut failed");
            }
        }
    }

    // Hubs without a keep-powered leaf lose the whole slot.
    let mut keep_slots = std::collections::HashSet::new();
    for idx in table.bound_hubs() {
        let record = table.record(idx);
        let Some(position) = record.position else {
            continue;
        };
        if record.keep_powered {
            keep_slots.insert(position.hub_slot);
        }
    }

    for slot in 1..=bus.num_slots() {
        if keep_slots.contains(&slot) {
            continue;
        }
        if let Err(e) = bus.slot_power(slot, false).await {
            tracing::warn!(slot, error = %e, "slot power-down failed");
        }
    }

    tracing::debug!(kept = keep_slots.len(), "sleep pass complete");
}

/// Wake pass over the bound topology.
pub async fn wake_all(table: &DeviceTable, bus: &BusSequencer) {
    for slot in 1..=bus.num_slots() {
        if let Err(e) = bus.slot_power(slot, true).await {
            tracing::warn!(slot, error = %e, "slot power-up failed");
        }
    }

    // Hubs restart their sub-ports; the sequencer's release leaves slot
    // data disabled afterward, the known state the next energize expects.
    for idx in table.bound_hubs() {
        let record = table.record(idx);
        let (Some(position), Some(hub_ctl)) = (record.position, record.caps.hub.clone()) else {
            continue;
        };
        let path = BusPath::to_hub(position.hub_slot, record.interface);
        let restarted = bus
            .with_exclusive_access(&path, || async { hub_ctl.restart().await })
            .await;
        if let Err(e) = restarted {
            tracing::warn!(device = %record.name, error = %e, "hub restart failed");
        }
    }

    // Leafs get a brief data window to wake.
    for idx in table.bound_leafs() {
        let record = table.record(idx);
        let Some(position) = record.position else {
            continue;
        };
        let Some(sleep_wake) = record.caps.sleep_wake.clone() else {
            continue;
        };

        if position.is_core() {
            if let Err(e) = sleep_wake.wake().await {
                tracing::warn!(device = %record.name, error = %e, "core wake failed");
            }
            continue;
        }

        let Some(hub_ctl) = table
            .device_at(Position::hub(position.hub_slot))
            .and_then(|hub_idx| table.record(hub_idx).caps.hub.clone())
        else {
            continue;
        };
        let path = BusPath::to_leaf(position, record.interface, hub_ctl);
        let woken = bus
            .with_exclusive_access(&path, || async { sleep_wake.wake().await })
            .await;
        if let Err(e) = woken {
            tracing::warn!(device = %record.name, error = %e, "wake failed");
        }
    }

    tracing::debug!("wake pass complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::discovery::run_discovery;
    use crate::registry::CandidateRegistry;
    use crate::sim::{SimBackplane, SimHubFactory, SimLeafFactory};
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    const RIG: &str = r#"
        [node]
        name = "t"
        hub_slots = 3

        [[hubs]]
        id = "bh-a"
        type = "sim_hub"
        interface = "i2c"
        config = { slot = 1, ports = 2, interface = "i2c", name = "bh-a" }

        [[hubs]]
        id = "bh-b"
        type = "sim_hub"
        interface = "serial_bus"
        config = { slot = 2, ports = 2, interface = "serial_bus", name = "bh-b" }

        [[sensors]]
        id = "soil"
        type = "sim_leaf"
        interface = "i2c"
        config = { hub_slot = 1, port = 1, name = "soil", fields = ["vwc"], values = [0.3] }

        [[sensors]]
        id = "snow"
        type = "sim_leaf"
        interface = "serial_bus"
        keep_powered = true
        config = { hub_slot = 2, port = 2, name = "snow", fields = ["depth"], values = [12.0] }
    "#;

    async fn rig() -> (DeviceTable, BusSequencer, Arc<SimBackplane>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RIG.as_bytes()).unwrap();
        let config = NodeConfig::load_from(file.path()).unwrap();

        let backplane = SimBackplane::new(3);
        let mut registry = CandidateRegistry::new();
        registry.register_factory(Box::new(SimHubFactory::new(backplane.clone())));
        registry.register_factory(Box::new(SimLeafFactory::new(backplane.clone())));
        let mut table = registry.build_table(&config).await.unwrap();

        let bus = BusSequencer::new(backplane.clone()).with_settle(Duration::ZERO);
        run_discovery(&mut table, &bus).await;
        (table, bus, backplane)
    }

    #[tokio::test]
    async fn test_sleep_cuts_unkept_slots_and_keeps_flagged() {
        let (table, bus, bp) = rig().await;
        sleep_all(&table, &bus).await;

        // Hub bh-a has no keep-powered leaf: slot 1 is dark. Hub bh-b
        // carries the flagged snow sensor: slot 2 stays powered. Slot 3 is
        // empty and also dark.
        assert!(!bp.is_powered(1));
        assert!(bp.is_powered(2));
        assert!(!bp.is_powered(3));
    }

    #[tokio::test]
    async fn test_sleep_uses_sleep_capability_for_kept_leaf() {
        let (table, bus, bp) = rig().await;
        sleep_all(&table, &bus).await;

        let hub_b = bp.hub_at(2).unwrap();
        // snow slept in place; its port power was not cut.
        assert!(hub_b.port_power(2), "kept leaf lost port power");
    }

    #[tokio::test]
    async fn test_wake_restores_reachability() {
        let (table, bus, bp) = rig().await;
        sleep_all(&table, &bus).await;
        wake_all(&table, &bus).await;

        // Both hubs restarted, all slots powered, bus quiet again.
        assert!(bp.is_powered(1) && bp.is_powered(2));
        assert_eq!(bp.data_enabled_count(), 0);
        assert!(bp.hub_at(1).unwrap().restart_count() >= 1);

        // A previously bound leaf answers a probe through the sequencer.
        let soil_idx = table.device_at(crate::device::Position::leaf(1, 1)).unwrap();
        let record = table.record(soil_idx);
        let presence = record.caps.presence.clone().unwrap();
        let hub = table
            .device_at(crate::device::Position::hub(1))
            .and_then(|i| table.record(i).caps.hub.clone())
            .unwrap();
        let path = BusPath::to_leaf(record.position.unwrap(), record.interface, hub);
        let present = bus
            .with_exclusive_access(&path, || async { presence.probe().await })
            .await
            .unwrap();
        assert!(present, "leaf unreachable after sleep/wake round trip");
    }
}
