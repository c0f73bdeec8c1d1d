//! Discovery Engine
//!
//! Physical topology is not known in advance: the carrier exposes a fixed
//! number of slots, hubs expose sub-ports, and the candidate pool only says
//! what *could* be plugged in. Discovery infers what actually is, by
//! sequential electrical probing:
//!
//! **Phase A — hub discovery.** Each slot is energized in turn; a bounded
//! generic handshake checks whether some addressed module answers, the two
//! known addressed-hub families are forced into a safe state, and the
//! untested hub candidates are scanned in declaration order. First probe
//! success wins the slot; no backtracking. Bound hubs then get their
//! electrical sub-mode selected and `begin` invoked (with one power cycle
//! first if the fault line is asserted).
//!
//! **Phase B — sensor discovery.** Per bound hub, each sub-port is data-
//! enabled in turn and the untested leaf candidates with a matching
//! interface are scanned the same way. A matching sensor's `keep_powered`
//! flag propagates onto its hub so the sleep policy knows not to cut the
//! slot. Core-wired leaf candidates are probed directly and bound to the
//! controller position.
//!
//! Discovery is idempotent (bindings are reset on entry) and never fatal:
//! an empty system is a valid terminal state, surfaced only through the
//! aggregate `missing` indicator and per-device error tallies.

use crate::bus::{BusPath, BusSequencer};
use crate::device::{BusInterface, DeviceKind, Position, Presence};
use crate::registry::{DeviceIndex, DeviceTable};
use std::sync::Arc;

/// Aggregate result of a discovery run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryOutcome {
    /// Hubs bound to slots.
    pub hubs_bound: usize,
    /// Leaf sensors bound to positions.
    pub sensors_bound: usize,
    /// Any declared candidate left unbound (status-light indicator).
    pub missing: bool,
}

/// Run full discovery: reset bindings, Phase A, hub init, Phase B.
pub async fn run_discovery(table: &mut DeviceTable, bus: &BusSequencer) -> DiscoveryOutcome {
    table.reset_bindings();

    let hubs_bound = discover_hubs(table, bus).await;
    init_hubs(table, bus).await;
    let sensors_bound = discover_sensors(table, bus).await;

    finalize_candidates(table);
    let outcome = DiscoveryOutcome {
        hubs_bound,
        sensors_bound,
        missing: table.any_missing(),
    };
    tracing::info!(
        hubs = outcome.hubs_bound,
        sensors = outcome.sensors_bound,
        missing = outcome.missing,
        "discovery complete"
    );
    outcome
}

/// Snapshot of one candidate's probe handle.
struct ProbeCandidate {
    idx: DeviceIndex,
    name: String,
    presence: Arc<dyn Presence>,
}

fn probe_candidates(
    table: &DeviceTable,
    kind: DeviceKind,
    interface: Option<BusInterface>,
) -> Vec<ProbeCandidate> {
    table
        .untested(kind)
        .into_iter()
        .filter_map(|idx| {
            let record = table.record(idx);
            if let Some(wanted) = interface {
                if record.interface != wanted {
                    return None;
                }
            }
            record.caps.presence.clone().map(|presence| ProbeCandidate {
                idx,
                name: record.name.clone(),
                presence,
            })
        })
        .collect()
}

/// Phase A: scan every slot for a hub.
async fn discover_hubs(table: &mut DeviceTable, bus: &BusSequencer) -> usize {
    let mut bound = 0usize;

    for slot in 1..=bus.num_slots() {
        let candidates = probe_candidates(table, DeviceKind::Hub, None);
        if candidates.is_empty() {
            break;
        }

        // The addressed probe mode serves the generic handshake; candidate
        // probes answer on their own interface once energized.
        let path = BusPath::to_hub(slot, BusInterface::I2c);
        let matched = bus
            .with_exclusive_access(&path, || async {
                let answered = bus.handshake().await;
                tracing::debug!(slot, answered, "slot handshake");

                // Addressed hub families power up in a state that can
                // backfeed an unrelated port; force them low before probing.
                if let Err(e) = bus.quiesce_addressed_hubs().await {
                    tracing::warn!(slot, error = %e, "hub quiesce failed");
                }

                for candidate in &candidates {
                    match candidate.presence.probe().await {
                        Ok(true) => return Ok(Some(candidate.idx)),
                        Ok(false) => {}
                        Err(e) => {
                            tracing::debug!(device = %candidate.name, error = %e, "hub probe error")
                        }
                    }
                }
                Ok(None)
            })
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(slot, error = %e, "slot scan failed");
                None
            });

        if let Some(idx) = matched {
            match table.bind(idx, Position::hub(slot)) {
                Ok(()) => {
                    bound += 1;
                    tracing::info!(slot, device = %table.record(idx).name, "hub bound");
                }
                Err(e) => tracing::warn!(slot, error = %e, "hub bind refused"),
            }
        }
    }

    bound
}

/// Select sub-modes and run `begin` on every bound hub.
async fn init_hubs(table: &mut DeviceTable, bus: &BusSequencer) {
    for idx in table.bound_hubs() {
        let record = table.record(idx);
        let Some(position) = record.position else {
            continue;
        };
        if record.interface == BusInterface::Core {
            continue;
        }
        let slot = position.hub_slot;
        let interface = record.interface;
        let hub_ctl = record.caps.hub.clone();
        let lifecycle = record.caps.lifecycle.clone();
        let name = record.name.clone();

        if let Err(e) = bus.select_mode(interface).await {
            tracing::warn!(device = %name, error = %e, "sub-mode select failed");
        }

        let path = BusPath::to_hub(slot, interface);
        let begun = bus
            .with_exclusive_access(&path, || async {
                if let Some(hub) = &hub_ctl {
                    if hub.fault_asserted().await.unwrap_or(false) {
                        tracing::warn!(device = %name, slot, "fault line asserted; power cycling");
                        bus.power_cycle_slot(slot).await?;
                    }
                }
                match &lifecycle {
                    Some(lifecycle) => {
                        let report = lifecycle.begin().await?;
                        if report.critical_fault {
                            tracing::warn!(device = %name, "hub reported critical fault at begin");
                        }
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await;

        match begun {
            Ok(ran) => {
                if ran {
                    table.record_mut(idx).begun = true;
                }
            }
            Err(e) => {
                tracing::warn!(device = %name, error = %e, "hub init failed");
                table.tally_error(idx);
            }
        }
    }
}

/// Phase B: scan each bound hub's sub-ports, then core-wired candidates.
async fn discover_sensors(table: &mut DeviceTable, bus: &BusSequencer) -> usize {
    let mut bound = 0usize;

    for hub_idx in table.bound_hubs() {
        let record = table.record(hub_idx);
        let (Some(position), Some(hub_ctl)) = (record.position, record.caps.hub.clone()) else {
            continue;
        };
        if record.interface == BusInterface::None {
            continue;
        }
        let slot = position.hub_slot;
        let interface = record.interface;
        let candidates = probe_candidates(table, DeviceKind::Leaf, Some(interface));
        if candidates.is_empty() {
            continue;
        }

        let path = BusPath::to_hub(slot, interface);
        let settle = bus.settle();
        let hub_for_scan = hub_ctl.clone();
        let matches: Vec<(u8, DeviceIndex)> = bus
            .with_exclusive_access(&path, || async {
                let hub = hub_for_scan;
                hub.all_ports_data_off().await?;

                let mut found: Vec<(u8, DeviceIndex)> = Vec::new();
                for port in 1..=hub.num_sub_ports() {
                    if let Err(e) = hub.set_port_data(port, true).await {
                        tracing::warn!(slot, port, error = %e, "port enable failed");
                        continue;
                    }
                    tokio::time::sleep(settle).await;

                    for candidate in &candidates {
                        if found.iter().any(|(_, idx)| *idx == candidate.idx) {
                            continue;
                        }
                        match candidate.presence.probe().await {
                            Ok(true) => {
                                found.push((port, candidate.idx));
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => tracing::debug!(
                                device = %candidate.name,
                                error = %e,
                                "leaf probe error"
                            ),
                        }
                    }

                    // Disabled regardless of match outcome.
                    if let Err(e) = hub.set_port_data(port, false).await {
                        tracing::warn!(slot, port, error = %e, "port disable failed");
                    }
                }
                Ok(found)
            })
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(slot, error = %e, "sub-port scan failed");
                Vec::new()
            });

        for (port, idx) in matches {
            match table.bind(idx, Position::leaf(slot, port)) {
                Ok(()) => {
                    bound += 1;
                    let keep = table.record(idx).keep_powered;
                    tracing::info!(
                        slot,
                        port,
                        device = %table.record(idx).name,
                        keep_powered = keep,
                        "sensor bound"
                    );
                    if keep {
                        // The hub-level sleep policy must not cut this slot.
                        table.record_mut(hub_idx).keep_powered = true;
                    }
                }
                Err(e) => tracing::warn!(slot, port, error = %e, "sensor bind refused"),
            }
        }
    }

    bound += discover_core_sensors(table, bus).await;
    bound
}

/// Core-wired leaf candidates are probed without energizing anything.
async fn discover_core_sensors(table: &mut DeviceTable, bus: &BusSequencer) -> usize {
    let mut bound = 0usize;
    let candidates = probe_candidates(table, DeviceKind::Leaf, Some(BusInterface::Core));
    for candidate in candidates {
        let present = bus
            .with_exclusive_access(&BusPath::core(), || async {
                candidate.presence.probe().await
            })
            .await
            .unwrap_or(false);
        if present {
            match table.bind(candidate.idx, Position::CORE) {
                Ok(()) => {
                    bound += 1;
                    tracing::info!(device = %candidate.name, "core sensor bound");
                }
                Err(e) => tracing::warn!(device = %candidate.name, error = %e, "core bind refused"),
            }
        }
    }
    bound
}

/// Close out the candidate pool: every unbound candidate is marked tested
/// (the positions it could map to are exhausted) and tallies one miss.
fn finalize_candidates(table: &mut DeviceTable) {
    let misses: Vec<DeviceIndex> = table
        .indices()
        .filter(|&idx| {
            let r = table.record(idx);
            r.kind != DeviceKind::Core && r.position.is_none()
        })
        .collect();
    for idx in misses {
        let record = table.record_mut(idx);
        record.tested = true;
        tracing::warn!(device = %record.name, "candidate not found on any position");
        table.tally_error(idx);
    }
}
