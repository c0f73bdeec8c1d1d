//! Simulated carrier backplane.

use crate::bus::Backplane;
use crate::device::BusInterface;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::hub::SimHub;

struct RailState {
    power: Vec<bool>,
    data: Vec<bool>,
    mode: BusInterface,
}

/// Simulated slot rails, data gates, and the shared-bus mode switch.
///
/// Also acts as the "physical world": hubs register themselves at their
/// slot when installed, and leafs resolve their hub through
/// [`SimBackplane::hub_at`]. Tests introspect rail state to assert the
/// sequencer's invariants.
pub struct SimBackplane {
    slots: u8,
    state: Mutex<RailState>,
    hubs: Mutex<HashMap<u8, Arc<SimHub>>>,
    quiesce_count: AtomicU32,
}

impl SimBackplane {
    /// Create a backplane with the given number of slots.
    pub fn new(slots: u8) -> Arc<Self> {
        Arc::new(Self {
            slots,
            state: Mutex::new(RailState {
                power: vec![false; slots as usize + 1],
                data: vec![false; slots as usize + 1],
                mode: BusInterface::None,
            }),
            hubs: Mutex::new(HashMap::new()),
            quiesce_count: AtomicU32::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RailState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_slot(&self, slot: u8) -> Result<()> {
        if slot == 0 || slot > self.slots {
            anyhow::bail!("slot {} out of range 1..={}", slot, self.slots);
        }
        Ok(())
    }

    /// Register a hub as physically occupying `slot`.
    pub(super) fn install_hub(&self, slot: u8, hub: Arc<SimHub>) {
        self.hubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot, hub);
    }

    /// The hub physically installed at `slot`, if any.
    pub fn hub_at(&self, slot: u8) -> Option<Arc<SimHub>> {
        self.hubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&slot)
            .cloned()
    }

    /// True when `slot` has both power and data enabled.
    pub fn is_energized(&self, slot: u8) -> bool {
        let state = self.lock();
        let i = slot as usize;
        i < state.power.len() && state.power[i] && state.data[i]
    }

    /// True when `slot` is powered.
    pub fn is_powered(&self, slot: u8) -> bool {
        let state = self.lock();
        (slot as usize) < state.power.len() && state.power[slot as usize]
    }

    /// The single data-enabled slot, if exactly one is enabled.
    pub fn active_slot(&self) -> Option<u8> {
        let state = self.lock();
        let mut active = None;
        for slot in 1..=self.slots {
            if state.data[slot as usize] {
                if active.is_some() {
                    return None;
                }
                active = Some(slot);
            }
        }
        active
    }

    /// Number of data-enabled slots (sequencer invariant: never > 1 during
    /// a body).
    pub fn data_enabled_count(&self) -> usize {
        let state = self.lock();
        state.data.iter().filter(|&&on| on).count()
    }

    /// Currently selected electrical mode.
    pub fn mode(&self) -> BusInterface {
        self.lock().mode
    }

    /// Times the addressed-hub quiesce sequence ran.
    pub fn quiesce_count(&self) -> u32 {
        self.quiesce_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backplane for SimBackplane {
    fn num_slots(&self) -> u8 {
        self.slots
    }

    async fn set_slot_power(&self, slot: u8, on: bool) -> Result<()> {
        self.check_slot(slot)?;
        let hub = {
            let mut state = self.lock();
            let was_on = state.power[slot as usize];
            state.power[slot as usize] = on;
            if !on {
                // Cutting power also drops the data gate, like the real rail.
                state.data[slot as usize] = false;
            }
            if was_on && !on {
                self.hub_at(slot)
            } else {
                None
            }
        };
        if let Some(hub) = hub {
            hub.on_power_loss();
        }
        Ok(())
    }

    async fn set_slot_data(&self, slot: u8, on: bool) -> Result<()> {
        self.check_slot(slot)?;
        let mut state = self.lock();
        if on && !state.power[slot as usize] {
            anyhow::bail!("slot {} data enabled without power", slot);
        }
        state.data[slot as usize] = on;
        Ok(())
    }

    async fn all_data_off(&self) -> Result<()> {
        let mut state = self.lock();
        for gate in state.data.iter_mut() {
            *gate = false;
        }
        Ok(())
    }

    async fn select_mode(&self, interface: BusInterface) -> Result<()> {
        self.lock().mode = interface;
        Ok(())
    }

    async fn handshake(&self) -> Result<bool> {
        // Some addressed module answers when the active slot hosts a hub
        // with an addressed interface.
        let Some(slot) = self.active_slot() else {
            return Ok(false);
        };
        Ok(self
            .hub_at(slot)
            .map(|hub| hub.interface() == BusInterface::I2c)
            .unwrap_or(false))
    }

    async fn quiesce_addressed_hubs(&self) -> Result<()> {
        self.quiesce_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
