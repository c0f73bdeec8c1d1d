//! Bus Sequencer
//!
//! A single physical bus is shared by all hub and sensor traffic, and some
//! attached modules interfere electrically when more than one data path is
//! enabled. The sequencer serializes every power/data enable so that at most
//! one non-core device is reachable while work is in flight:
//!
//! ```text
//! all data off → slot power on → select mode → slot data on
//!              → (hub sub-port data on) → settle → body → release
//! ```
//!
//! [`BusSequencer::with_exclusive_access`] is the only way discovery and the
//! packet assembler touch the bus; neither component drives enable lines
//! directly. The firmware is single-threaded and cooperative, so the
//! invariant is enforced purely by this sequencing — no locks are involved.
//!
//! The low-level rail and mode switching belongs to the [`Backplane`]
//! collaborator (GPIO/I2C glue, out of scope here). The simulated backplane
//! in [`crate::sim`] implements it for tests and the demo binary.

use crate::device::{BusInterface, HubControl, Position};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Backplane Collaborator
// =============================================================================

/// Low-level carrier-board control consumed by the sequencer.
///
/// Implementations are thin adapters over the slot power rails, data
/// gates, and the shared-bus transceiver mode. All methods are async so a
/// hardware implementation can sit on an I2C expander.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Number of physical hub slots on this carrier.
    fn num_slots(&self) -> u8;

    /// Gate power to one slot.
    async fn set_slot_power(&self, slot: u8, on: bool) -> Result<()>;

    /// Gate data to one slot.
    async fn set_slot_data(&self, slot: u8, on: bool) -> Result<()>;

    /// Disable data to every slot.
    async fn all_data_off(&self) -> Result<()>;

    /// Select the electrical mode for the given interface (serial hubs
    /// need a different port-direction setting than GPIO hubs).
    async fn select_mode(&self, interface: BusInterface) -> Result<()>;

    /// Minimal handshake on the generic addressed-bus probe address.
    ///
    /// Answers whether *some* addressed module is present on the currently
    /// energized slot, not which one. Implementations keep their own wait
    /// short; the sequencer additionally bounds the call.
    async fn handshake(&self) -> Result<bool>;

    /// Force the two known addressed-hub families into a safe low state.
    ///
    /// Those families power up in a state that can backfeed an unrelated
    /// port, so discovery quiesces them after every positive handshake.
    /// A known hardware quirk of the carrier, not policy.
    async fn quiesce_addressed_hubs(&self) -> Result<()>;
}

// =============================================================================
// Bus Path
// =============================================================================

/// Everything needed to energize one device's path.
#[derive(Clone)]
pub struct BusPath {
    /// Target position.
    pub position: Position,
    /// Electrical mode to select before enabling data.
    pub interface: BusInterface,
    /// The owning hub's controller, when the target is a leaf behind one.
    pub hub: Option<Arc<dyn HubControl>>,
}

impl BusPath {
    /// Path to a hub occupying `slot`.
    pub fn to_hub(slot: u8, interface: BusInterface) -> Self {
        Self {
            position: Position::hub(slot),
            interface,
            hub: None,
        }
    }

    /// Path to a leaf behind `hub` at `position`.
    pub fn to_leaf(position: Position, interface: BusInterface, hub: Arc<dyn HubControl>) -> Self {
        Self {
            position,
            interface,
            hub: Some(hub),
        }
    }

    /// Path to a core-wired device (no electrical steps).
    pub fn core() -> Self {
        Self {
            position: Position::CORE,
            interface: BusInterface::Core,
            hub: None,
        }
    }
}

// =============================================================================
// Bus Sequencer
// =============================================================================

/// Serializes power/data enablement on the shared bus.
pub struct BusSequencer {
    backplane: Arc<dyn Backplane>,
    settle: Duration,
    handshake_timeout: Duration,
}

impl BusSequencer {
    /// Create a sequencer with the default 10 ms settle and handshake wait.
    pub fn new(backplane: Arc<dyn Backplane>) -> Self {
        Self {
            backplane,
            settle: Duration::from_millis(10),
            handshake_timeout: Duration::from_millis(10),
        }
    }

    /// Override the post-enable settle delay.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Override the handshake wait bound.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The settle delay in use.
    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Number of slots on the carrier.
    pub fn num_slots(&self) -> u8 {
        self.backplane.num_slots()
    }

    /// Energize exactly one path, run `body`, release on every exit path.
    ///
    /// Core positions skip the electrical steps — the device is always
    /// reachable — but still run `body` so call sites stay uniform.
    ///
    /// A release failure after a successful body is logged and swallowed:
    /// the next energize starts from `all_data_off`, which re-asserts the
    /// safe state.
    pub async fn with_exclusive_access<T, F, Fut>(&self, path: &BusPath, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if path.position.is_core() {
            return body().await;
        }

        if let Err(e) = self.energize(path).await {
            // Partial enables are unwound before reporting.
            self.release(path).await;
            return Err(e).context(format!("failed to energize path {}", path.position));
        }

        let result = body().await;
        self.release(path).await;
        result
    }

    async fn energize(&self, path: &BusPath) -> Result<()> {
        let slot = path.position.hub_slot;
        self.backplane.all_data_off().await?;
        self.backplane.set_slot_power(slot, true).await?;
        self.backplane.select_mode(path.interface).await?;
        self.backplane.set_slot_data(slot, true).await?;
        if path.position.sub_port > 0 {
            let hub = path
                .hub
                .as_ref()
                .with_context(|| format!("leaf path {} has no hub handle", path.position))?;
            hub.set_port_data(path.position.sub_port, true).await?;
        }
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn release(&self, path: &BusPath) {
        if path.position.sub_port > 0 {
            if let Some(hub) = &path.hub {
                if let Err(e) = hub.set_port_data(path.position.sub_port, false).await {
                    tracing::warn!(position = %path.position, error = %e, "sub-port data release failed");
                }
            }
        }
        if let Err(e) = self
            .backplane
            .set_slot_data(path.position.hub_slot, false)
            .await
        {
            tracing::warn!(position = %path.position, error = %e, "slot data release failed");
        }
    }

    // -------------------------------------------------------------------------
    // Narrow operations for discovery and power sequencing. Still the only
    // component touching the backplane.
    // -------------------------------------------------------------------------

    /// Gate power to one slot.
    pub async fn slot_power(&self, slot: u8, on: bool) -> Result<()> {
        self.backplane.set_slot_power(slot, on).await
    }

    /// Select an electrical mode directly (hub init after Phase A).
    pub async fn select_mode(&self, interface: BusInterface) -> Result<()> {
        self.backplane.select_mode(interface).await
    }

    /// Disable data to every slot.
    pub async fn all_data_off(&self) -> Result<()> {
        self.backplane.all_data_off().await
    }

    /// Bounded generic handshake on the currently energized slot.
    ///
    /// Timeouts and backplane errors both read as "nothing answered".
    pub async fn handshake(&self) -> bool {
        match tokio::time::timeout(self.handshake_timeout, self.backplane.handshake()).await {
            Ok(Ok(present)) => present,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "handshake error treated as absent");
                false
            }
            Err(_) => false,
        }
    }

    /// Quiesce the known addressed-hub families (see [`Backplane`]).
    pub async fn quiesce_addressed_hubs(&self) -> Result<()> {
        self.backplane.quiesce_addressed_hubs().await
    }

    /// Power-cycle one slot (fault recovery before hub init).
    pub async fn power_cycle_slot(&self, slot: u8) -> Result<()> {
        self.backplane.set_slot_power(slot, false).await?;
        tokio::time::sleep(self.settle).await;
        self.backplane.set_slot_power(slot, true).await?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the call sequence so tests can assert ordering and release.
    struct TraceBackplane {
        calls: Mutex<Vec<String>>,
        fail_slot_data: bool,
    }

    impl TraceBackplane {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_slot_data: false,
            }
        }

        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backplane for TraceBackplane {
        fn num_slots(&self) -> u8 {
            3
        }
        async fn set_slot_power(&self, slot: u8, on: bool) -> Result<()> {
            self.log(format!("power {slot} {on}"));
            Ok(())
        }
        async fn set_slot_data(&self, slot: u8, on: bool) -> Result<()> {
            self.log(format!("data {slot} {on}"));
            if self.fail_slot_data && on {
                anyhow::bail!("data gate stuck");
            }
            Ok(())
        }
        async fn all_data_off(&self) -> Result<()> {
            self.log("all_data_off".to_string());
            Ok(())
        }
        async fn select_mode(&self, interface: BusInterface) -> Result<()> {
            self.log(format!("mode {}", interface.label()));
            Ok(())
        }
        async fn handshake(&self) -> Result<bool> {
            Ok(false)
        }
        async fn quiesce_addressed_hubs(&self) -> Result<()> {
            self.log("quiesce".to_string());
            Ok(())
        }
    }

    fn sequencer(bp: Arc<TraceBackplane>) -> BusSequencer {
        BusSequencer::new(bp).with_settle(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_exclusive_access_sequences_and_releases() {
        let bp = Arc::new(TraceBackplane::new());
        let seq = sequencer(bp.clone());
        let path = BusPath::to_hub(2, BusInterface::SerialBus);

        let out = seq
            .with_exclusive_access(&path, || async { Ok::<_, anyhow::Error>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);

        assert_eq!(
            bp.calls(),
            vec![
                "all_data_off",
                "power 2 true",
                "mode serial_bus",
                "data 2 true",
                "data 2 false",
            ]
        );
    }

    #[tokio::test]
    async fn test_release_happens_when_body_fails() {
        let bp = Arc::new(TraceBackplane::new());
        let seq = sequencer(bp.clone());
        let path = BusPath::to_hub(1, BusInterface::DirectGpio);

        let out: Result<()> = seq
            .with_exclusive_access(&path, || async { anyhow::bail!("probe exploded") })
            .await;
        assert!(out.is_err());

        let calls = bp.calls();
        assert_eq!(calls.last().unwrap(), "data 1 false");
    }

    #[tokio::test]
    async fn test_energize_failure_unwinds() {
        let bp = Arc::new(TraceBackplane {
            calls: Mutex::new(Vec::new()),
            fail_slot_data: true,
        });
        let seq = sequencer(bp.clone());
        let path = BusPath::to_hub(1, BusInterface::I2c);

        let out: Result<u8> = seq
            .with_exclusive_access(&path, || async { Ok(0) })
            .await;
        assert!(out.is_err());

        // The failed enable is followed by a release attempt.
        let calls = bp.calls();
        assert!(calls.contains(&"data 1 true".to_string()));
        assert_eq!(calls.last().unwrap(), "data 1 false");
    }

    #[tokio::test]
    async fn test_core_path_skips_electrical_steps() {
        let bp = Arc::new(TraceBackplane::new());
        let seq = sequencer(bp.clone());

        let out = seq
            .with_exclusive_access(&BusPath::core(), || async { Ok::<_, anyhow::Error>("ok") })
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert!(bp.calls().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout_reads_absent() {
        struct SlowBackplane;

        #[async_trait]
        impl Backplane for SlowBackplane {
            fn num_slots(&self) -> u8 {
                1
            }
            async fn set_slot_power(&self, _: u8, _: bool) -> Result<()> {
                Ok(())
            }
            async fn set_slot_data(&self, _: u8, _: bool) -> Result<()> {
                Ok(())
            }
            async fn all_data_off(&self) -> Result<()> {
                Ok(())
            }
            async fn select_mode(&self, _: BusInterface) -> Result<()> {
                Ok(())
            }
            async fn handshake(&self) -> Result<bool> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(true)
            }
            async fn quiesce_addressed_hubs(&self) -> Result<()> {
                Ok(())
            }
        }

        let seq = BusSequencer::new(Arc::new(SlowBackplane))
            .with_handshake_timeout(Duration::from_millis(5));
        assert!(!seq.handshake().await);
    }
}
