//! Node Orchestration
//!
//! [`SensorNode`] wires the pieces together: the candidate pool becomes a
//! device table, discovery binds it to the physical topology once at
//! startup, and every measurement cycle thereafter runs wake → data pass →
//! error pass → sleep, handing finished frames to the transport.
//!
//! The node never aborts a cycle for a device failure; the aggregate
//! [`NodeStatus`] is what a status indicator (LED, console line) consumes.

use crate::bus::{Backplane, BusSequencer};
use crate::config::NodeConfig;
use crate::device::DeviceKind;
use crate::discovery::{run_discovery, DiscoveryOutcome};
use crate::error::AppResult;
use crate::frame::{FrameAssembler, QueryPass, SystemInfo};
use crate::power::{sleep_all, wake_all};
use crate::registry::{CandidateRegistry, DeviceCaps, DeviceRecord, DeviceTable};
use crate::uplink::{
    identity_from_config, ClockSource, FrameCategory, IdentitySource, MonotonicCounter,
    PacketCounter, SystemClock, Transport,
};
use std::sync::Arc;

/// Aggregate state for the status indicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStatus {
    /// A declared candidate never bound to a position.
    pub missing_sensor: bool,
    /// Some device reported a critical fault during init.
    pub critical_fault: bool,
    /// Some device reported a recoverable fault during init.
    pub recoverable_fault: bool,
}

/// The assembled data-logger node.
pub struct SensorNode {
    config: NodeConfig,
    table: DeviceTable,
    bus: BusSequencer,
    clock: Box<dyn ClockSource>,
    identity: Box<dyn IdentitySource>,
    counter: Box<dyn PacketCounter>,
    transport: Arc<dyn Transport>,
    status: NodeStatus,
}

impl SensorNode {
    /// Build a node: instantiate the candidate pool and the bus sequencer.
    pub async fn build(
        config: NodeConfig,
        registry: &CandidateRegistry,
        backplane: Arc<dyn Backplane>,
        transport: Arc<dyn Transport>,
    ) -> AppResult<Self> {
        let table = registry.build_table(&config).await?;
        let bus = BusSequencer::new(backplane)
            .with_settle(config.discovery.settle)
            .with_handshake_timeout(config.discovery.handshake_timeout);
        let identity = identity_from_config(&config.node.name);

        Ok(Self {
            config,
            table,
            bus,
            clock: Box::new(SystemClock::new()),
            identity,
            counter: Box::new(MonotonicCounter::new()),
            transport,
            status: NodeStatus::default(),
        })
    }

    /// Replace the clock collaborator (tests pin time).
    pub fn with_clock(mut self, clock: Box<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the packet counter collaborator.
    pub fn with_counter(mut self, counter: Box<dyn PacketCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Install a controller built-in device (always present, no position).
    pub fn add_core_device(&mut self, name: impl Into<String>, caps: DeviceCaps) {
        self.table.push(DeviceRecord {
            name: name.into(),
            kind: DeviceKind::Core,
            interface: crate::device::BusInterface::Core,
            keep_powered: false,
            position: None,
            tested: true,
            begun: false,
            error_count: 0,
            caps,
        });
    }

    /// The device table (introspection and tests).
    pub fn table(&self) -> &DeviceTable {
        &self.table
    }

    /// Current status-indicator state.
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    // Built from individual fields so the table can be borrowed mutably
    // alongside it.
    fn make_assembler<'a>(
        clock: &'a dyn ClockSource,
        identity: &'a dyn IdentitySource,
        counter: &'a dyn PacketCounter,
        config: &NodeConfig,
    ) -> FrameAssembler<'a> {
        FrameAssembler::new(
            clock,
            identity,
            counter,
            SystemInfo::from_config(config),
            config.node.max_message_length,
        )
    }

    async fn deliver(&self, frames: Vec<String>, category: FrameCategory) {
        for frame in frames {
            if let Err(e) = self.transport.deliver(frame, category).await {
                tracing::warn!(category = category.label(), error = %e, "frame delivery refused");
            }
        }
    }

    /// Run discovery and update the missing-sensor indicator.
    pub async fn discover(&mut self) -> DiscoveryOutcome {
        let outcome = run_discovery(&mut self.table, &self.bus).await;
        self.status.missing_sensor = outcome.missing;
        outcome
    }

    /// Init pass: `begin` freshly bound devices, diagnostics for the rest;
    /// fold the fragments into diagnostic frames and aggregate faults.
    pub async fn run_init_pass(&mut self) {
        let output = {
            let assembler = Self::make_assembler(
                self.clock.as_ref(),
                self.identity.as_ref(),
                self.counter.as_ref(),
                &self.config,
            );
            assembler
                .collect(&mut self.table, &self.bus, QueryPass::Init)
                .await
        };
        self.status.critical_fault |= output.critical_fault;
        self.status.recoverable_fault |= output.recoverable_fault;
        self.deliver(output.frames, FrameCategory::Diagnostic).await;
    }

    /// One measurement cycle: wake, data pass, error pass, sleep.
    pub async fn run_cycle(&mut self) {
        wake_all(&self.table, &self.bus).await;

        let output = {
            let assembler = Self::make_assembler(
                self.clock.as_ref(),
                self.identity.as_ref(),
                self.counter.as_ref(),
                &self.config,
            );
            assembler
                .collect(&mut self.table, &self.bus, QueryPass::Data)
                .await
        };
        self.deliver(output.frames, FrameCategory::Data).await;

        let error_frames = Self::make_assembler(
            self.clock.as_ref(),
            self.identity.as_ref(),
            self.counter.as_ref(),
            &self.config,
        )
        .collect_errors(&self.table);
        self.deliver(error_frames, FrameCategory::Error).await;

        sleep_all(&self.table, &self.bus).await;
    }

    /// Metadata pass (system fragment first, then every device).
    pub async fn send_metadata(&mut self) {
        let output = {
            let assembler = Self::make_assembler(
                self.clock.as_ref(),
                self.identity.as_ref(),
                self.counter.as_ref(),
                &self.config,
            );
            assembler
                .collect(&mut self.table, &self.bus, QueryPass::Metadata)
                .await
        };
        self.deliver(output.frames, FrameCategory::Metadata).await;
    }

    /// Diagnostic pass at the configured verbosity.
    pub async fn send_diagnostics(&mut self) {
        let level = self.config.node.diagnostic_verbosity;
        let output = {
            let assembler = Self::make_assembler(
                self.clock.as_ref(),
                self.identity.as_ref(),
                self.counter.as_ref(),
                &self.config,
            );
            assembler
                .collect(&mut self.table, &self.bus, QueryPass::Diagnostic(level))
                .await
        };
        self.deliver(output.frames, FrameCategory::Diagnostic).await;
    }
}
