//! # fieldlog
//!
//! Firmware core for a modular environmental sensing node. A controller
//! board exposes a fixed number of expansion slots; pluggable bus hubs
//! occupy slots and expose sub-ports; leaf sensors hang off the sub-ports
//! (or wire straight to the controller). Nothing about the topology is
//! configured statically — each deployment plugs in whatever it needs and
//! the firmware figures the rest out.
//!
//! Per measurement cycle the node:
//!
//! 1. discovers which hubs and sensors are physically present (once, at
//!    startup) by sequential electrical probing,
//! 2. sequences power/data enablement on the shared, contention-prone bus
//!    so exactly one device is reachable at a time,
//! 3. queries every discovered device for telemetry, diagnostics, or
//!    metadata fragments, and
//! 4. folds the fragments into size-bounded JSON frames, splitting across
//!    frames without ever splitting a fragment.
//!
//! ## Crate Structure
//!
//! - **`device`**: the capability model — `Position`, interface kinds, and
//!   the fine-grained async capability traits devices implement.
//! - **`registry`**: device factories, the candidate pool, and the device
//!   table (arena of records plus the position map).
//! - **`bus`**: the bus sequencer and the backplane collaborator trait;
//!   sole owner of the shared-bus mutual-exclusion discipline.
//! - **`discovery`**: the two-phase probing engine binding candidates to
//!   physical positions.
//! - **`frame`**: message frames and the size-bounded packet assembler.
//! - **`protocol`**: serial-bus plumbing and the retry/validate read
//!   protocol shared by every serial leaf sensor.
//! - **`power`**: sleep/wake sequencing between cycles.
//! - **`uplink`**: consumed collaborator interfaces (transport, clock,
//!   identity, packet counter) with in-process implementations.
//! - **`node`**: orchestration of all of the above.
//! - **`config`** / **`logging`** / **`error`**: the ambient stack.
//! - **`sim`**: simulated backplane, hubs, and sensors for tests and the
//!   demo binary.

pub mod bus;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod logging;
pub mod node;
pub mod power;
pub mod protocol;
pub mod registry;
pub mod sim;
pub mod uplink;

pub use bus::{Backplane, BusPath, BusSequencer};
pub use config::NodeConfig;
pub use device::{BusInterface, Capability, DeviceKind, Position};
pub use discovery::{run_discovery, DiscoveryOutcome};
pub use error::{AppResult, NodeError};
pub use frame::{FrameAssembler, MessageFrame, QueryPass};
pub use node::{NodeStatus, SensorNode};
pub use registry::{CandidateRegistry, DeviceCaps, DeviceFactory, DeviceTable};
pub use uplink::{FrameCategory, Transport};
