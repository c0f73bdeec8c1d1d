//! Consumed Collaborator Interfaces
//!
//! The measurement core produces finished message frames and hands them
//! off; everything beyond that belongs to collaborators specified here:
//!
//! - [`Transport`]: accepts a finished frame tagged with a category.
//!   Delivery and retry policy are its own concern.
//! - [`ClockSource`]: current time and last-known location fix, used
//!   verbatim in every frame header.
//! - [`IdentitySource`]: operator-assigned short node id or a hardware
//!   fallback, used verbatim in every frame header.
//! - [`PacketCounter`]: monotonically-assigned per-message identifier.
//!
//! In-process implementations for the binary and tests live here too; real
//! deployments substitute radio/cell transports and a GNSS-backed clock.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

// =============================================================================
// Frame Category
// =============================================================================

/// Category tag handed to the transport with each finished frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameCategory {
    /// Telemetry data pass output.
    Data,
    /// Diagnostic pass output.
    Diagnostic,
    /// Metadata pass output.
    Metadata,
    /// Aggregated error report.
    Error,
}

impl FrameCategory {
    /// Human-readable label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Diagnostic => "diagnostic",
            Self::Metadata => "metadata",
            Self::Error => "error",
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Accepts finished message frames (opaque bytes from this side).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand off one finished frame.
    async fn deliver(&self, frame: String, category: FrameCategory) -> Result<()>;
}

/// Transport that logs each frame; used by the demo binary.
#[derive(Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, frame: String, category: FrameCategory) -> Result<()> {
        tracing::info!(category = category.label(), bytes = frame.len(), %frame, "frame");
        Ok(())
    }
}

/// Transport that captures frames in memory; used by tests.
#[derive(Default)]
pub struct MemoryTransport {
    frames: Mutex<Vec<(FrameCategory, String)>>,
}

impl MemoryTransport {
    /// Create an empty capture transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// All delivered frames in order.
    pub fn frames(&self) -> Vec<(FrameCategory, String)> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn deliver(&self, frame: String, category: FrameCategory) -> Result<()> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((category, frame));
        Ok(())
    }
}

// =============================================================================
// Clock / Location
// =============================================================================

/// Last-known geolocation fix, reported verbatim in frame headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationFix {
    /// Latitude, decimal degrees.
    pub lat: f64,
    /// Longitude, decimal degrees.
    pub lon: f64,
    /// Altitude, meters.
    pub alt_m: f64,
    /// Timestamp of the fix (RFC 3339).
    pub fix_time: String,
}

impl Default for LocationFix {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            alt_m: 0.0,
            fix_time: String::new(),
        }
    }
}

/// Supplies current time and the last-known location fix.
pub trait ClockSource: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Last-known location fix.
    fn location(&self) -> LocationFix;
}

/// Wall-clock implementation with a static (or absent) fix.
pub struct SystemClock {
    fix: LocationFix,
}

impl SystemClock {
    /// Clock with no meaningful fix (all-zero location).
    pub fn new() -> Self {
        Self {
            fix: LocationFix::default(),
        }
    }

    /// Clock with a surveyed static position.
    pub fn with_fix(fix: LocationFix) -> Self {
        Self { fix }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn location(&self) -> LocationFix {
        self.fix.clone()
    }
}

/// Fixed clock for deterministic tests (frame headers become stable).
pub struct FixedClock {
    now: DateTime<Utc>,
    fix: LocationFix,
}

impl FixedClock {
    /// Clock pinned to `now` with the given fix.
    pub fn new(now: DateTime<Utc>, fix: LocationFix) -> Self {
        Self { now, fix }
    }
}

impl ClockSource for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn location(&self) -> LocationFix {
        self.fix.clone()
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Supplies the node identity used in every frame header.
pub trait IdentitySource: Send + Sync {
    /// Operator-assigned short id, or the hardware fallback.
    fn node_id(&self) -> String;
}

/// Operator-assigned identity from configuration.
pub struct StaticIdentity(pub String);

impl IdentitySource for StaticIdentity {
    fn node_id(&self) -> String {
        self.0.clone()
    }
}

/// Hardware-derived fallback identity (stable for the process lifetime).
pub struct HardwareIdentity {
    id: String,
}

impl HardwareIdentity {
    /// Derive a short id from a generated hardware uuid.
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let short = uuid.simple().to_string();
        Self {
            id: format!("hw-{}", &short[..8]),
        }
    }
}

impl Default for HardwareIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySource for HardwareIdentity {
    fn node_id(&self) -> String {
        self.id.clone()
    }
}

/// Choose the configured identity or fall back to hardware.
pub fn identity_from_config(name: &str) -> Box<dyn IdentitySource> {
    if name.is_empty() {
        Box::new(HardwareIdentity::new())
    } else {
        Box::new(StaticIdentity(name.to_string()))
    }
}

// =============================================================================
// Packet Counter
// =============================================================================

/// Supplies monotonically-assigned per-message packet ids.
pub trait PacketCounter: Send + Sync {
    /// Next packet id.
    fn next_packet_id(&self) -> u32;
}

/// In-memory monotonic counter. A deployment persisting ids across resets
/// wraps this with its own storage.
#[derive(Default)]
pub struct MonotonicCounter {
    next: AtomicU32,
}

impl MonotonicCounter {
    /// Counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter starting at `start`.
    pub fn starting_at(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }
}

impl PacketCounter for MonotonicCounter {
    fn next_packet_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_captures_in_order() {
        let transport = MemoryTransport::new();
        transport
            .deliver("a".to_string(), FrameCategory::Data)
            .await
            .unwrap();
        transport
            .deliver("b".to_string(), FrameCategory::Error)
            .await
            .unwrap();

        let frames = transport.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (FrameCategory::Data, "a".to_string()));
        assert_eq!(frames[1].0, FrameCategory::Error);
    }

    #[test]
    fn test_monotonic_counter() {
        let counter = MonotonicCounter::starting_at(41);
        assert_eq!(counter.next_packet_id(), 41);
        assert_eq!(counter.next_packet_id(), 42);
    }

    #[test]
    fn test_identity_fallback() {
        let id = identity_from_config("").node_id();
        assert!(id.starts_with("hw-"), "got: {id}");
        assert_eq!(identity_from_config("ridge-07").node_id(), "ridge-07");
    }

    #[test]
    fn test_hardware_identity_is_stable() {
        let hw = HardwareIdentity::new();
        assert_eq!(hw.node_id(), hw.node_id());
    }
}
