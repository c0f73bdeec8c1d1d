//! Message Frames and the Telemetry Packet Assembler
//!
//! Every query pass produces one or more size-bounded message frames:
//!
//! ```text
//! {"node":"ridge-07","packet":12,"time":"...","loc":[...],"n":  2,"items":[
//!     {...fragment...},{...fragment...}
//! ]}
//! ```
//!
//! The header is fixed at open time apart from a 3-character device-count
//! placeholder patched when the frame closes, so the byte budget is exact at
//! every append decision. The invariant, held at every commit point:
//!
//! ```text
//! header + body + suffix ≤ max_message_length
//! ```
//!
//! Appending is permitted when the projected length is `<=` the budget — a
//! frame may be exactly the limit (covered by a boundary test below). When a
//! fragment would overflow, the frame is closed and the fragment becomes the
//! first entry of a fresh frame; fragments are never split across frames and
//! every emitted frame is independently well-formed JSON.
//!
//! Four query passes share one accumulation algorithm, differing only in
//! which capability is invoked; see [`QueryPass`]. The metadata pass
//! additionally leads with a synthetic "system" fragment that is exempt from
//! the split rule (always first in the first frame).

use crate::bus::{BusPath, BusSequencer};
use crate::config::NodeConfig;
use crate::device::{
    DeviceKind, DiagnosticsSource, Lifecycle, MetadataSource, Position, TelemetrySource,
};
use crate::registry::{DeviceIndex, DeviceTable};
use std::sync::Arc;
use crate::uplink::{ClockSource, IdentitySource, LocationFix, PacketCounter};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

/// Closing suffix of every frame.
pub const FRAME_SUFFIX: &str = "]}";

/// Telemetry schema version reported in the system fragment.
pub const SCHEMA_VERSION: u8 = 2;

// =============================================================================
// Frame Header
// =============================================================================

/// A rendered frame header plus the offset of its count placeholder.
pub struct FrameHeader {
    text: String,
    count_offset: Option<usize>,
}

impl FrameHeader {
    /// Render the standard header for one frame.
    pub fn render(
        node_id: &str,
        packet_id: u32,
        now: DateTime<Utc>,
        fix: &LocationFix,
    ) -> Self {
        let mut text = format!(
            "{{\"node\":{},\"packet\":{},\"time\":{},\"loc\":[{},{},{},{}],\"n\":",
            json!(node_id),
            packet_id,
            json!(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            json!(fix.lat),
            json!(fix.lon),
            json!(fix.alt_m),
            json!(fix.fix_time),
        );
        let count_offset = Some(text.len());
        text.push_str("  0,\"items\":[");
        Self { text, count_offset }
    }

    /// A raw header with no placeholder (boundary tests pin exact lengths).
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            count_offset: None,
        }
    }

    /// Header length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// True when the header text is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

// =============================================================================
// Message Frame
// =============================================================================

/// One size-bounded output frame under construction.
pub struct MessageFrame {
    buf: String,
    count_offset: Option<usize>,
    count: usize,
    max_len: usize,
}

impl MessageFrame {
    /// Open a frame with the given header and byte budget.
    pub fn open(header: FrameHeader, max_len: usize) -> Self {
        Self {
            buf: header.text,
            count_offset: header.count_offset,
            count: 0,
            max_len,
        }
    }

    /// Number of fragments committed so far.
    pub fn fragment_count(&self) -> usize {
        self.count
    }

    /// Committed length if the frame closed now.
    pub fn committed_len(&self) -> usize {
        self.buf.len() + FRAME_SUFFIX.len()
    }

    /// Append a fragment if it fits inside the budget.
    ///
    /// Returns false (leaving the frame untouched) when appending would
    /// push the committed length past `max_len`.
    pub fn try_append(&mut self, fragment: &str) -> bool {
        let sep = usize::from(self.count > 0);
        let projected = self.buf.len() + sep + fragment.len() + FRAME_SUFFIX.len();
        if projected > self.max_len {
            return false;
        }
        if sep == 1 {
            self.buf.push(',');
        }
        self.buf.push_str(fragment);
        self.count += 1;
        true
    }

    /// Append without the budget check (the metadata system fragment only).
    pub fn force_append(&mut self, fragment: &str) {
        if self.count > 0 {
            self.buf.push(',');
        }
        self.buf.push_str(fragment);
        self.count += 1;
    }

    /// Close the frame: patch the count placeholder, append the suffix.
    pub fn close(mut self) -> String {
        if let Some(offset) = self.count_offset {
            let patched = format!("{:3}", self.count.min(999));
            self.buf.replace_range(offset..offset + 3, &patched);
        }
        self.buf.push_str(FRAME_SUFFIX);
        self.buf
    }
}

// =============================================================================
// Query Passes
// =============================================================================

/// Which capability a collection pass invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPass {
    /// Telemetry from every bound device.
    Data,
    /// Diagnostics at the given verbosity (1..=5).
    Diagnostic(u8),
    /// Metadata, preceded by the synthetic system fragment.
    Metadata,
    /// `begin` for freshly bound devices, diagnostics level 2 for devices
    /// whose `begin` already ran; aggregates fault flags.
    Init,
}

/// Output of one collection pass.
#[derive(Debug, Default)]
pub struct PassOutput {
    /// Finished frames in emission order.
    pub frames: Vec<String>,
    /// Any device reported a critical fault during init.
    pub critical_fault: bool,
    /// Any device reported a recoverable fault during init.
    pub recoverable_fault: bool,
}

// =============================================================================
// System Info
// =============================================================================

/// Contents of the synthetic "system" fragment in the metadata pass.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    /// Firmware version string.
    pub firmware: String,
    /// Telemetry schema version.
    pub schema: u8,
    /// Configured logging period, seconds.
    pub log_period_secs: u64,
    /// Number of configured backhaul transports.
    pub backhaul_count: u8,
    /// Power-save mode label.
    pub power_save: String,
}

impl SystemInfo {
    /// Build from the node configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            firmware: env!("CARGO_PKG_VERSION").to_string(),
            schema: SCHEMA_VERSION,
            log_period_secs: config.node.log_period.as_secs(),
            backhaul_count: config.node.backhaul_count,
            power_save: config.node.power_save.clone(),
        }
    }

    fn fragment(&self) -> String {
        json!({
            "name": "system",
            "firmware": self.firmware,
            "schema": self.schema,
            "log_period_s": self.log_period_secs,
            "backhauls": self.backhaul_count,
            "power_save": self.power_save,
        })
        .to_string()
    }
}

// =============================================================================
// Frame Assembler
// =============================================================================

/// Greedy, size-bounded accumulation of per-device fragments into frames.
pub struct FrameAssembler<'a> {
    clock: &'a dyn ClockSource,
    identity: &'a dyn IdentitySource,
    counter: &'a dyn PacketCounter,
    system: SystemInfo,
    max_len: usize,
}

impl<'a> FrameAssembler<'a> {
    /// Create an assembler over the header collaborators.
    pub fn new(
        clock: &'a dyn ClockSource,
        identity: &'a dyn IdentitySource,
        counter: &'a dyn PacketCounter,
        system: SystemInfo,
        max_len: usize,
    ) -> Self {
        Self {
            clock,
            identity,
            counter,
            system,
            max_len,
        }
    }

    fn open_frame(&self) -> MessageFrame {
        let header = FrameHeader::render(
            &self.identity.node_id(),
            self.counter.next_packet_id(),
            self.clock.now(),
            &self.clock.location(),
        );
        MessageFrame::open(header, self.max_len)
    }

    /// Run one collection pass over every device in declared order.
    ///
    /// Unassigned non-core devices are skipped entirely. Devices lacking the
    /// pass's capability are skipped silently. A capability error is tallied
    /// on the device and the pass continues.
    pub async fn collect(
        &self,
        table: &mut DeviceTable,
        bus: &BusSequencer,
        pass: QueryPass,
    ) -> PassOutput {
        let mut output = PassOutput::default();
        let mut frame = self.open_frame();

        if pass == QueryPass::Metadata {
            // The system fragment leads the first frame and is exempt from
            // the split rule.
            frame.force_append(&self.system.fragment());
        }

        let indices: Vec<DeviceIndex> = table.indices().collect();
        for idx in indices {
            let Some(query) = self.device_query(table, idx, pass) else {
                continue;
            };
            let ran_begin = matches!(query.invoke, PassInvoke::Begin(_));

            let result = bus
                .with_exclusive_access(&query.path, || async {
                    match &query.invoke {
                        PassInvoke::Telemetry(cap) => cap.telemetry().await,
                        PassInvoke::Diagnostics(cap, level) => cap.diagnostics(*level).await,
                        PassInvoke::Metadata(cap) => cap.metadata().await,
                        PassInvoke::Begin(cap) => {
                            let report = cap.begin().await?;
                            Ok(json!({
                                "report": report.fragment,
                                "critical": report.critical_fault,
                                "recoverable": report.recoverable_fault,
                            }))
                        }
                    }
                })
                .await;

            let value = match result {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        device = %table.record(idx).name,
                        error = %e,
                        "query failed; device absent for this pass"
                    );
                    table.tally_error(idx);
                    continue;
                }
            };

            let fragment = match self.unwrap_pass_value(table, idx, ran_begin, value, &mut output) {
                Some(f) => f,
                None => continue,
            };

            if !frame.try_append(&fragment) {
                output.frames.push(frame.close());
                frame = self.open_frame();
                if !frame.try_append(&fragment) {
                    // A fragment too large for an empty frame is dropped;
                    // emitting past the budget would break the transport.
                    tracing::warn!(
                        device = %table.record(idx).name,
                        bytes = fragment.len(),
                        budget = self.max_len,
                        "fragment exceeds empty-frame budget; dropped"
                    );
                    table.tally_error(idx);
                }
            }
        }

        output.frames.push(frame.close());
        output
    }

    /// Assemble the aggregated error report.
    ///
    /// Returns no frames at all when every device's tally is zero, so empty
    /// error reports are never transmitted.
    pub fn collect_errors(&self, table: &DeviceTable) -> Vec<String> {
        // Table-level tallies (discovery misses, capability errors) plus
        // whatever the device counted itself (exhausted read retries).
        let total = |idx: DeviceIndex| {
            let record = table.record(idx);
            let own = record
                .caps
                .errors
                .as_ref()
                .map(|e| e.error_count())
                .unwrap_or(0);
            record.error_count.saturating_add(own)
        };

        let tallied: Vec<DeviceIndex> = table.indices().filter(|&i| total(i) > 0).collect();
        if tallied.is_empty() {
            return Vec::new();
        }

        let mut frames = Vec::new();
        let mut frame = self.open_frame();
        for idx in tallied {
            let record = table.record(idx);
            let fragment = json!({
                "name": record.name,
                "errors": total(idx),
            })
            .to_string();
            if !frame.try_append(&fragment) {
                frames.push(frame.close());
                frame = self.open_frame();
                if !frame.try_append(&fragment) {
                    tracing::warn!(device = %record.name, "error fragment dropped");
                }
            }
        }
        frames.push(frame.close());
        frames
    }

    /// Resolve the device's bus path and the capability call for this pass.
    fn device_query(
        &self,
        table: &DeviceTable,
        idx: DeviceIndex,
        pass: QueryPass,
    ) -> Option<DeviceQuery> {
        let record = table.record(idx);
        if !record.is_reachable() {
            return None;
        }

        let path = match record.kind {
            DeviceKind::Core => BusPath::core(),
            DeviceKind::Hub => {
                let position = record.position?;
                BusPath::to_hub(position.hub_slot, record.interface)
            }
            DeviceKind::Leaf => {
                let position = record.position?;
                if position.is_core() {
                    BusPath::core()
                } else {
                    let hub_idx = table.device_at(Position::hub(position.hub_slot))?;
                    let hub = table.record(hub_idx).caps.hub.clone()?;
                    BusPath::to_leaf(position, record.interface, hub)
                }
            }
        };

        let invoke = match pass {
            QueryPass::Data => PassInvoke::Telemetry(record.caps.telemetry.clone()?),
            QueryPass::Diagnostic(level) => {
                PassInvoke::Diagnostics(record.caps.diagnostics.clone()?, level)
            }
            QueryPass::Metadata => PassInvoke::Metadata(record.caps.metadata.clone()?),
            QueryPass::Init => {
                // `begin` for freshly bound devices; level-2 diagnostics for
                // devices whose begin already ran (hubs during discovery)
                // or that have no begin at all (core built-ins).
                if record.begun || record.caps.lifecycle.is_none() {
                    PassInvoke::Diagnostics(record.caps.diagnostics.clone()?, 2)
                } else {
                    PassInvoke::Begin(record.caps.lifecycle.clone()?)
                }
            }
        };

        Some(DeviceQuery { path, invoke })
    }

    /// Post-process a pass value: fold init fault flags, drop empties.
    fn unwrap_pass_value(
        &self,
        table: &mut DeviceTable,
        idx: DeviceIndex,
        ran_begin: bool,
        value: serde_json::Value,
        output: &mut PassOutput,
    ) -> Option<String> {
        let value = if ran_begin {
            // Begin ran: unpack the report wrapper built in the closure.
            let critical = value["critical"].as_bool().unwrap_or(false);
            let recoverable = value["recoverable"].as_bool().unwrap_or(false);
            output.critical_fault |= critical;
            output.recoverable_fault |= recoverable;
            table.record_mut(idx).begun = true;
            if critical {
                table.tally_error(idx);
            }
            value["report"].clone()
        } else {
            value
        };

        match &value {
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) if map.is_empty() => None,
            v => Some(v.to_string()),
        }
    }
}

enum PassInvoke {
    Telemetry(Arc<dyn TelemetrySource>),
    Diagnostics(Arc<dyn DiagnosticsSource>, u8),
    Metadata(Arc<dyn MetadataSource>),
    Begin(Arc<dyn Lifecycle>),
}

struct DeviceQuery {
    path: BusPath,
    invoke: PassInvoke,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Backplane;
    use crate::device::{
        BusInterface, InitReport, Lifecycle, MetadataSource, TelemetrySource,
    };
    use crate::registry::{DeviceCaps, DeviceRecord};
    use crate::uplink::{FixedClock, MonotonicCounter, StaticIdentity};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Arc;

    // -------------------------------------------------------------------------
    // MessageFrame unit tests (boundary arithmetic pinned here)
    // -------------------------------------------------------------------------

    fn raw_frame(header_len: usize, max_len: usize) -> MessageFrame {
        MessageFrame::open(FrameHeader::raw("h".repeat(header_len)), max_len)
    }

    #[test]
    fn test_append_at_exact_budget_is_allowed() {
        // header 60 + fragment 38 + suffix 2 == 100 exactly.
        let mut frame = raw_frame(60, 100);
        assert!(frame.try_append(&"x".repeat(38)));
        assert_eq!(frame.committed_len(), 100);
    }

    #[test]
    fn test_append_one_byte_over_budget_is_refused() {
        let mut frame = raw_frame(60, 100);
        assert!(!frame.try_append(&"x".repeat(39)));
        assert_eq!(frame.fragment_count(), 0);
    }

    #[test]
    fn test_separator_counts_against_budget() {
        // 60 + 18 + 2 = 80; second 18-byte fragment needs 18 + 1 sep = 99 ≤ 100,
        // third needs 19 more → 118 > 100.
        let mut frame = raw_frame(60, 100);
        assert!(frame.try_append(&"x".repeat(18)));
        assert!(frame.try_append(&"y".repeat(18)));
        assert!(!frame.try_append(&"z".repeat(18)));
        assert_eq!(frame.fragment_count(), 2);
    }

    #[test]
    fn test_spec_example_split_30_30_30() {
        // Header 60, max 100: each 30-byte fragment fits alone (92), no two
        // fit together (123 > 100) — three frames result.
        let fragments = ["a".repeat(30), "b".repeat(30), "c".repeat(30)];
        let mut frames = Vec::new();
        let mut frame = raw_frame(60, 100);
        for frag in &fragments {
            if !frame.try_append(frag) {
                frames.push(frame.close());
                frame = raw_frame(60, 100);
                assert!(frame.try_append(frag));
            }
        }
        frames.push(frame.close());

        assert_eq!(frames.len(), 3);
        for f in &frames {
            assert!(f.len() <= 100, "frame over budget: {}", f.len());
        }
    }

    #[test]
    fn test_count_placeholder_is_patched() {
        let header = FrameHeader::render(
            "ridge-07",
            5,
            Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap(),
            &LocationFix::default(),
        );
        let mut frame = MessageFrame::open(header, 4096);
        assert!(frame.try_append("{\"name\":\"a\"}"));
        assert!(frame.try_append("{\"name\":\"b\"}"));
        let closed = frame.close();

        let parsed: serde_json::Value = serde_json::from_str(&closed).unwrap();
        assert_eq!(parsed["n"], 2);
        assert_eq!(parsed["node"], "ridge-07");
        assert_eq!(parsed["packet"], 5);
        assert_eq!(parsed["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_header_length_constant_across_counts() {
        // The placeholder keeps header bytes fixed whatever the final count,
        // so budget math done at append time stays exact.
        let at = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap();
        let h = FrameHeader::render("n", 7, at, &LocationFix::default());
        let base_len = h.len();

        let mut frame = MessageFrame::open(h, 4096);
        for _ in 0..12 {
            assert!(frame.try_append("{}"));
        }
        let closed = frame.close();
        let items_start = closed.find("\"items\":[").unwrap();
        assert_eq!(items_start + "\"items\":[".len(), base_len);
    }

    // -------------------------------------------------------------------------
    // Assembler tests over core-kind devices (no electrical path involved)
    // -------------------------------------------------------------------------

    struct NullBackplane;

    #[async_trait]
    impl Backplane for NullBackplane {
        fn num_slots(&self) -> u8 {
            0
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
            Ok(false)
        }
        async fn quiesce_addressed_hubs(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FixedFragment(serde_json::Value);

    #[async_trait]
    impl TelemetrySource for FixedFragment {
        async fn telemetry(&self) -> Result<serde_json::Value> {
            Ok(self.0.clone())
        }
    }

    #[async_trait]
    impl MetadataSource for FixedFragment {
        async fn metadata(&self) -> Result<serde_json::Value> {
            Ok(self.0.clone())
        }
    }

    struct FaultyBegin;

    #[async_trait]
    impl Lifecycle for FaultyBegin {
        async fn begin(&self) -> Result<InitReport> {
            Ok(InitReport {
                fragment: json!({"name": "clk", "up": true}),
                critical_fault: true,
                recoverable_fault: false,
            })
        }
    }

    fn core_device(name: &str, caps: DeviceCaps) -> DeviceRecord {
        DeviceRecord {
            name: name.to_string(),
            kind: DeviceKind::Core,
            interface: BusInterface::Core,
            keep_powered: false,
            position: None,
            tested: true,
            begun: false,
            error_count: 0,
            caps,
        }
    }

    struct Fixture {
        clock: FixedClock,
        identity: StaticIdentity,
        counter: MonotonicCounter,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: FixedClock::new(
                    Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap(),
                    LocationFix::default(),
                ),
                identity: StaticIdentity("t".to_string()),
                counter: MonotonicCounter::new(),
            }
        }

        fn assembler(&self, max_len: usize) -> FrameAssembler<'_> {
            FrameAssembler::new(
                &self.clock,
                &self.identity,
                &self.counter,
                SystemInfo {
                    firmware: "0.3.0".to_string(),
                    schema: SCHEMA_VERSION,
                    log_period_secs: 900,
                    backhaul_count: 1,
                    power_save: "standby".to_string(),
                },
                max_len,
            )
        }
    }

    fn sequencer() -> BusSequencer {
        BusSequencer::new(Arc::new(NullBackplane)).with_settle(std::time::Duration::ZERO)
    }

    #[tokio::test]
    async fn test_data_pass_preserves_fragment_order_across_split() {
        let mut table = DeviceTable::new();
        for i in 0..6 {
            let frag = json!({"name": format!("d{i}"), "pad": "p".repeat(40)});
            table.push(core_device(
                &format!("d{i}"),
                DeviceCaps::new().with_telemetry(Arc::new(FixedFragment(frag))),
            ));
        }

        let fixture = Fixture::new();
        let assembler = fixture.assembler(256);
        let bus = sequencer();
        let output = assembler.collect(&mut table, &bus, QueryPass::Data).await;

        assert!(output.frames.len() > 1, "expected a split");
        let mut names = Vec::new();
        for frame in &output.frames {
            assert!(frame.len() <= 256, "frame over budget: {}", frame.len());
            let parsed: serde_json::Value = serde_json::from_str(frame).unwrap();
            let items = parsed["items"].as_array().unwrap();
            assert_eq!(parsed["n"], items.len());
            for item in items {
                names.push(item["name"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(names, vec!["d0", "d1", "d2", "d3", "d4", "d5"]);
    }

    #[tokio::test]
    async fn test_devices_without_capability_are_skipped() {
        let mut table = DeviceTable::new();
        table.push(core_device("mute", DeviceCaps::new()));
        table.push(core_device(
            "talk",
            DeviceCaps::new().with_telemetry(Arc::new(FixedFragment(json!({"name":"talk"})))),
        ));

        let fixture = Fixture::new();
        let assembler = fixture.assembler(1024);
        let bus = sequencer();
        let output = assembler.collect(&mut table, &bus, QueryPass::Data).await;

        assert_eq!(output.frames.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&output.frames[0]).unwrap();
        assert_eq!(parsed["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_null_fragments_are_skipped() {
        let mut table = DeviceTable::new();
        table.push(core_device(
            "quiet",
            DeviceCaps::new().with_telemetry(Arc::new(FixedFragment(serde_json::Value::Null))),
        ));

        let fixture = Fixture::new();
        let assembler = fixture.assembler(1024);
        let bus = sequencer();
        let output = assembler.collect(&mut table, &bus, QueryPass::Data).await;

        let parsed: serde_json::Value = serde_json::from_str(&output.frames[0]).unwrap();
        assert_eq!(parsed["n"], 0);
        assert!(parsed["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_pass_leads_with_system_fragment() {
        let mut table = DeviceTable::new();
        table.push(core_device(
            "clk",
            DeviceCaps::new().with_metadata(Arc::new(FixedFragment(json!({"name":"clk"})))),
        ));

        let fixture = Fixture::new();
        let assembler = fixture.assembler(1024);
        let bus = sequencer();
        let output = assembler
            .collect(&mut table, &bus, QueryPass::Metadata)
            .await;

        let parsed: serde_json::Value = serde_json::from_str(&output.frames[0]).unwrap();
        let items = parsed["items"].as_array().unwrap();
        assert_eq!(items[0]["name"], "system");
        assert_eq!(items[0]["schema"], SCHEMA_VERSION);
        assert_eq!(items[0]["log_period_s"], 900);
        assert_eq!(items[1]["name"], "clk");
    }

    #[tokio::test]
    async fn test_init_pass_aggregates_faults_and_marks_begun() {
        let mut table = DeviceTable::new();
        let idx = table.push(core_device(
            "clk",
            DeviceCaps::new().with_lifecycle(Arc::new(FaultyBegin)),
        ));

        let fixture = Fixture::new();
        let assembler = fixture.assembler(1024);
        let bus = sequencer();
        let output = assembler.collect(&mut table, &bus, QueryPass::Init).await;

        assert!(output.critical_fault);
        assert!(!output.recoverable_fault);
        assert!(table.record(idx).begun);
        assert_eq!(table.record(idx).error_count, 1);

        let parsed: serde_json::Value = serde_json::from_str(&output.frames[0]).unwrap();
        assert_eq!(parsed["items"][0]["name"], "clk");
    }

    #[tokio::test]
    async fn test_error_pass_is_silent_when_no_errors() {
        let mut table = DeviceTable::new();
        table.push(core_device("ok", DeviceCaps::new()));

        let fixture = Fixture::new();
        let assembler = fixture.assembler(1024);
        assert!(assembler.collect_errors(&table).is_empty());
    }

    #[tokio::test]
    async fn test_error_pass_reports_tallied_devices() {
        let mut table = DeviceTable::new();
        let a = table.push(core_device("flaky", DeviceCaps::new()));
        table.push(core_device("fine", DeviceCaps::new()));
        table.tally_error(a);
        table.tally_error(a);

        let fixture = Fixture::new();
        let assembler = fixture.assembler(1024);
        let frames = assembler.collect_errors(&table);
        assert_eq!(frames.len(), 1);

        let parsed: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        let items = parsed["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["name"], "flaky");
        assert_eq!(items[0]["errors"], 2);
    }

    #[tokio::test]
    async fn test_oversized_fragment_is_dropped_and_tallied() {
        let mut table = DeviceTable::new();
        let big = json!({"name": "big", "pad": "x".repeat(600)});
        let idx = table.push(core_device(
            "big",
            DeviceCaps::new().with_telemetry(Arc::new(FixedFragment(big))),
        ));

        let fixture = Fixture::new();
        let assembler = fixture.assembler(256);
        let bus = sequencer();
        let output = assembler.collect(&mut table, &bus, QueryPass::Data).await;

        for frame in &output.frames {
            assert!(frame.len() <= 256);
            let parsed: serde_json::Value = serde_json::from_str(frame).unwrap();
            assert!(parsed["items"].as_array().unwrap().is_empty());
        }
        assert_eq!(table.record(idx).error_count, 1);
    }
}
