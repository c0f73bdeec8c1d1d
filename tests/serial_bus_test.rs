//! The serial-bus worked example: a hub on slot 1 with two sub-ports, a
//! leaf sensor on sub-port 1 whose reads always fail validation. The data
//! pass must emit one frame whose device array carries a null-valued
//! fragment for that sensor and nothing for the unbound slots 2–3.

use anyhow::Result;
use async_trait::async_trait;
use fieldlog::bus::BusSequencer;
use fieldlog::device::{BusInterface, DeviceKind, Position, Presence};
use fieldlog::discovery::run_discovery;
use fieldlog::frame::{FrameAssembler, QueryPass, SystemInfo, SCHEMA_VERSION};
use fieldlog::protocol::{wrap_shared, BusSensorSpec, RetryReadProtocol, SerialBusSensor};
use fieldlog::registry::{DeviceCaps, DeviceRecord, DeviceTable};
use fieldlog::sim::{SimBackplane, SimBusPeer, SimHub};
use fieldlog::uplink::{FixedClock, LocationFix, MonotonicCounter, StaticIdentity};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Presence gate tying a shared-bus sensor to its physical sub-port: the
/// identify transaction only happens when the hub has the port live, the
/// way the real bus switch isolates unpowered drops.
struct PortGatedPresence {
    hub: Arc<SimHub>,
    port: u8,
    sensor: Arc<SerialBusSensor>,
}

#[async_trait]
impl Presence for PortGatedPresence {
    async fn probe(&self) -> Result<bool> {
        if !self.hub.port_live(self.port) {
            return Ok(false);
        }
        self.sensor.probe().await
    }
}

fn leaf_record(name: &str, caps: DeviceCaps) -> DeviceRecord {
    DeviceRecord {
        name: name.to_string(),
        kind: DeviceKind::Leaf,
        interface: BusInterface::SerialBus,
        keep_powered: false,
        position: None,
        tested: false,
        begun: false,
        error_count: 0,
        caps,
    }
}

fn hub_record(name: &str, hub: Arc<SimHub>) -> DeviceRecord {
    DeviceRecord {
        name: name.to_string(),
        kind: DeviceKind::Hub,
        interface: BusInterface::SerialBus,
        keep_powered: false,
        position: None,
        tested: false,
        begun: false,
        error_count: 0,
        caps: DeviceCaps::new()
            .with_presence(hub.clone())
            .with_hub(hub.clone())
            .with_lifecycle(hub),
    }
}

#[tokio::test]
async fn test_always_failing_serial_sensor_reports_nulls() {
    let backplane = SimBackplane::new(3);
    let hub = SimHub::install(backplane.clone(), "bh-serial", 1, BusInterface::SerialBus, 2);

    // Peer corrupts every checksum: each read exhausts the retry budget.
    let near = SimBusPeer::healthy('5', "HYD31", vec!["+1.0+2.0".into()])
        .with_bad_checksums(u32::MAX)
        .spawn();
    let port = wrap_shared(Box::new(near));
    let protocol = RetryReadProtocol::new(BusSensorSpec {
        address: '5',
        signature: "HYD31".to_string(),
        value_segments: 1,
        fields: vec!["level_m".into(), "temp_c".into()],
    })
    .with_reply_timeout(Duration::from_millis(50));
    let sensor = Arc::new(SerialBusSensor::new("hydro", port, protocol));

    let mut table = DeviceTable::new();
    table.push(hub_record("bh-serial", hub.clone()));
    table.push(leaf_record(
        "hydro",
        DeviceCaps::new()
            .with_presence(Arc::new(PortGatedPresence {
                hub,
                port: 1,
                sensor: sensor.clone(),
            }))
            .with_telemetry(sensor.clone())
            .with_errors(sensor.clone()),
    ));

    let bus = BusSequencer::new(backplane).with_settle(Duration::ZERO);
    let outcome = run_discovery(&mut table, &bus).await;
    assert_eq!(outcome.hubs_bound, 1);
    assert_eq!(outcome.sensors_bound, 1);
    assert_eq!(
        table.device_at(Position::leaf(1, 1)).map(|i| table.record(i).name.clone()),
        Some("hydro".to_string())
    );

    let clock = FixedClock::new(
        Utc.with_ymd_and_hms(2026, 8, 6, 6, 30, 0).unwrap(),
        LocationFix::default(),
    );
    let identity = StaticIdentity("t".to_string());
    let counter = MonotonicCounter::new();
    let assembler = FrameAssembler::new(
        &clock,
        &identity,
        &counter,
        SystemInfo {
            firmware: "0.3.0".to_string(),
            schema: SCHEMA_VERSION,
            log_period_secs: 900,
            backhaul_count: 1,
            power_save: "standby".to_string(),
        },
        1024,
    );

    let output = assembler.collect(&mut table, &bus, QueryPass::Data).await;

    // One frame; the hub contributes nothing (no telemetry capability) and
    // the unbound slots 2-3 contribute nothing at all.
    assert_eq!(output.frames.len(), 1);
    let parsed: serde_json::Value = serde_json::from_str(&output.frames[0]).unwrap();
    let items = parsed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["name"], "hydro");
    assert!(items[0]["level_m"].is_null());
    assert!(items[0]["temp_c"].is_null());

    // The exhausted read was tallied on the device and surfaces in the
    // aggregated error report.
    assert_eq!(sensor.failure_count(), 1);
    let error_frames = assembler.collect_errors(&table);
    assert_eq!(error_frames.len(), 1);
    let errors: serde_json::Value = serde_json::from_str(&error_frames[0]).unwrap();
    assert_eq!(errors["items"][0]["name"], "hydro");
    assert_eq!(errors["items"][0]["errors"], 1);
}

#[tokio::test]
async fn test_healthy_serial_sensor_reports_values_through_pass() {
    let backplane = SimBackplane::new(1);
    let hub = SimHub::install(backplane.clone(), "bh", 1, BusInterface::SerialBus, 1);

    let near = SimBusPeer::healthy('7', "HYD31", vec!["+0.84+9.5".into()]).spawn();
    let port = wrap_shared(Box::new(near));
    let protocol = RetryReadProtocol::new(BusSensorSpec {
        address: '7',
        signature: "HYD31".to_string(),
        value_segments: 1,
        fields: vec!["level_m".into(), "temp_c".into()],
    })
    .with_reply_timeout(Duration::from_millis(50));
    let sensor = Arc::new(SerialBusSensor::new("hydro", port, protocol));

    let mut table = DeviceTable::new();
    table.push(hub_record("bh", hub.clone()));
    table.push(leaf_record(
        "hydro",
        DeviceCaps::new()
            .with_presence(Arc::new(PortGatedPresence {
                hub,
                port: 1,
                sensor: sensor.clone(),
            }))
            .with_telemetry(sensor),
    ));

    let bus = BusSequencer::new(backplane).with_settle(Duration::ZERO);
    run_discovery(&mut table, &bus).await;

    let clock = FixedClock::new(
        Utc.with_ymd_and_hms(2026, 8, 6, 6, 30, 0).unwrap(),
        LocationFix::default(),
    );
    let identity = StaticIdentity("t".to_string());
    let counter = MonotonicCounter::new();
    let assembler = FrameAssembler::new(
        &clock,
        &identity,
        &counter,
        SystemInfo {
            firmware: "0.3.0".to_string(),
            schema: SCHEMA_VERSION,
            log_period_secs: 900,
            backhaul_count: 1,
            power_save: "standby".to_string(),
        },
        1024,
    );
    let output = assembler.collect(&mut table, &bus, QueryPass::Data).await;

    let parsed: serde_json::Value = serde_json::from_str(&output.frames[0]).unwrap();
    let item = &parsed["items"][0];
    assert_eq!(item["name"], "hydro");
    assert!((item["level_m"].as_f64().unwrap() - 0.84).abs() < 1e-9);
    assert!((item["temp_c"].as_f64().unwrap() - 9.5).abs() < 1e-9);
}
