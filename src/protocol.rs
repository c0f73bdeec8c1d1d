//! Shared Serial Bus: Plumbing and the Read-Retry/Validate Protocol
//!
//! Leaf sensors on the shared serial bus all speak the same ASCII
//! command/response convention:
//!
//! - Format: address-prefixed ASCII commands, CR terminated
//! - Identify: `{addr}I` → reply starts with `{addr}` and carries the
//!   device signature substring
//! - Acquire: `{addr}M` → reply `{addr}NNN`, NNN = busy estimate in ms;
//!   the caller waits at least that long before reading
//! - Read: `{addr}D0` .. `{addr}Dn` → fixed-size response segments
//!   (the transport limits single-response length); payloads concatenate
//! - Validate: the final segment carries `*HH`, the XOR of all payload
//!   bytes as two uppercase hex digits
//!
//! [`RetryReadProtocol`] implements the full `Idle → Identify → Acquire →
//! ReadSegments → Validate` sequence with a bounded retry budget. It is
//! implemented once and parameterized by [`BusSensorSpec`] (address,
//! signature, segment count, per-segment parser) rather than duplicated per
//! sensor model. Exhausting the budget yields an all-null [`ReadResult`],
//! never an error — a dead probe is a row of nulls in the frame, not a
//! halted cycle.
//!
//! # Serial Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`SharedPort`]: shared serial port with buffered reading
//!
//! Any type implementing the async I/O traits works: a real
//! `tokio_serial::SerialStream` (behind the `sensor_serial` feature), or a
//! `tokio::io::DuplexStream` in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::device::{
    DiagnosticsSource, ErrorTally, MetadataSource, Presence, SleepWake, TelemetrySource,
};

// =============================================================================
// Serial Port Types
// =============================================================================

/// Trait alias for async serial port I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered reading.
///
/// The bus is multidrop: several leaf sensors share one port, so the port
/// is held behind a mutex and every transaction runs under one guard.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Create a [`SharedPort`] from a type-erased serial port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open a serial port asynchronously with standard 8N1 settings.
///
/// Wraps the blocking open in `spawn_blocking` so port initialization does
/// not stall the runtime.
#[cfg(feature = "sensor_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> Result<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until no more data is immediately available. On a
/// multidrop bus another device may have answered since our last
/// transaction; a transaction that starts on stale bytes mis-parses.
///
/// Returns the number of bytes discarded.
pub async fn drain_stale<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total
}

// =============================================================================
// Protocol Specification
// =============================================================================

/// Per-segment payload parser: payload text → values in declaration order.
pub type SegmentParser = Arc<dyn Fn(&str) -> Result<Vec<f64>> + Send + Sync>;

/// Everything that distinguishes one serial-bus sensor model from another.
#[derive(Clone)]
pub struct BusSensorSpec {
    /// Single-character bus address.
    pub address: char,
    /// Substring the identify reply must contain.
    pub signature: String,
    /// Number of value segments (`D0` .. `D{n-1}`).
    pub value_segments: u8,
    /// Field names, in the order values arrive across segments.
    pub fields: Vec<String>,
}

/// Default payload parser: sign-prefixed decimal values, e.g. `+21.4-0.03+88`.
pub fn parse_signed_values(payload: &str) -> Result<Vec<f64>> {
    let mut values = Vec::new();
    let mut current = String::new();
    for ch in payload.chars() {
        if (ch == '+' || ch == '-') && !current.is_empty() {
            values.push(current.parse::<f64>().context("bad value in payload")?);
            current.clear();
        }
        current.push(ch);
    }
    if !current.is_empty() {
        values.push(current.parse::<f64>().context("bad value in payload")?);
    }
    Ok(values)
}

/// Outcome of one protocol invocation.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// One slot per declared field; `None` where the read failed.
    pub values: Vec<Option<f64>>,
    /// Attempts consumed (1..=3).
    pub attempts: u8,
}

impl ReadResult {
    /// Whether any value survived.
    pub fn is_failure(&self) -> bool {
        self.values.iter().all(|v| v.is_none())
    }
}

// =============================================================================
// Retry/Validate Protocol
// =============================================================================

/// Number of full Identify→Validate attempts before giving up.
pub const MAX_READ_ATTEMPTS: u8 = 3;

/// Reusable read protocol for shared-serial-bus leaf sensors.
pub struct RetryReadProtocol {
    spec: BusSensorSpec,
    parser: SegmentParser,
    /// Bound on each reply wait.
    reply_timeout: Duration,
    /// Cap on the acquire busy wait; a corrupt estimate cannot stall a cycle.
    busy_cap: Duration,
}

impl RetryReadProtocol {
    /// Create a protocol instance with the default parser and timing.
    pub fn new(spec: BusSensorSpec) -> Self {
        Self {
            spec,
            parser: Arc::new(parse_signed_values),
            reply_timeout: Duration::from_millis(250),
            busy_cap: Duration::from_secs(2),
        }
    }

    /// Replace the per-segment parser.
    pub fn with_parser(mut self, parser: SegmentParser) -> Self {
        self.parser = parser;
        self
    }

    /// Override the per-reply timeout (tests use short values).
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// The sensor specification this protocol instance serves.
    pub fn spec(&self) -> &BusSensorSpec {
        &self.spec
    }

    /// Single identify transaction (discovery presence probe, no retry).
    pub async fn identify(&self, port: &SharedPort) -> Result<bool> {
        let mut guard = port.lock().await;
        let discarded = drain_stale(guard.get_mut(), 5).await;
        if discarded > 0 {
            tracing::trace!(discarded, address = %self.spec.address, "drained stale bus bytes");
        }
        self.send(&mut *guard, "I").await?;
        match self.read_reply(&mut *guard).await {
            Ok(reply) => Ok(self.identity_matches(&reply)),
            Err(_) => Ok(false),
        }
    }

    /// Run the full retry/validate sequence.
    ///
    /// Never errors: exhausting the retry budget yields all-null values.
    /// The caller is responsible for tallying the failure on its device
    /// record.
    pub async fn query(&self, port: &SharedPort) -> ReadResult {
        for attempt in 1..=MAX_READ_ATTEMPTS {
            match self.attempt(port).await {
                Ok(values) => {
                    return ReadResult {
                        values: self.map_to_fields(values),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    tracing::debug!(
                        address = %self.spec.address,
                        attempt,
                        error = %e,
                        "read attempt failed"
                    );
                }
            }
        }
        ReadResult {
            values: vec![None; self.spec.fields.len()],
            attempts: MAX_READ_ATTEMPTS,
        }
    }

    /// One Identify→Acquire→ReadSegments→Validate pass.
    async fn attempt(&self, port: &SharedPort) -> Result<Vec<f64>> {
        let mut guard = port.lock().await;
        drain_stale(guard.get_mut(), 5).await;

        // Identify
        self.send(&mut *guard, "I").await?;
        let reply = self.read_reply(&mut *guard).await.context("no identify reply")?;
        if !self.identity_matches(&reply) {
            anyhow::bail!("identify reply '{}' does not match signature", reply);
        }

        // Acquire: reply carries a busy-duration estimate in ms.
        self.send(&mut *guard, "M").await?;
        let reply = self.read_reply(&mut *guard).await.context("no acquire reply")?;
        let busy_ms: u64 = reply
            .strip_prefix(self.spec.address)
            .with_context(|| format!("acquire reply '{}' missing address", reply))?
            .trim()
            .parse()
            .with_context(|| format!("acquire reply '{}' has no busy estimate", reply))?;
        let busy = Duration::from_millis(busy_ms).min(self.busy_cap);
        tokio::time::sleep(busy).await;

        // ReadSegments: request each segment by index and concatenate.
        let mut payload = String::new();
        for segment in 0..self.spec.value_segments {
            self.send(&mut *guard, &format!("D{segment}")).await?;
            let reply = self
                .read_reply(&mut *guard)
                .await
                .with_context(|| format!("no reply for segment {segment}"))?;
            let body = reply
                .strip_prefix(self.spec.address)
                .with_context(|| format!("segment reply '{}' missing address", reply))?;
            payload.push_str(body);
        }

        // Validate: trailing *HH checksum over every payload byte.
        let (data, checksum) = payload
            .rsplit_once('*')
            .context("payload missing checksum marker")?;
        let expected = u8::from_str_radix(checksum.trim(), 16).context("bad checksum digits")?;
        let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
        if actual != expected {
            anyhow::bail!(
                "checksum mismatch: computed {:02X}, device sent {:02X}",
                actual,
                expected
            );
        }

        (self.parser)(data)
    }

    fn identity_matches(&self, reply: &str) -> bool {
        reply.starts_with(self.spec.address) && reply.contains(&self.spec.signature)
    }

    fn map_to_fields(&self, values: Vec<f64>) -> Vec<Option<f64>> {
        let mut out: Vec<Option<f64>> = values.into_iter().map(Some).collect();
        out.resize(self.spec.fields.len(), None);
        out
    }

    async fn send(&self, port: &mut BufReader<DynSerial>, command: &str) -> Result<()> {
        let line = format!("{}{}\r", self.spec.address, command);
        port.get_mut().write_all(line.as_bytes()).await?;
        port.get_mut().flush().await?;
        Ok(())
    }

    async fn read_reply(&self, port: &mut BufReader<DynSerial>) -> Result<String> {
        let mut raw = Vec::new();
        tokio::time::timeout(self.reply_timeout, port.read_until(b'\r', &mut raw))
            .await
            .context("reply timed out")??;
        if raw.is_empty() {
            anyhow::bail!("empty reply");
        }
        Ok(String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }
}

// =============================================================================
// Generic Serial-Bus Leaf Sensor
// =============================================================================

/// A leaf sensor on the shared serial bus, generic over its [`BusSensorSpec`].
///
/// Every serial-bus sensor model is an instance of this type with a
/// different spec; none of them re-implement the read protocol.
pub struct SerialBusSensor {
    name: String,
    port: SharedPort,
    protocol: RetryReadProtocol,
    reads: AtomicU32,
    failures: AtomicU32,
}

impl SerialBusSensor {
    /// Create a sensor over an existing shared port.
    pub fn new(name: impl Into<String>, port: SharedPort, protocol: RetryReadProtocol) -> Self {
        Self {
            name: name.into(),
            port,
            protocol,
            reads: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    /// Total queries issued.
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Queries that exhausted the retry budget.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn command(&self, cmd: &str) -> Result<()> {
        let mut guard = self.port.lock().await;
        let line = format!("{}{}\r", self.protocol.spec().address, cmd);
        guard.get_mut().write_all(line.as_bytes()).await?;
        guard.get_mut().flush().await?;
        // Any acknowledgement is drained rather than parsed.
        drain_stale(guard.get_mut(), 5).await;
        Ok(())
    }
}

#[async_trait]
impl Presence for SerialBusSensor {
    async fn probe(&self) -> Result<bool> {
        self.protocol.identify(&self.port).await
    }
}

#[async_trait]
impl TelemetrySource for SerialBusSensor {
    async fn telemetry(&self) -> Result<serde_json::Value> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let result = self.protocol.query(&self.port).await;
        if result.is_failure() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let spec = self.protocol.spec();
        let mut fragment = serde_json::Map::new();
        fragment.insert("name".to_string(), json!(self.name));
        for (field, value) in spec.fields.iter().zip(result.values.iter()) {
            fragment.insert(field.clone(), json!(value));
        }
        Ok(serde_json::Value::Object(fragment))
    }
}

#[async_trait]
impl DiagnosticsSource for SerialBusSensor {
    async fn diagnostics(&self, verbosity: u8) -> Result<serde_json::Value> {
        let spec = self.protocol.spec();
        let mut fragment = serde_json::Map::new();
        fragment.insert("name".to_string(), json!(self.name));
        fragment.insert("reads".to_string(), json!(self.read_count()));
        fragment.insert("failed_reads".to_string(), json!(self.failure_count()));
        if verbosity >= 3 {
            fragment.insert("address".to_string(), json!(spec.address.to_string()));
            fragment.insert("segments".to_string(), json!(spec.value_segments));
        }
        Ok(serde_json::Value::Object(fragment))
    }
}

#[async_trait]
impl MetadataSource for SerialBusSensor {
    async fn metadata(&self) -> Result<serde_json::Value> {
        let spec = self.protocol.spec();
        Ok(json!({
            "name": self.name,
            "bus": "serial",
            "address": spec.address.to_string(),
            "signature": spec.signature,
            "fields": spec.fields,
        }))
    }
}

impl ErrorTally for SerialBusSensor {
    fn error_count(&self) -> u32 {
        self.failure_count()
    }
}

#[async_trait]
impl SleepWake for SerialBusSensor {
    async fn sleep(&self) -> Result<()> {
        self.command("S").await
    }

    async fn wake(&self) -> Result<()> {
        self.command("W").await
    }
}

// =============================================================================
// Hardware Factory
// =============================================================================

/// Configuration for a shared-bus serial sensor on real hardware.
#[cfg(feature = "sensor_serial")]
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SerialBusSensorConfig {
    /// Serial port path (e.g. "/dev/ttyS1").
    pub port: String,
    /// Baud rate (shared-bus sensors are conventionally 1200).
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Candidate id used in fragments.
    #[serde(default)]
    pub name: String,
    /// Single-character bus address.
    pub address: char,
    /// Identify-reply signature substring.
    pub signature: String,
    /// Number of value segments.
    #[serde(default = "default_segments")]
    pub segments: u8,
    /// Field names in arrival order.
    pub fields: Vec<String>,
}

#[cfg(feature = "sensor_serial")]
fn default_baud() -> u32 {
    1200
}

#[cfg(feature = "sensor_serial")]
fn default_segments() -> u8 {
    1
}

/// Factory for [`SerialBusSensor`] instances on a real serial port.
///
/// Ports are shared: the first candidate on a path opens it, later
/// candidates reuse the same [`SharedPort`] (the bus is multidrop).
#[cfg(feature = "sensor_serial")]
#[derive(Default)]
pub struct SerialBusSensorFactory {
    ports: Arc<Mutex<std::collections::HashMap<String, SharedPort>>>,
}

#[cfg(feature = "sensor_serial")]
impl SerialBusSensorFactory {
    /// Create a factory with no ports open yet.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "sensor_serial")]
static SERIAL_SENSOR_CAPABILITIES: &[crate::device::Capability] = &[
    crate::device::Capability::Presence,
    crate::device::Capability::Telemetry,
    crate::device::Capability::Diagnostics,
    crate::device::Capability::Metadata,
    crate::device::Capability::SleepWake,
    crate::device::Capability::Errors,
];

#[cfg(feature = "sensor_serial")]
impl crate::registry::DeviceFactory for SerialBusSensorFactory {
    fn device_type(&self) -> &'static str {
        "serial_probe"
    }

    fn name(&self) -> &'static str {
        "Shared-Bus Serial Sensor"
    }

    fn capabilities(&self) -> &'static [crate::device::Capability] {
        SERIAL_SENSOR_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SerialBusSensorConfig = config.clone().try_into()?;
        if cfg.segments == 0 {
            anyhow::bail!("at least one value segment is required");
        }
        if cfg.fields.is_empty() {
            anyhow::bail!("at least one field name is required");
        }
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> futures::future::BoxFuture<'static, Result<crate::registry::DeviceCaps>> {
        let ports = self.ports.clone();
        Box::pin(async move {
            let cfg: SerialBusSensorConfig = config.try_into()?;
            let port = {
                let mut map = ports.lock().await;
                match map.get(&cfg.port) {
                    Some(port) => port.clone(),
                    None => {
                        let stream =
                            open_serial_async(&cfg.port, cfg.baud, "serial probe").await?;
                        let shared = wrap_shared(Box::new(stream));
                        map.insert(cfg.port.clone(), shared.clone());
                        shared
                    }
                }
            };

            let protocol = RetryReadProtocol::new(BusSensorSpec {
                address: cfg.address,
                signature: cfg.signature,
                value_segments: cfg.segments,
                fields: cfg.fields,
            });
            let name = if cfg.name.is_empty() {
                format!("probe-{}", cfg.address)
            } else {
                cfg.name
            };
            let sensor = std::sync::Arc::new(SerialBusSensor::new(name, port, protocol));

            Ok(crate::registry::DeviceCaps::new()
                .with_presence(sensor.clone())
                .with_telemetry(sensor.clone())
                .with_diagnostics(sensor.clone())
                .with_metadata(sensor.clone())
                .with_sleep_wake(sensor.clone())
                .with_errors(sensor))
        })
    }
}
