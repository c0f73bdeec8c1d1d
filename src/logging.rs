//! Tracing Infrastructure
//!
//! Structured, async-aware logging via `tracing` and `tracing-subscriber`:
//! level comes from configuration, the `FIELDLOG_LOG` environment variable
//! overrides it with a full filter expression, and initialization is
//! idempotent so tests and library embedders can call it freely.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-oriented with colors (interactive runs).
    Pretty,
    /// Single-line compact (headless/field deployments).
    Compact,
}

/// Initialize tracing at the given level.
///
/// `level` must be one of trace/debug/info/warn/error (config validation
/// guarantees this upstream). Returns Ok even when a subscriber is already
/// installed.
pub fn init(level: &str, format: OutputFormat) -> Result<(), String> {
    let filter = EnvFilter::try_from_env("FIELDLOG_LOG")
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| format!("invalid log filter '{level}': {e}"))?;

    let result = match format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_ansi(false).with_target(false))
            .try_init(),
    };

    // Already-initialized is fine: tests and embedders race on this.
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing already initialized");
    }
    Ok(())
}
