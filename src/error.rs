//! Custom error types for the node firmware.
//!
//! This module defines the application-level error type, `NodeError`, using
//! the `thiserror` crate. Device capabilities and drivers use `anyhow::Result`
//! (see [`crate::device`]); `NodeError` exists for the application boundary:
//! configuration loading, transport setup, and the few places where a failure
//! should abort startup rather than be downgraded.
//!
//! Nothing in the measurement core is fatal. A failed probe is an absent
//! device, a failed read is a null-valued field, and an over-long fragment is
//! a structural split — all of those are handled in place and tallied on the
//! device record, never raised through this type.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, NodeError>;

/// Primary error type for the node application boundary.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Configuration file parsing or merging failed.
    ///
    /// Occurs when loading the TOML configuration or merging environment
    /// overrides. Permanent: requires fixing the configuration source.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration validation failed.
    ///
    /// Values parsed correctly but fail semantic validation (zero hub
    /// slots, duplicate candidate ids, an unknown device type, a message
    /// budget smaller than the frame envelope). Permanent: fix the values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backplane or hub electrical operation failed while sequencing.
    ///
    /// Can be transient (contact bounce during enable) or permanent (a
    /// dead rail). The sequencer releases the path either way; callers
    /// treat the affected device as absent for the cycle.
    #[error("Bus sequencing error: {0}")]
    Bus(String),

    /// The transport collaborator rejected a finished frame.
    ///
    /// Delivery and retry policy belong to the transport; this surfaces
    /// only a terminal refusal (e.g. a closed sink during shutdown).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A declared device type has no registered factory.
    ///
    /// Permanent: the candidate pool is fixed at build/config time, so an
    /// unknown type is a deployment mistake, caught before discovery runs.
    #[error("Unknown device type '{0}' in candidate pool")]
    UnknownDeviceType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::Bus("slot 2 power enable failed".to_string());
        assert_eq!(
            err.to_string(),
            "Bus sequencing error: slot 2 power enable failed"
        );
    }

    #[test]
    fn test_unknown_device_type_display() {
        let err = NodeError::UnknownDeviceType("tundra_probe".to_string());
        assert!(err.to_string().contains("tundra_probe"));
    }
}
