//! Error types for the engine bridge.
//!
//! All errors implement `std::error::Error` and carry enough context to decide
//! whether the bridge should retry, restart the engine, or tell the host.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: the loopback socket ended, reset, or was closed locally
//! - **Protocol Errors**: a frame violated the wire format (size caps, short reads, bad payloads)
//! - **Engine Errors**: the child process crashed, could not be found, or ran out of
//!   restarts
//! - **Scene Errors**: nothing sliceable in the scene, or malformed mesh data
//! - **Configuration Errors**: invalid or unreadable bridge configuration
//!
//! ## Host Visibility
//!
//! Only [`BridgeError::EngineUnavailable`] and [`BridgeError::SnapshotEmpty`] are
//! meant to reach the host. Everything else is absorbed by the restart path and
//! only shows up as "no current result":
//!
//! ```rust
//! use slicebridge::BridgeError;
//!
//! let error = BridgeError::transport_closed("connection reset by peer");
//! assert!(!error.is_host_visible());
//! assert!(error.is_retryable());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Why a slice request ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The socket closed or a protocol violation forced it closed.
    TransportClosed,
    /// The child exited while the request was active.
    EngineCrashed,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::TransportClosed => f.write_str("transport closed"),
            FailureCause::EngineCrashed => f.write_str("engine crashed"),
        }
    }
}

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Transport closed: {reason}")]
    TransportClosed {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Frame declares {declared} payload bytes, cap is {max}")]
    FrameTooLarge { declared: u64, max: u64 },

    #[error("Payload of {len} bytes exceeds the encodable maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Unexpected end of stream while reading {context}: needed {needed} bytes, got {got}")]
    UnexpectedEnd { context: &'static str, needed: usize, got: usize },

    #[error("Malformed {command} payload: {details}")]
    Payload { command: String, details: String },

    #[error("Engine exited while a slice was active (exit code {exit_code:?})")]
    EngineCrashed { exit_code: Option<i32> },

    #[error("Engine unavailable after {failures} consecutive failures")]
    EngineUnavailable { failures: u32 },

    #[error("Engine binary not found: {path}")]
    EngineNotFound { path: PathBuf },

    #[error("Failed to spawn engine {path}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Scene contains no sliceable objects")]
    SnapshotEmpty,

    #[error("Slice for snapshot {snapshot_id} superseded by a newer scene")]
    CancelledBySupersession { snapshot_id: u64 },

    #[error("Invalid mesh for node {node}: {details}")]
    InvalidMesh { node: String, details: String },

    #[error("Configuration error in {context}: {details}")]
    Config { context: String, details: String },

    #[error("I/O error during {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    /// Returns whether the failed operation may succeed on a fresh engine.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::TransportClosed { .. } => true,
            BridgeError::FrameTooLarge { .. } => true,
            BridgeError::UnexpectedEnd { .. } => true,
            BridgeError::Payload { .. } => true,
            BridgeError::EngineCrashed { .. } => true,
            BridgeError::Spawn { .. } => true,
            BridgeError::Io { .. } => true,
            BridgeError::PayloadTooLarge { .. } => false,
            BridgeError::EngineUnavailable { .. } => false,
            BridgeError::EngineNotFound { .. } => false,
            BridgeError::SnapshotEmpty => false,
            BridgeError::CancelledBySupersession { .. } => false,
            BridgeError::InvalidMesh { .. } => false,
            BridgeError::Config { .. } => false,
        }
    }

    /// Whether this error is surfaced to the host rather than absorbed.
    pub fn is_host_visible(&self) -> bool {
        matches!(self, BridgeError::EngineUnavailable { .. } | BridgeError::SnapshotEmpty)
    }

    /// Protocol violations close the connection and are then handled as a closed transport.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            BridgeError::FrameTooLarge { .. }
                | BridgeError::PayloadTooLarge { .. }
                | BridgeError::UnexpectedEnd { .. }
                | BridgeError::Payload { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BridgeError::TransportClosed { .. } => vec![
                "Wait for the supervisor to restart the engine",
                "Check that nothing else is bound to the loopback port",
            ],
            BridgeError::FrameTooLarge { .. } | BridgeError::UnexpectedEnd { .. } => vec![
                "Verify the engine build speaks the same frame protocol",
                "Raise max_frame_bytes if the engine legitimately sends large frames",
            ],
            BridgeError::PayloadTooLarge { .. } => vec![
                "Reduce model detail or the number of instances on the build plate",
            ],
            BridgeError::Payload { .. } => vec![
                "Verify the engine build speaks the same command table",
            ],
            BridgeError::EngineCrashed { .. } => vec![
                "Inspect the engine log for the cause of the crash",
                "Wait for the supervisor to restart the engine",
            ],
            BridgeError::EngineUnavailable { .. } => vec![
                "Inspect the engine log for repeated startup failures",
                "Request an explicit engine restart once the cause is fixed",
            ],
            BridgeError::EngineNotFound { .. } => vec![
                "Set engine_binary_path to the slicing engine executable",
                "Ensure the engine is installed next to the application or on PATH",
            ],
            BridgeError::Spawn { .. } => vec![
                "Check the engine binary is executable",
                "Check available system resources",
            ],
            BridgeError::SnapshotEmpty => vec![
                "Place at least one printable model inside the build volume",
            ],
            BridgeError::CancelledBySupersession { .. } => vec![],
            BridgeError::InvalidMesh { .. } => vec![
                "Re-import the model",
                "Repair the mesh so every index refers to an existing vertex",
            ],
            BridgeError::Config { .. } => vec![
                "Check the configuration file against the documented options",
            ],
            BridgeError::Io { .. } => vec![
                "Check file permissions and available disk space",
            ],
        }
    }

    /// Helper constructor for transport closure.
    pub fn transport_closed(reason: impl Into<String>) -> Self {
        BridgeError::TransportClosed { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport closure with an underlying cause.
    pub fn transport_closed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::TransportClosed { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for malformed inbound payloads.
    pub fn payload_error(command: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::Payload { command: command.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::Config { context: context.into(), details: details.into() }
    }

    /// Helper constructor for I/O errors with operation context.
    pub fn io_error(operation: impl Into<String>, source: std::io::Error) -> Self {
        BridgeError::Io { operation: operation.into(), source }
    }

    /// Helper constructor for invalid mesh data.
    pub fn invalid_mesh(node: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::InvalidMesh { node: node.into(), details: details.into() }
    }

    /// Failure cause recorded on a request that this error terminated.
    pub fn failure_cause(&self) -> FailureCause {
        match self {
            BridgeError::EngineCrashed { .. } => FailureCause::EngineCrashed,
            _ => FailureCause::TransportClosed,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => {
                BridgeError::transport_closed_with_source(err.to_string(), Box::new(err))
            }
            _ => BridgeError::Io { operation: "<unknown>".to_string(), source: err },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn messages_carry_their_context(
                reason in ".*",
                declared in 0u64..u64::MAX,
                max in 0u64..u64::MAX,
                failures in 0u32..100u32,
            ) {
                let closed = BridgeError::transport_closed(reason.clone());
                prop_assert!(closed.to_string().contains(&reason));

                let too_large = BridgeError::FrameTooLarge { declared, max };
                let msg = too_large.to_string();
                prop_assert!(msg.contains(&declared.to_string()));
                prop_assert!(msg.contains(&max.to_string()));

                let unavailable = BridgeError::EngineUnavailable { failures };
                prop_assert!(unavailable.to_string().contains(&failures.to_string()));
            }

            #[test]
            fn only_unavailable_and_empty_reach_the_host(
                reason in ".*",
                snapshot_id in any::<u64>(),
                exit_code in proptest::option::of(any::<i32>()),
            ) {
                let closed = BridgeError::transport_closed(reason.clone());
                let crashed = BridgeError::EngineCrashed { exit_code };
                let superseded = BridgeError::CancelledBySupersession { snapshot_id };
                let malformed = BridgeError::payload_error("Polygon", reason);
                let unavailable = BridgeError::EngineUnavailable { failures: 5 };

                prop_assert!(!closed.is_host_visible());
                prop_assert!(!crashed.is_host_visible());
                prop_assert!(!superseded.is_host_visible());
                prop_assert!(!malformed.is_host_visible());
                prop_assert!(BridgeError::SnapshotEmpty.is_host_visible());
                prop_assert!(unavailable.is_host_visible());
            }
        }
    }

    #[test]
    fn protocol_violations_are_classified() {
        assert!(BridgeError::FrameTooLarge { declared: 10, max: 5 }.is_protocol_violation());
        assert!(BridgeError::PayloadTooLarge { len: 10, max: 5 }.is_protocol_violation());
        assert!(
            BridgeError::UnexpectedEnd { context: "header", needed: 8, got: 3 }
                .is_protocol_violation()
        );
        assert!(!BridgeError::transport_closed("eof").is_protocol_violation());
        assert!(!BridgeError::SnapshotEmpty.is_protocol_violation());
    }

    #[test]
    fn failure_cause_mapping() {
        assert_eq!(
            BridgeError::EngineCrashed { exit_code: Some(139) }.failure_cause(),
            FailureCause::EngineCrashed
        );
        assert_eq!(
            BridgeError::transport_closed("reset").failure_cause(),
            FailureCause::TransportClosed
        );
        assert_eq!(
            BridgeError::FrameTooLarge { declared: 1, max: 0 }.failure_cause(),
            FailureCause::TransportClosed
        );
    }

    #[test]
    fn io_conversion_splits_disconnects_from_other_failures() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(BridgeError::from(eof), BridgeError::TransportClosed { .. }));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(BridgeError::from(reset), BridgeError::TransportClosed { .. }));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        match BridgeError::from(denied) {
            BridgeError::Io { source, .. } => assert_eq!(source.to_string(), "denied"),
            other => panic!("Expected Io variant, got {other:?}"),
        }
    }

    #[test]
    fn recovery_suggestions_are_actionable() {
        let errors = [
            BridgeError::transport_closed("reset"),
            BridgeError::EngineUnavailable { failures: 5 },
            BridgeError::EngineNotFound { path: PathBuf::from("/opt/engine") },
            BridgeError::SnapshotEmpty,
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "{error} should suggest a recovery");
            for suggestion in suggestions {
                assert!(suggestion.len() > 5);
            }
        }
        assert!(
            BridgeError::CancelledBySupersession { snapshot_id: 1 }
                .recovery_suggestions()
                .is_empty()
        );
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<BridgeError>();
    }
}
