//! Error types for warren-node.

use thiserror::Error;
use warren_ranges::RangeError;

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by registry, dispatch, and teardown operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Target identifier matched no instance in the registry.
    #[error("VM not found: {0}")]
    NotFound(String),

    /// Target resolved but the operation is not applicable in the
    /// instance's current state.
    #[error("VM state error: {0}")]
    State(String),

    /// Capability-gated operation invoked on a non-KVM instance.
    #[error("`{name}` is not a kvm VM -- {op} unsupported")]
    Unsupported {
        /// Name (or id text) of the instance
        name: String,
        /// Operation that was attempted
        op: String,
    },

    /// Malformed target expression.
    #[error("invalid target: {0}")]
    Parse(#[from] RangeError),

    /// Launch would reuse an existing non-empty VM name.
    #[error("vm launch duplicate VM name: {0}")]
    DuplicateName(String),

    /// Info query asked for a column the instance does not expose.
    #[error("unknown info field: {0}")]
    UnknownInfoField(String),

    /// Failure reported by the hypervisor monitor subsystem.
    #[error("monitor error: {0}")]
    Monitor(String),

    /// I/O error from a wrapped operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error indicates an inapplicable state.
    pub fn is_state(&self) -> bool {
        matches!(self, Error::State(_))
    }
}
