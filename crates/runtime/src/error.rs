//! Errors raised by the evaluation engine.
//!
//! Construction-time failures ([`Error::DeviceUnavailable`],
//! [`Error::CycleDetected`]) are fatal to the engine being built. Failures
//! during `set_data` or an evaluation are fatal to that call only; the
//! engine stays usable and the next call may succeed. Every variant that
//! can name the offending node does so.

use thiserror::Error;

use batchfit_foundation::ArgId;

use crate::buffers::BufferKind;

/// Engine result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing or evaluating a graph.
#[derive(Debug, Error)]
pub enum Error {
    /// Device mode was requested but no device backend is present.
    #[error("device mode requested but no device backend is available")]
    DeviceUnavailable,

    /// The graph provider returned a cyclic dependency graph.
    ///
    /// The `nodes` field lists the identities involved in the cycle.
    #[error("cycle detected in expression graph: {nodes:?}")]
    CycleDetected {
        /// Node identities that could not be ordered.
        nodes: Vec<ArgId>,
    },

    /// Dataset size propagation found disagreeing non-scalar inputs.
    #[error("size mismatch at '{node}': expected {expected} elements, found {found}")]
    SizeMismatch {
        /// The node whose servers disagree.
        node: ArgId,
        expected: usize,
        found: usize,
    },

    /// The buffer pool could not satisfy an allocation.
    #[error("failed to allocate {kind:?} buffer of {len} elements")]
    Allocation { kind: BufferKind, len: usize },

    /// A host or device kernel reported failure.
    #[error("kernel failed at '{node}': {message}")]
    Kernel { node: ArgId, message: String },

    /// A stream, event, or copy operation failed on the device backend.
    #[error("device error: {0}")]
    Device(String),

    /// A data map was queried for a node never published this evaluation.
    ///
    /// This indicates a scheduling bug, not a user error.
    #[error("node '{node}' has no published span on this side")]
    UnboundNode { node: ArgId },
}
