//! Engine-private per-node bookkeeping.

use batchfit_foundation::{ArgKind, ArgRef, SpanMut};

use crate::buffers::Buffer;
use crate::device::{EventId, StreamId};

/// Sentinel meaning "a parameter's counter has never been observed".
const NEVER_OBSERVED: u64 = u64::MAX;

/// Everything the engine tracks about one graph node.
///
/// One `NodeInfo` exists per node, created at engine construction and living
/// until teardown; its position in the owning vector is the node's
/// topological index and its data token. Server and client edges are stored
/// as indices into that vector, so the vector owns every node exclusively
/// and no reference cycles exist.
///
/// The vector must never reallocate after construction: published spans for
/// scalar nodes point at `scalar_buffer`, which is boxed precisely so its
/// address survives moves of the `NodeInfo` itself.
pub(crate) struct NodeInfo {
    pub arg: ArgRef,
    /// Topological position; 0 is the earliest leaf, the last is the top.
    pub i_node: usize,
    /// Elements this node produces per evaluation; 1 for scalars.
    pub output_size: usize,
    /// Bound by the current dataset.
    pub from_dataset: bool,
    /// Host parameter leaf (mutable scalar).
    pub is_variable: bool,
    /// Category leaf (scalar-encoded).
    pub is_category: bool,
    /// Host-mode recompute flag.
    pub is_dirty: bool,
    /// Cached parameter change counter (parameters only).
    pub last_set_val_count: u64,
    /// Inline storage for scalar outputs. Boxed for address stability.
    pub scalar_buffer: Box<f64>,
    /// Pooled storage for multi-element outputs; released once no live
    /// client needs it.
    pub buffer: Option<Buffer>,
    /// Scheduler countdowns (heterogeneous mode). `rem_servers` is the
    /// number of unissued servers while non-negative, `-1` once the node is
    /// launched on the device and unfinished, `-2` once retired.
    pub rem_clients: i32,
    pub rem_servers: i32,
    /// Device-resident output is also materialized on the host (or the
    /// other way around) because a client sits on the opposite side.
    pub copy_after_evaluation: bool,
    /// The one-time fallback notice for this node has been emitted.
    pub has_logged: bool,
    /// Whether the engine has flipped this node to "always dirty".
    pub oper_mode_overridden: bool,
    /// Per-node device handles (heterogeneous mode only).
    pub stream: Option<StreamId>,
    pub event: Option<EventId>,
    /// Edges as indices into the owning vector.
    pub server_infos: Vec<usize>,
    pub client_infos: Vec<usize>,
}

impl NodeInfo {
    pub fn new(arg: ArgRef, i_node: usize) -> Self {
        let kind = arg.kind();
        Self {
            arg,
            i_node,
            output_size: 1,
            from_dataset: false,
            is_variable: kind == ArgKind::Parameter,
            is_category: kind == ArgKind::Category,
            is_dirty: true,
            last_set_val_count: NEVER_OBSERVED,
            scalar_buffer: Box::new(0.0),
            buffer: None,
            rem_clients: 0,
            rem_servers: 0,
            copy_after_evaluation: false,
            has_logged: false,
            oper_mode_overridden: false,
            stream: None,
            event: None,
            server_infos: Vec::new(),
            client_infos: Vec::new(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.output_size == 1
    }

    /// The capability-based placement policy: reducers and non-scalar nodes
    /// run on the device when their kernel supports it. Category leaves are
    /// scalar-encoded and stay on the host.
    pub fn computes_on_device(&self) -> bool {
        let caps = self.arg.capabilities();
        (caps.reducer || !self.is_scalar()) && caps.device && !self.is_category
    }

    /// Whether this node records its completion event during an evaluation:
    /// device-launched nodes always do, host-computed nodes only when they
    /// mirror their output across the boundary.
    pub fn records_event(&self) -> bool {
        self.computes_on_device() || (self.copy_after_evaluation && !self.from_dataset)
    }

    /// Write view of the inline scalar slot.
    pub fn scalar_out(&mut self) -> SpanMut {
        SpanMut::new(&mut *self.scalar_buffer, 1)
    }
}
