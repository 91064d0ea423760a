//! Device backend contract.
//!
//! The engine drives accelerators through this trait: per-node streams and
//! events, asynchronous per-stream work (kernel launches, cross-device
//! copies, event records and waits), synchronous dataset upload, and device
//! memory allocation. Cross-stream ordering is established exclusively by
//! enqueued event waits; the host never blocks on a stream except by polling
//! [`DeviceBackend::is_idle`].
//!
//! The crate ships one implementation, the [`software`] reference backend,
//! which runs device work on a worker thread against host-resident memory.
//! A real accelerator backend implements the same trait.

pub mod software;

pub use software::SoftwareDevice;

use std::sync::Arc;

use batchfit_foundation::{ArgId, ArgRef, SendSpan, SendSpanMut, Span, SpanMut};

use crate::data_map::SpanSnapshot;
use crate::error::Result;

/// Handle to a device stream owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) usize);

/// Handle to a device completion event owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) usize);

/// Device memory owned by a backend.
///
/// The reference backend stands device memory in with host-resident storage;
/// the handle shape is the same either way: a contiguous region of `f64`
/// addressed through spans.
pub struct DeviceAlloc {
    data: Box<[f64]>,
}

impl DeviceAlloc {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            data: vec![0.0; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read view of `[offset, offset + len)`.
    pub fn span_at(&self, offset: usize, len: usize) -> Span {
        Span::from_slice(&self.data[offset..offset + len])
    }

    /// Write view of `[offset, offset + len)`.
    pub fn span_mut_at(&mut self, offset: usize, len: usize) -> SpanMut {
        let region = &mut self.data[offset..offset + len];
        SpanMut::new(region.as_mut_ptr(), len)
    }
}

/// One unit of asynchronous work on a stream.
///
/// Ops on the same stream execute in FIFO order; ops on different streams
/// are unordered unless related by an event record/wait pair.
pub enum DeviceOp {
    /// Launch a node's kernel against a snapshot of its input spans.
    Kernel {
        node: ArgRef,
        out: SendSpanMut,
        inputs: SpanSnapshot,
    },
    /// Mirror a device-resident span into host-visible memory.
    CopyToHost { src: SendSpan, dst: SendSpanMut },
    /// Mirror a host-resident span into device-visible memory.
    CopyToDevice { src: SendSpan, dst: SendSpanMut },
    /// Mark the event fired once all prior work on this stream is done.
    RecordEvent(EventId),
    /// Hold this stream until the event has fired on its recording stream.
    WaitEvent(EventId),
}

/// Failure surfaced from the backend worker.
#[derive(Debug, Clone)]
pub enum DeviceFault {
    /// A device kernel reported failure.
    Kernel { node: ArgId, message: String },
    /// A stream, event, or copy operation failed.
    Device(String),
}

/// Stream, event, copy, and allocation primitives of one device.
pub trait DeviceBackend: Send + Sync {
    /// Backend name for the one-time architecture log.
    fn name(&self) -> &'static str;

    fn make_stream(&self) -> StreamId;

    /// Drop a stream and any work still queued on it.
    fn release_stream(&self, stream: StreamId);

    fn make_event(&self) -> EventId;

    fn release_event(&self, event: EventId);

    /// Re-arm an event so it can be recorded again this evaluation.
    fn reset_event(&self, event: EventId);

    /// Allocate a device region of `len` elements.
    fn alloc(&self, len: usize) -> Result<DeviceAlloc>;

    /// Synchronous host-to-device copy, used once per dataset bind.
    fn copy_to_device(&self, src: Span, dst: SpanMut) -> Result<()>;

    /// Queue asynchronous work on a stream.
    fn enqueue(&self, stream: StreamId, op: DeviceOp) -> Result<()>;

    /// Whether the stream has no queued or running work.
    fn is_idle(&self, stream: StreamId) -> bool;

    /// Retrieve and clear the first failure observed by the worker, if any.
    fn take_fault(&self) -> Option<DeviceFault>;

    /// Discard all queued work on every stream and wait for any running op
    /// to finish. Used when an evaluation aborts, so buffers can be
    /// reclaimed without a live writer.
    fn abort_all(&self);
}

/// Shared backend handle.
pub type BackendRef = Arc<dyn DeviceBackend>;
