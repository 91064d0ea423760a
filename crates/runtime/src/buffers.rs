//! Pooled host, device, and pinned-host buffers.
//!
//! Node outputs live in buffers handed out by the [`BufferManager`]. A
//! buffer returns to its pool when dropped, keyed by `(kind, bucketed
//! capacity)`, so re-requesting an identically-bucketed size is O(1) and
//! allocation traffic stays flat across evaluations. Capacities are
//! bucketed to the next power of two; a buffer never shrinks below the
//! requested length.
//!
//! Three kinds exist:
//!
//! - **Host** - writable and readable from the host.
//! - **Device** - device-resident, written by device kernels.
//! - **Pinned** - host-visible and device-visible, bound to a stream; used
//!   when a node's output must be mirrored across the host/device boundary.
//!   The host-visible side is valid only after the stream has executed the
//!   mirroring copy.
//!
//! The engine holds a node's buffer inside its NodeInfo until every client
//! has been issued, which is what makes span publication sound (see the
//! span module in the foundation crate).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use batchfit_foundation::{Span, SpanMut};

use crate::device::{BackendRef, DeviceAlloc, StreamId};
use crate::error::{Error, Result};

/// Which memory a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Host,
    Device,
    Pinned,
}

enum Storage {
    Host(Vec<f64>),
    Device(DeviceAlloc),
    Pinned { host: Vec<f64>, device: DeviceAlloc },
}

#[derive(Default)]
struct PoolState {
    free: HashMap<(BufferKind, usize), Vec<Storage>>,
    device_allocations: usize,
}

/// Pool of reusable buffers, one per engine.
pub struct BufferManager {
    pool: Rc<RefCell<PoolState>>,
    backend: Option<BackendRef>,
}

impl BufferManager {
    pub fn new(backend: Option<BackendRef>) -> Self {
        Self {
            pool: Rc::new(RefCell::new(PoolState::default())),
            backend,
        }
    }

    /// Host buffer of at least `len` elements.
    pub fn make_host(&self, len: usize) -> Result<Buffer> {
        self.issue(BufferKind::Host, len, None)
    }

    /// Device buffer of at least `len` elements.
    pub fn make_device(&self, len: usize) -> Result<Buffer> {
        self.issue(BufferKind::Device, len, None)
    }

    /// Pinned buffer of at least `len` elements, bound to `stream` for the
    /// asynchronous copies that keep its two sides coherent.
    pub fn make_pinned(&self, len: usize, stream: StreamId) -> Result<Buffer> {
        self.issue(BufferKind::Pinned, len, Some(stream))
    }

    /// How many fresh device-side allocations the pool has performed.
    pub fn device_allocations(&self) -> usize {
        self.pool.borrow().device_allocations
    }

    fn issue(&self, kind: BufferKind, len: usize, stream: Option<StreamId>) -> Result<Buffer> {
        let bucket = len.next_power_of_two().max(1);

        let reused = self.pool.borrow_mut().free.get_mut(&(kind, bucket)).and_then(Vec::pop);
        let storage = match reused {
            Some(storage) => storage,
            None => self.allocate(kind, bucket, len)?,
        };

        Ok(Buffer {
            storage: Some(storage),
            kind,
            bucket,
            len,
            stream,
            pool: Rc::clone(&self.pool),
        })
    }

    fn allocate(&self, kind: BufferKind, bucket: usize, len: usize) -> Result<Storage> {
        match kind {
            BufferKind::Host => Ok(Storage::Host(host_vec(bucket, kind, len)?)),
            BufferKind::Device => {
                let alloc = self.device_alloc(bucket)?;
                self.pool.borrow_mut().device_allocations += 1;
                Ok(Storage::Device(alloc))
            }
            BufferKind::Pinned => {
                let host = host_vec(bucket, kind, len)?;
                let device = self.device_alloc(bucket)?;
                self.pool.borrow_mut().device_allocations += 1;
                Ok(Storage::Pinned { host, device })
            }
        }
    }

    fn device_alloc(&self, bucket: usize) -> Result<DeviceAlloc> {
        let backend = self
            .backend
            .as_ref()
            .ok_or(Error::DeviceUnavailable)?;
        backend.alloc(bucket)
    }
}

fn host_vec(bucket: usize, kind: BufferKind, len: usize) -> Result<Vec<f64>> {
    let mut values: Vec<f64> = Vec::new();
    values
        .try_reserve_exact(bucket)
        .map_err(|_| Error::Allocation { kind, len })?;
    values.resize(bucket, 0.0);
    Ok(values)
}

/// A pooled buffer scoped to its holder; dropping it returns the storage to
/// the pool.
pub struct Buffer {
    storage: Option<Storage>,
    kind: BufferKind,
    bucket: usize,
    len: usize,
    stream: Option<StreamId>,
    pool: Rc<RefCell<PoolState>>,
}

impl Buffer {
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Requested length (never silently shrunk).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stream a pinned buffer is bound to.
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// Host-side write view. Valid for host and pinned buffers.
    pub fn host_write(&mut self) -> SpanMut {
        match self.storage.as_mut() {
            Some(Storage::Host(values)) | Some(Storage::Pinned { host: values, .. }) => {
                SpanMut::new(values.as_mut_ptr(), self.len)
            }
            _ => panic!("host write on a device-only buffer"),
        }
    }

    /// Host-side read view. Valid for host and pinned buffers.
    pub fn host_read(&self) -> Span {
        match self.storage.as_ref() {
            Some(Storage::Host(values)) | Some(Storage::Pinned { host: values, .. }) => {
                Span::new(values.as_ptr(), self.len)
            }
            _ => panic!("host read on a device-only buffer"),
        }
    }

    /// Device-side write view. Valid for device and pinned buffers.
    pub fn device_write(&mut self) -> SpanMut {
        let len = self.len;
        match self.storage.as_mut() {
            Some(Storage::Device(alloc)) | Some(Storage::Pinned { device: alloc, .. }) => {
                alloc.span_mut_at(0, len)
            }
            _ => panic!("device write on a host-only buffer"),
        }
    }

    /// Device-side read view. Valid for device and pinned buffers.
    pub fn device_read(&self) -> Span {
        match self.storage.as_ref() {
            Some(Storage::Device(alloc)) | Some(Storage::Pinned { device: alloc, .. }) => {
                alloc.span_at(0, self.len)
            }
            _ => panic!("device read on a host-only buffer"),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool
                .borrow_mut()
                .free
                .entry((self.kind, self.bucket))
                .or_default()
                .push(storage);
        }
    }
}
