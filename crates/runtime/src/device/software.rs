//! Software reference backend.
//!
//! Runs "device" work on one worker thread against host-resident memory,
//! honoring the same ordering contract a real accelerator backend provides:
//! ops on one stream execute in FIFO order, a recorded event fires once all
//! prior work on its stream is done, and a wait parks a stream until the
//! event has fired. This makes device mode constructible and the scheduler
//! testable on any machine.
//!
//! The worker holds the state lock only while picking work; kernel and copy
//! execution happens unlocked with the stream marked running, so
//! [`DeviceBackend::is_idle`] stays accurate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use batchfit_foundation::{Span, SpanMut};

use crate::device::{DeviceAlloc, DeviceBackend, DeviceFault, DeviceOp, EventId, StreamId};
use crate::error::{Error, Result};

#[derive(Default)]
struct StreamState {
    queue: VecDeque<DeviceOp>,
    running: bool,
}

#[derive(Default)]
struct State {
    streams: Vec<Option<StreamState>>,
    events: Vec<Option<bool>>,
    fault: Option<DeviceFault>,
}

struct Inner {
    state: Mutex<State>,
    work: Condvar,
    shutdown: AtomicBool,
}

/// The reference device backend.
pub struct SoftwareDevice {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl SoftwareDevice {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            work: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("batchfit-device".to_string())
            .spawn(move || worker_loop(worker_inner))
            .expect("failed to spawn device worker thread");
        Arc::new(Self {
            inner,
            worker: Some(worker),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("device state lock poisoned")
    }
}

impl DeviceBackend for SoftwareDevice {
    fn name(&self) -> &'static str {
        "software reference backend"
    }

    fn make_stream(&self) -> StreamId {
        let mut state = self.state();
        state.streams.push(Some(StreamState::default()));
        StreamId(state.streams.len() - 1)
    }

    fn release_stream(&self, stream: StreamId) {
        let mut state = self.state();
        if let Some(slot) = state.streams.get_mut(stream.0) {
            *slot = None;
        }
    }

    fn make_event(&self) -> EventId {
        let mut state = self.state();
        state.events.push(Some(false));
        EventId(state.events.len() - 1)
    }

    fn release_event(&self, event: EventId) {
        let mut state = self.state();
        if let Some(slot) = state.events.get_mut(event.0) {
            *slot = None;
        }
    }

    fn reset_event(&self, event: EventId) {
        let mut state = self.state();
        if let Some(slot) = state.events.get_mut(event.0) {
            *slot = Some(false);
        }
    }

    fn alloc(&self, len: usize) -> Result<DeviceAlloc> {
        Ok(DeviceAlloc::new(len))
    }

    fn copy_to_device(&self, src: Span, mut dst: SpanMut) -> Result<()> {
        if src.len() != dst.len() {
            return Err(Error::Device(format!(
                "host-to-device copy length mismatch: {} vs {}",
                src.len(),
                dst.len()
            )));
        }
        dst.as_mut_slice().copy_from_slice(src.as_slice());
        Ok(())
    }

    fn enqueue(&self, stream: StreamId, op: DeviceOp) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Device("backend is shut down".to_string()));
        }
        let mut state = self.state();
        match state.streams.get_mut(stream.0) {
            Some(Some(slot)) => slot.queue.push_back(op),
            _ => return Err(Error::Device(format!("unknown stream {}", stream.0))),
        }
        self.inner.work.notify_all();
        Ok(())
    }

    fn is_idle(&self, stream: StreamId) -> bool {
        let state = self.state();
        match state.streams.get(stream.0) {
            Some(Some(slot)) => slot.queue.is_empty() && !slot.running,
            _ => true,
        }
    }

    fn take_fault(&self) -> Option<DeviceFault> {
        self.state().fault.take()
    }

    fn abort_all(&self) {
        self.state()
            .streams
            .iter_mut()
            .flatten()
            .for_each(|slot| slot.queue.clear());
        // An op already running keeps its buffers alive through the spans it
        // captured; wait it out so the caller may release them.
        loop {
            let busy = self
                .state()
                .streams
                .iter()
                .flatten()
                .any(|slot| slot.running);
            if !busy {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.work.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// What the worker decided to do with the front of a stream's queue.
enum Pick {
    /// Execute this op unlocked.
    Run(usize, DeviceOp),
    /// An event fired or a wait cleared; rescan from the top.
    Progress,
    /// Nothing is runnable.
    Idle,
}

fn worker_loop(inner: Arc<Inner>) {
    let mut guard = inner.state.lock().expect("device state lock poisoned");
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            return;
        }

        match pick_runnable(&mut guard) {
            Pick::Run(stream, op) => {
                drop(guard);
                let fault = execute(op);
                guard = inner.state.lock().expect("device state lock poisoned");
                if let Some(Some(slot)) = guard.streams.get_mut(stream) {
                    slot.running = false;
                }
                if let Some(fault) = fault {
                    debug!(?fault, "device worker observed a fault; draining queues");
                    if guard.fault.is_none() {
                        guard.fault = Some(fault);
                    }
                    for slot in guard.streams.iter_mut().flatten() {
                        slot.queue.clear();
                    }
                }
            }
            Pick::Progress => {}
            Pick::Idle => {
                let (next, _) = inner
                    .work
                    .wait_timeout(guard, Duration::from_millis(1))
                    .expect("device state lock poisoned");
                guard = next;
            }
        }
    }
}

/// Owned classification of a stream's front op, so the queue can be
/// mutated after inspection.
enum Front {
    Empty,
    Wait(EventId),
    Record(EventId),
    Work,
}

fn pick_runnable(state: &mut State) -> Pick {
    for i in 0..state.streams.len() {
        let front = match &state.streams[i] {
            Some(slot) => match slot.queue.front() {
                None => Front::Empty,
                Some(DeviceOp::WaitEvent(event)) => Front::Wait(*event),
                Some(DeviceOp::RecordEvent(event)) => Front::Record(*event),
                Some(_) => Front::Work,
            },
            None => Front::Empty,
        };
        match front {
            Front::Empty => continue,
            Front::Wait(event) => {
                let fired = state.events.get(event.0).copied().flatten().unwrap_or(false);
                if fired {
                    if let Some(Some(slot)) = state.streams.get_mut(i) {
                        slot.queue.pop_front();
                    }
                    return Pick::Progress;
                }
            }
            Front::Record(event) => {
                if let Some(Some(slot)) = state.streams.get_mut(i) {
                    slot.queue.pop_front();
                }
                if let Some(slot) = state.events.get_mut(event.0) {
                    *slot = Some(true);
                }
                return Pick::Progress;
            }
            Front::Work => {
                let Some(Some(slot)) = state.streams.get_mut(i) else {
                    continue;
                };
                let op = slot.queue.pop_front().expect("front op vanished");
                slot.running = true;
                return Pick::Run(i, op);
            }
        }
    }
    Pick::Idle
}

fn execute(op: DeviceOp) -> Option<DeviceFault> {
    match op {
        DeviceOp::Kernel { node, out, inputs } => {
            let mut out = out.0;
            match node.compute(out.as_mut_slice(), &inputs) {
                Ok(()) => None,
                Err(err) => Some(DeviceFault::Kernel {
                    node: node.id().clone(),
                    message: err.to_string(),
                }),
            }
        }
        DeviceOp::CopyToHost { src, dst } | DeviceOp::CopyToDevice { src, dst } => {
            let src = src.0;
            let mut dst = dst.0;
            if src.len() != dst.len() {
                return Some(DeviceFault::Device(format!(
                    "copy length mismatch: {} vs {}",
                    src.len(),
                    dst.len()
                )));
            }
            dst.as_mut_slice().copy_from_slice(src.as_slice());
            None
        }
        DeviceOp::RecordEvent(_) | DeviceOp::WaitEvent(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use batchfit_foundation::args::Parameter;
    use batchfit_foundation::{ArgRef, SendSpan, SendSpanMut, Span, SpanMut};

    use crate::data_map::SpanSnapshot;

    use super::*;

    fn wait_idle(backend: &SoftwareDevice, stream: StreamId) {
        for _ in 0..2000 {
            if backend.is_idle(stream) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("stream never became idle");
    }

    #[test]
    fn test_kernel_executes_on_worker() {
        let backend = SoftwareDevice::new();
        let stream = backend.make_stream();

        let p: ArgRef = Parameter::new("p", 5.0);
        let mut out = vec![0.0];
        backend
            .enqueue(
                stream,
                DeviceOp::Kernel {
                    node: p,
                    out: SendSpanMut(SpanMut::new(out.as_mut_ptr(), 1)),
                    inputs: SpanSnapshot::new(),
                },
            )
            .unwrap();

        wait_idle(&backend, stream);
        assert_eq!(out[0], 5.0);
    }

    #[test]
    fn test_event_orders_streams() {
        let backend = SoftwareDevice::new();
        let producer = backend.make_stream();
        let consumer = backend.make_stream();
        let event = backend.make_event();

        let p: ArgRef = Parameter::new("p", 7.0);
        let mut staged = vec![0.0];
        let mut result = vec![0.0];

        // The consumer is queued first but must observe the producer's
        // output: it parks on the event until the producer records it.
        backend.enqueue(consumer, DeviceOp::WaitEvent(event)).unwrap();
        backend
            .enqueue(
                consumer,
                DeviceOp::CopyToHost {
                    src: SendSpan(Span::from_slice(&staged)),
                    dst: SendSpanMut(SpanMut::new(result.as_mut_ptr(), 1)),
                },
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(!backend.is_idle(consumer));

        backend
            .enqueue(
                producer,
                DeviceOp::Kernel {
                    node: p,
                    out: SendSpanMut(SpanMut::new(staged.as_mut_ptr(), 1)),
                    inputs: SpanSnapshot::new(),
                },
            )
            .unwrap();
        backend.enqueue(producer, DeviceOp::RecordEvent(event)).unwrap();

        wait_idle(&backend, producer);
        wait_idle(&backend, consumer);
        assert_eq!(result[0], 7.0);
    }

    #[test]
    fn test_copy_length_mismatch_faults() {
        let backend = SoftwareDevice::new();
        let stream = backend.make_stream();

        let src = vec![1.0, 2.0];
        let mut dst = vec![0.0];
        backend
            .enqueue(
                stream,
                DeviceOp::CopyToHost {
                    src: SendSpan(Span::from_slice(&src)),
                    dst: SendSpanMut(SpanMut::new(dst.as_mut_ptr(), 1)),
                },
            )
            .unwrap();

        wait_idle(&backend, stream);
        assert!(matches!(
            backend.take_fault(),
            Some(DeviceFault::Device(_))
        ));
        assert!(backend.take_fault().is_none());
    }

    #[test]
    fn test_released_stream_rejects_work() {
        let backend = SoftwareDevice::new();
        let stream = backend.make_stream();
        backend.release_stream(stream);
        let result = backend.enqueue(stream, DeviceOp::RecordEvent(backend.make_event()));
        assert!(result.is_err());
        // Released streams read as idle.
        assert!(backend.is_idle(stream));
    }

    #[test]
    fn test_backend_is_arc_shareable() {
        let backend: Arc<dyn DeviceBackend> = SoftwareDevice::new();
        let stream = backend.make_stream();
        assert!(backend.is_idle(stream));
    }
}
