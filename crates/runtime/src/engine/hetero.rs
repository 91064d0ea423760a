//! Heterogeneous scheduler: host and device work overlapped per evaluation.
//!
//! Placement is capability-based and fixed per dataset bind
//! ([`mark_gpu_nodes`]). Each evaluation resets the per-node countdowns,
//! launches every ready device-placed node, and then alternates between
//! draining completed device work and running the earliest ready host node,
//! yielding for ~1 ms when neither is possible. The `rem_servers` state
//! machine: non-negative counts unissued servers, `-1` is launched on the
//! device and unfinished, `-2` is retired.
//!
//! Cross-stream ordering uses recorded events only; the host thread never
//! blocks on a stream except through the [`is_idle`] poll.
//!
//! [`is_idle`]: crate::device::DeviceBackend::is_idle

use std::time::Duration;

use crate::data_map::SpanSnapshot;
use crate::device::{BackendRef, DeviceOp};
use crate::error::{Error, Result};
use crate::graph::NodeInfo;

use batchfit_foundation::{SendSpan, SendSpanMut, SpanMut};

use super::Engine;

/// Decide, per node, whether its kernel runs on the device, and flag nodes
/// whose output must be mirrored because a client sits on the other side.
///
/// Scalar outputs never need mirroring (they are published on both sides
/// when computed). The top node is mirrored whenever it is device-placed
/// and non-scalar, so its values can be copied out after an evaluation.
pub(super) fn mark_gpu_nodes(nodes: &mut [NodeInfo]) {
    if nodes.is_empty() {
        return;
    }
    let last = nodes.len() - 1;
    for i in 0..nodes.len() {
        nodes[i].copy_after_evaluation = false;
        if nodes[i].is_scalar() {
            continue;
        }
        let own = nodes[i].computes_on_device();
        let mut crossing = i == last && own;
        for k in 0..nodes[i].client_infos.len() {
            let client = nodes[i].client_infos[k];
            if nodes[client].computes_on_device() != own {
                crossing = true;
                break;
            }
        }
        nodes[i].copy_after_evaluation = crossing;
    }
}

impl Engine {
    pub(super) fn eval_heterogeneous(&mut self) -> Result<f64> {
        let backend = self.backend.clone().ok_or(Error::DeviceUnavailable)?;

        let result = self.hetero_pass(&backend);
        if result.is_err() {
            // Stop in-flight device work, then reclaim every buffer this
            // evaluation acquired; the engine stays usable.
            backend.abort_all();
            let _ = backend.take_fault();
            for info in &mut self.nodes {
                info.buffer = None;
            }
        }
        result
    }

    fn hetero_pass(&mut self, backend: &BackendRef) -> Result<f64> {
        // Reset countdowns, drop leftover buffers, re-arm events.
        let _ = backend.take_fault();
        for info in &mut self.nodes {
            info.rem_clients = info.client_infos.len() as i32;
            info.rem_servers = info.server_infos.len() as i32;
            info.buffer = None;
            if let Some(event) = info.event {
                backend.reset_event(event);
            }
        }

        // Every device-placed node with no pending servers starts now.
        for i in 0..self.nodes.len() {
            if self.nodes[i].rem_servers == 0 && self.nodes[i].computes_on_device() {
                self.assign_to_gpu(i, backend)?;
            }
        }

        let top = self.nodes.len() - 1;
        while self.nodes[top].rem_servers != -2 {
            if let Some(fault) = backend.take_fault() {
                return Err(fault_to_error(fault));
            }

            // Drain finished device nodes.
            for i in 0..self.nodes.len() {
                if self.nodes[i].rem_servers != -1 {
                    continue;
                }
                let stream = self.nodes[i].stream.expect("device mode has per-node streams");
                if !backend.is_idle(stream) {
                    continue;
                }
                self.nodes[i].rem_servers = -2;
                self.finish_node(i, backend)?;
            }

            // Earliest ready host node keeps the schedule deterministic.
            let next = (0..self.nodes.len()).find(|&i| {
                self.nodes[i].rem_servers == 0 && !self.nodes[i].computes_on_device()
            });

            let Some(i) = next else {
                // Nothing host-runnable; yield while the device works.
                std::thread::sleep(Duration::from_millis(1));
                continue;
            };

            self.nodes[i].rem_servers = -2;
            if !self.nodes[i].from_dataset {
                self.compute_host_node(i)?;
            }
            self.finish_node(i, backend)?;
        }

        if let Some(fault) = backend.take_fault() {
            return Err(fault_to_error(fault));
        }

        let top = self.nodes.last().expect("graph has at least one node");
        Ok(self.data_host.at(top.arg.as_ref())?.first())
    }

    /// Counter bookkeeping after `i` retires: clients that become ready and
    /// are device-placed launch immediately; servers with no remaining
    /// clients release their buffers.
    fn finish_node(&mut self, i: usize, backend: &BackendRef) -> Result<()> {
        for k in 0..self.nodes[i].client_infos.len() {
            let client = self.nodes[i].client_infos[k];
            self.nodes[client].rem_servers -= 1;
            if self.nodes[client].rem_servers == 0 && self.nodes[client].computes_on_device() {
                self.assign_to_gpu(client, backend)?;
            }
        }
        for k in 0..self.nodes[i].server_infos.len() {
            let server = self.nodes[i].server_infos[k];
            self.nodes[server].rem_clients -= 1;
            if self.nodes[server].rem_clients == 0 {
                self.nodes[server].buffer = None;
            }
        }
        Ok(())
    }

    /// Launch `i`'s kernel on its stream: order against the servers'
    /// events, acquire the output buffer, snapshot the input spans, enqueue
    /// the kernel, and record completion.
    fn assign_to_gpu(&mut self, i: usize, backend: &BackendRef) -> Result<()> {
        self.nodes[i].rem_servers = -1;
        let stream = self
            .data_device
            .config(i)
            .or(self.nodes[i].stream)
            .expect("device mode has per-node streams");
        let arg = self.nodes[i].arg.clone();
        let n_out = self.nodes[i].output_size;

        // Cross-stream ordering, without host synchronization: hold this
        // stream until every event-recording server has fired.
        for k in 0..self.nodes[i].server_infos.len() {
            let server = self.nodes[i].server_infos[k];
            if !self.nodes[server].records_event() {
                continue;
            }
            if let Some(event) = self.nodes[server].event {
                backend.enqueue(stream, DeviceOp::WaitEvent(event))?;
            }
        }

        let out: SpanMut = if n_out == 1 {
            let out = self.nodes[i].scalar_out();
            // Scalar device outputs are host-visible; publish both sides.
            self.data_host.set(i, arg.id(), out.as_span());
            out
        } else {
            let buffer = if self.nodes[i].copy_after_evaluation {
                self.buffers.make_pinned(n_out, stream)?
            } else {
                self.buffers.make_device(n_out)?
            };
            self.nodes[i].buffer = Some(buffer);
            self.nodes[i]
                .buffer
                .as_mut()
                .expect("buffer acquired above")
                .device_write()
        };
        self.data_device.set(i, arg.id(), out.as_span());

        // Freeze the input spans so the worker never races the live map.
        let mut inputs = SpanSnapshot::new();
        for k in 0..self.nodes[i].server_infos.len() {
            let server = self.nodes[i].server_infos[k];
            let server_arg = self.nodes[server].arg.clone();
            let span = self.data_device.at(server_arg.as_ref())?;
            inputs.insert(server_arg.id().clone(), span);
        }

        backend.enqueue(
            stream,
            DeviceOp::Kernel {
                node: arg.clone(),
                out: SendSpanMut(out),
                inputs,
            },
        )?;

        if self.nodes[i].copy_after_evaluation && n_out != 1 {
            // A host-side client needs this output; mirror it through the
            // pinned buffer. The host view becomes valid once the stream
            // reports idle, which is exactly when clients become ready.
            let buffer = self.nodes[i].buffer.as_mut().expect("boundary nodes use pinned buffers");
            let src = buffer.device_read();
            let dst = buffer.host_write();
            backend.enqueue(
                stream,
                DeviceOp::CopyToHost {
                    src: SendSpan(src),
                    dst: SendSpanMut(dst),
                },
            )?;
            self.data_host.set(i, arg.id(), dst.as_span());
        }

        if let Some(event) = self.nodes[i].event {
            backend.enqueue(stream, DeviceOp::RecordEvent(event))?;
        }
        Ok(())
    }
}

fn fault_to_error(fault: crate::device::DeviceFault) -> Error {
    match fault {
        crate::device::DeviceFault::Kernel { node, message } => Error::Kernel { node, message },
        crate::device::DeviceFault::Device(message) => Error::Device(message),
    }
}
