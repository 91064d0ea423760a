//! The evaluation engine facade.
//!
//! An [`Engine`] prepares an expression graph once (topological order, edge
//! cache, data tokens) and then evaluates its top node repeatedly while an
//! optimizer varies the parameter leaves. Host mode runs the
//! dirty-propagation fast path in [`host`]; device mode runs the
//! heterogeneous scheduler in [`hetero`].
//!
//! The engine mutates the externally owned graph in exactly two scoped
//! ways, both undone at drop: compact data tokens installed on non-parameter
//! nodes, and the "always dirty" operation-mode override applied to
//! non-scalar nodes after a dataset bind.

mod hetero;
mod host;

#[cfg(test)]
mod tests;

use std::io;
use std::sync::Mutex;

use tracing::info;

use batchfit_foundation::{value_reachable, ArgRef, SendSpan, SendSpanMut, Span, SpanMut};

use crate::buffers::BufferManager;
use crate::data_map::DataMap;
use crate::dataset::{DataOptions, DataSource, DataSpans};
use crate::device::{BackendRef, DeviceAlloc, DeviceOp};
use crate::error::{Error, Result};
use crate::graph::{build_node_infos, propagate_output_sizes, sync_data_tokens, topological_order, NodeInfo};

/// Where kernels run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EvalMode {
    /// Host only, with dirty-propagation between evaluations.
    Host,
    /// Heterogeneous host + device scheduling.
    Device,
}

/// Evaluates one expression graph's top node.
pub struct Engine {
    /// Topologically ordered; the top node is last. Never reallocated after
    /// construction (scalar spans point into it).
    nodes: Vec<NodeInfo>,
    mode: EvalMode,
    backend: Option<BackendRef>,
    buffers: BufferManager,
    data_host: DataMap,
    data_device: DataMap,
    /// Owned storage for the bound dataset's columns.
    dataset: Option<DataSpans>,
    /// One contiguous device region holding all non-scalar dataset spans.
    device_dataset: Option<DeviceAlloc>,
    /// Operation-mode restore records, unwound in reverse at drop.
    oper_mode_restores: Vec<(usize, bool)>,
    evaluations: u64,
}

impl Engine {
    /// Prepare `top`'s graph for host-only evaluation.
    pub fn new(top: ArgRef) -> Result<Self> {
        Self::with_mode(top, EvalMode::Host, None)
    }

    /// Prepare `top`'s graph for heterogeneous evaluation on `backend`.
    pub fn with_backend(top: ArgRef, backend: BackendRef) -> Result<Self> {
        Self::with_mode(top, EvalMode::Device, Some(backend))
    }

    /// Prepare `top`'s graph for the given mode.
    ///
    /// Fails with [`Error::DeviceUnavailable`] if device mode is requested
    /// without a backend.
    pub fn with_mode(top: ArgRef, mode: EvalMode, backend: Option<BackendRef>) -> Result<Self> {
        if mode == EvalMode::Device && backend.is_none() {
            return Err(Error::DeviceUnavailable);
        }
        log_architecture(mode, backend.as_deref().map(|b| b.name()));

        let order = topological_order(value_reachable(&top))?;
        let mut nodes = build_node_infos(order);
        debug_assert!(
            nodes.last().map(|n| n.arg.id() == top.id()).unwrap_or(false),
            "top node must sort last"
        );

        let mut data_host = DataMap::new();
        let mut data_device = DataMap::new();
        data_host.resize(nodes.len());
        data_device.resize(nodes.len());

        if let Some(backend) = &backend {
            for info in &mut nodes {
                let stream = backend.make_stream();
                info.stream = Some(stream);
                info.event = Some(backend.make_event());
                data_device.set_config(info.i_node, stream);
            }
        }

        Ok(Self {
            nodes,
            mode,
            buffers: BufferManager::new(backend.clone()),
            backend,
            data_host,
            data_device,
            dataset: None,
            device_dataset: None,
            oper_mode_restores: Vec::new(),
            evaluations: 0,
        })
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    /// How many times `get_val` has been called, for diagnostics.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Extract spans from `source` under `options` and rebind the graph's
    /// dataset leaves to them.
    pub fn set_data(&mut self, source: &dyn DataSource, options: &DataOptions) -> Result<()> {
        let spans = source.spans(options)?;
        self.bind_spans(spans)
    }

    /// Rebind pre-extracted spans (step 1-6 of a dataset bind).
    pub fn bind_spans(&mut self, spans: DataSpans) -> Result<()> {
        // Reset per-dataset state.
        for info in &mut self.nodes {
            info.buffer = None;
            info.from_dataset = false;
            info.is_dirty = true;
        }
        self.data_host.clear_spans();
        self.data_device.clear_spans();
        let _ = self.device_dataset.take();
        self.dataset = Some(spans);
        let spans = self.dataset.as_ref().expect("dataset just bound");

        // Publish host spans for every bound leaf.
        for info in &mut self.nodes {
            let Some(column) = spans.get(info.arg.id()) else {
                continue;
            };
            info.arg.set_data_token(Some(info.i_node));
            self.data_host
                .set(info.i_node, info.arg.id(), Span::from_slice(column));
            info.from_dataset = true;
            info.is_dirty = false;
        }
        sync_data_tokens(&self.nodes);

        propagate_output_sizes(&mut self.nodes, spans)?;

        // The engine owns dirtiness for batched nodes; their own caches
        // must not second-guess the scheduler. Reversed at drop.
        for i in 0..self.nodes.len() {
            let info = &mut self.nodes[i];
            if !info.is_scalar() && !info.oper_mode_overridden {
                let prior = info.arg.set_always_dirty(true);
                info.oper_mode_overridden = true;
                self.oper_mode_restores.push((i, prior));
            }
        }

        if self.mode == EvalMode::Device {
            self.upload_dataset()?;
            hetero::mark_gpu_nodes(&mut self.nodes);
        }
        Ok(())
    }

    /// Copy all non-scalar dataset spans into one contiguous device region
    /// and publish the device-side views.
    fn upload_dataset(&mut self) -> Result<()> {
        let backend = self.backend.clone().ok_or(Error::DeviceUnavailable)?;
        let spans = self.dataset.as_ref().expect("dataset bound before upload");

        let total: usize = self
            .nodes
            .iter()
            .filter(|info| info.from_dataset && !info.is_scalar())
            .map(|info| info.output_size)
            .sum();
        let mut region = backend.alloc(total)?;

        let mut offset = 0usize;
        for info in &self.nodes {
            if !info.from_dataset {
                continue;
            }
            let column = spans
                .get(info.arg.id())
                .expect("bound leaf has a dataset column");
            if info.is_scalar() {
                // Scalar observables are read through host memory directly.
                self.data_device
                    .set(info.i_node, info.arg.id(), Span::from_slice(column));
            } else {
                let dst = region.span_mut_at(offset, info.output_size);
                backend.copy_to_device(Span::from_slice(column), dst)?;
                self.data_device
                    .set(info.i_node, info.arg.id(), dst.as_span());
                offset += info.output_size;
            }
        }
        // The region's heap storage keeps its address when the handle moves.
        self.device_dataset = Some(region);
        Ok(())
    }

    /// The value of the top node under the current parameter values.
    pub fn get_val(&mut self) -> Result<f64> {
        self.evaluations += 1;
        match self.mode {
            EvalMode::Host => self.eval_host(),
            EvalMode::Device => self.eval_heterogeneous(),
        }
    }

    /// Evaluate, then copy out the top node's full span.
    pub fn get_values(&mut self) -> Result<Vec<f64>> {
        self.get_val()?;
        let top = self.nodes.last().expect("graph has at least one node");
        let span = self.data_host.at(top.arg.as_ref())?;
        Ok(span.as_slice().to_vec())
    }

    /// All parameter leaves not bound by the dataset, sorted by name.
    ///
    /// This is a cached fast path over the graph provider's own parameter
    /// enumeration.
    pub fn get_parameters(&self) -> Vec<ArgRef> {
        let mut parameters: Vec<ArgRef> = self
            .nodes
            .iter()
            .filter(|info| info.is_variable && !info.from_dataset)
            .map(|info| info.arg.clone())
            .collect();
        parameters.sort_by(|a, b| a.name().cmp(b.name()));
        parameters
    }

    /// Diagnostic table of every node: index, name, class, size,
    /// dataset-bound flag, first value.
    pub fn print<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "--- batchfit evaluation graph ---")?;
        writeln!(
            out,
            "{:>5}  {:<24} {:<12} {:>8}  {:>9}  {:>12}",
            "Index", "Name", "Class", "Size", "From Data", "1st value"
        )?;
        for info in &self.nodes {
            let first = match self.data_host.at(info.arg.as_ref()) {
                Ok(span) => format!("{:.6}", span.first()),
                Err(_) => "-".to_string(),
            };
            writeln!(
                out,
                "{:>5}  {:<24} {:<12} {:>8}  {:>9}  {:>12}",
                info.i_node,
                info.arg.name(),
                info.arg.class_name(),
                info.output_size,
                info.from_dataset,
                first
            )?;
        }
        Ok(())
    }

    /// Run `i`'s kernel on the host, publishing the output span.
    ///
    /// Shared by both modes. In device mode, scalar outputs are mirrored
    /// into the device map immediately; non-scalar outputs of boundary
    /// nodes go into a pinned buffer whose device side is refreshed by an
    /// asynchronous copy on the node's stream.
    fn compute_host_node(&mut self, i: usize) -> Result<()> {
        let arg = self.nodes[i].arg.clone();
        let n_out = self.nodes[i].output_size;
        let device_mode = self.mode == EvalMode::Device;

        let mut out: SpanMut;
        if n_out == 1 {
            out = self.nodes[i].scalar_out();
            if device_mode {
                self.data_device.set(i, arg.id(), out.as_span());
            }
        } else {
            if device_mode && !self.nodes[i].has_logged && !arg.capabilities().device {
                info!(
                    node = %arg.name(),
                    class = arg.class_name(),
                    "kernel has no device implementation; computing on host"
                );
                self.nodes[i].has_logged = true;
            }
            if self.nodes[i].buffer.is_none() {
                let buffer = if device_mode && self.nodes[i].copy_after_evaluation {
                    let stream = self.nodes[i].stream.expect("device mode has per-node streams");
                    self.buffers.make_pinned(n_out, stream)?
                } else {
                    self.buffers.make_host(n_out)?
                };
                self.nodes[i].buffer = Some(buffer);
            }
            out = self
                .nodes[i]
                .buffer
                .as_mut()
                .expect("buffer acquired above")
                .host_write();
        }

        self.data_host.set(i, arg.id(), out.as_span());
        arg.compute(out.as_mut_slice(), &self.data_host)
            .map_err(|err| Error::Kernel {
                node: arg.id().clone(),
                message: err.to_string(),
            })?;

        if device_mode && self.nodes[i].copy_after_evaluation && n_out != 1 {
            // Mirror the host output across the boundary and mark completion
            // so device-side clients can order against it.
            let backend = self.backend.as_ref().expect("device mode has a backend");
            let stream = self.nodes[i].stream.expect("device mode has per-node streams");
            let event = self.nodes[i].event;
            let buffer = self
                .nodes[i]
                .buffer
                .as_mut()
                .expect("boundary nodes use pinned buffers");
            let src = buffer.host_read();
            let dst = buffer.device_write();
            backend.enqueue(
                stream,
                DeviceOp::CopyToDevice {
                    src: SendSpan(src),
                    dst: SendSpanMut(dst),
                },
            )?;
            self.data_device.set(i, arg.id(), dst.as_span());
            if let Some(event) = event {
                backend.enqueue(stream, DeviceOp::RecordEvent(event))?;
            }
        }
        Ok(())
    }

    /// Mark every client of `i` dirty (host mode).
    fn set_clients_dirty(&mut self, i: usize) {
        for k in 0..self.nodes[i].client_infos.len() {
            let client = self.nodes[i].client_infos[k];
            self.nodes[client].is_dirty = true;
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(backend) = &self.backend {
            backend.abort_all();
            // Per-node handles go in reverse topological order.
            for info in self.nodes.iter().rev() {
                if let Some(stream) = info.stream {
                    backend.release_stream(stream);
                }
                if let Some(event) = info.event {
                    backend.release_event(event);
                }
            }
        }
        // Unwind the operation-mode overrides, newest first.
        while let Some((i, prior)) = self.oper_mode_restores.pop() {
            self.nodes[i].arg.set_always_dirty(prior);
        }
        // External consumers see the graph in its original state.
        for info in &self.nodes {
            info.arg.set_data_token(None);
        }
    }
}

/// One-time INFO identification of the compute stack, per process per
/// distinct mode.
fn log_architecture(mode: EvalMode, backend_name: Option<&'static str>) {
    static LAST: Mutex<Option<EvalMode>> = Mutex::new(None);
    let mut last = LAST.lock().expect("architecture log lock poisoned");
    if *last == Some(mode) {
        return;
    }
    *last = Some(mode);

    info!(architecture = host_arch_name(), "using host compute kernels");
    if let Some(name) = backend_name {
        info!(backend = name, "using device compute backend");
    }
}

fn host_arch_name() -> &'static str {
    if cfg!(target_feature = "avx512f") {
        "avx512"
    } else if cfg!(target_feature = "avx2") {
        "avx2"
    } else if cfg!(target_feature = "avx") {
        "avx"
    } else if cfg!(target_feature = "sse4.2") {
        "sse4.2"
    } else {
        "generic"
    }
}
