//! The expression-graph node contract.
//!
//! The evaluation engine never inspects concrete node types. Everything it
//! needs from the graph comes through the [`Argument`] trait: identity,
//! ordered value servers, capability flags, the kernel entry point, and the
//! small amount of mutable per-node state the engine installs at setup and
//! clears at teardown (data token, operation-mode override).
//!
//! # Servers and clients
//!
//! A node's *servers* are its inputs; its *clients* are the nodes that read
//! its output. The trait only exposes servers; the engine derives the client
//! edges during graph preparation.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ArgId;
use crate::span::Span;

/// Shared handle to a graph node.
pub type ArgRef = Arc<dyn Argument>;

/// What a node's kernels can do and where they can run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The kernel can run on the host.
    pub host: bool,
    /// The kernel can run on a device backend.
    pub device: bool,
    /// The output is scalar regardless of input size.
    pub reducer: bool,
}

impl Capabilities {
    /// Host-only kernel, elementwise output.
    pub fn host_only() -> Self {
        Self {
            host: true,
            device: false,
            reducer: false,
        }
    }

    /// Elementwise kernel available on both sides.
    pub fn batched() -> Self {
        Self {
            host: true,
            device: true,
            reducer: false,
        }
    }

    /// Reducing kernel available on both sides.
    pub fn reducing() -> Self {
        Self {
            host: true,
            device: true,
            reducer: true,
        }
    }
}

/// Structural role of a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    /// Mutable scalar leaf; changes are signalled by a monotonic counter.
    Parameter,
    /// Leaf whose value is a span supplied by the bound dataset.
    DatasetLeaf,
    /// Leaf carrying a scalar-encoded category index.
    Category,
    /// Interior node computed from its servers.
    Derived,
}

/// Error reported by a kernel invocation.
///
/// Kernels are opaque to the engine; whatever goes wrong inside one is
/// carried as a message and attributed to the node by the caller.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct KernelError(String);

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// A kernel asked for an input that is not published on its side.
    pub fn unbound(id: &ArgId) -> Self {
        Self(format!("input '{id}' is not published"))
    }
}

/// Read access to published spans, as seen by a kernel.
///
/// The host-side and device-side data maps both implement this, as does the
/// snapshot the scheduler hands to device kernels.
pub trait SpanSource {
    /// The published span for `arg`, if any.
    fn get(&self, arg: &dyn Argument) -> Option<Span>;
}

/// A node in the expression graph.
///
/// Implementations must be cheap to share (`Arc`) and safe to call from the
/// device backend's worker thread, which is why the mutable per-node state
/// (data token, operation mode, parameter value) lives behind atomics in the
/// provided [`args`](crate::args) types.
pub trait Argument: Send + Sync {
    /// Stable identity, usable as a map key.
    fn id(&self) -> &ArgId;

    /// Human-readable name. Defaults to the identity string.
    fn name(&self) -> &str {
        self.id().as_str()
    }

    /// Concrete type name, for diagnostics.
    fn class_name(&self) -> &'static str;

    /// Ordered value servers (inputs).
    fn servers(&self) -> &[ArgRef];

    fn capabilities(&self) -> Capabilities;

    fn kind(&self) -> ArgKind;

    /// Compute one batch: fill `out` (whose length is the node's output
    /// size) reading inputs from `data`.
    fn compute(&self, out: &mut [f64], data: &dyn SpanSource) -> Result<(), KernelError>;

    /// Current scalar value (parameters and categories).
    fn value(&self) -> f64 {
        0.0
    }

    /// Monotonic counter bumped on every parameter assignment.
    fn value_reset_counter(&self) -> u64 {
        0
    }

    /// Compact lookup token installed by the engine (the node's topological
    /// position). `None` when no engine is attached.
    fn data_token(&self) -> Option<usize>;

    fn set_data_token(&self, token: Option<usize>);

    /// Whether the node's own result cache is bypassed ("always dirty").
    fn always_dirty(&self) -> bool;

    /// Flip the operation mode, returning the prior setting so the caller
    /// can restore it at teardown.
    fn set_always_dirty(&self, on: bool) -> bool;

    /// How many times `compute` has run on this node.
    fn eval_count(&self) -> u64;
}

impl fmt::Debug for dyn Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argument")
            .field("id", self.id())
            .field("class", &self.class_name())
            .finish()
    }
}

/// Collect the set of nodes reachable from `top` through server edges.
///
/// Discovery is depth-first and de-duplicates by identity, so aliased nodes
/// (distinct objects with the same id) appear once, represented by the first
/// object encountered. The returned order is *not* topological; the engine
/// sorts it during graph preparation.
pub fn value_reachable(top: &ArgRef) -> Vec<ArgRef> {
    let mut seen: IndexSet<ArgId> = IndexSet::new();
    let mut out: Vec<ArgRef> = Vec::new();
    let mut stack: Vec<ArgRef> = vec![top.clone()];

    while let Some(arg) = stack.pop() {
        if !seen.insert(arg.id().clone()) {
            continue;
        }
        for server in arg.servers() {
            stack.push(server.clone());
        }
        out.push(arg);
    }
    out
}
