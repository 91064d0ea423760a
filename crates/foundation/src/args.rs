//! A compact library of concrete argument types.
//!
//! These are the nodes the runtime's tests and small fits are built from:
//! leaves ([`Parameter`], [`DataVector`], [`Category`]) and a handful of
//! derived ops ([`Add`], [`Mul`], [`NegLog`], [`Sum`], [`Mean`]). Larger
//! kernel libraries plug in by implementing [`Argument`] the same way.
//!
//! Every type embeds an [`ArgCore`] carrying the per-node state the engine
//! manipulates (data token, operation-mode override) plus an evaluation
//! counter used by diagnostics and the recompute-minimality tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::graph::{ArgKind, ArgRef, Argument, Capabilities, KernelError, SpanSource};
use crate::ids::ArgId;
use crate::span::Span;

const TOKEN_UNSET: usize = usize::MAX;

/// Per-node state shared by every argument implementation.
pub struct ArgCore {
    id: ArgId,
    servers: Vec<ArgRef>,
    data_token: AtomicUsize,
    always_dirty: AtomicBool,
    evals: AtomicU64,
}

impl ArgCore {
    pub fn new(id: impl Into<ArgId>, servers: Vec<ArgRef>) -> Self {
        Self {
            id: id.into(),
            servers,
            data_token: AtomicUsize::new(TOKEN_UNSET),
            always_dirty: AtomicBool::new(false),
            evals: AtomicU64::new(0),
        }
    }

    fn note_eval(&self) {
        self.evals.fetch_add(1, Ordering::Relaxed);
    }
}

/// Implements the [`ArgCore`]-backed portion of [`Argument`] for a type with
/// a `core` field, in the spirit of the id-wrapper macro in the ids module.
macro_rules! impl_arg_state {
    () => {
        fn id(&self) -> &ArgId {
            &self.core.id
        }

        fn servers(&self) -> &[ArgRef] {
            &self.core.servers
        }

        fn data_token(&self) -> Option<usize> {
            match self.core.data_token.load(Ordering::Relaxed) {
                TOKEN_UNSET => None,
                token => Some(token),
            }
        }

        fn set_data_token(&self, token: Option<usize>) {
            self.core
                .data_token
                .store(token.unwrap_or(TOKEN_UNSET), Ordering::Relaxed);
        }

        fn always_dirty(&self) -> bool {
            self.core.always_dirty.load(Ordering::Relaxed)
        }

        fn set_always_dirty(&self, on: bool) -> bool {
            self.core.always_dirty.swap(on, Ordering::Relaxed)
        }

        fn eval_count(&self) -> u64 {
            self.core.evals.load(Ordering::Relaxed)
        }
    };
}

fn input(data: &dyn SpanSource, server: &ArgRef) -> Result<Span, KernelError> {
    data.get(server.as_ref())
        .ok_or_else(|| KernelError::unbound(server.id()))
}

/// Broadcast access: scalar spans repeat their single element.
fn at(span: Span, i: usize) -> f64 {
    let values = span.as_slice();
    if values.len() == 1 {
        values[0]
    } else {
        values[i]
    }
}

// ============================================================================
// Leaves
// ============================================================================

/// Mutable scalar leaf. Assignments bump a monotonic counter the engine uses
/// to decide what to recompute.
pub struct Parameter {
    core: ArgCore,
    bits: AtomicU64,
    counter: AtomicU64,
}

impl Parameter {
    pub fn new(name: &str, value: f64) -> Arc<Self> {
        Arc::new(Self {
            core: ArgCore::new(name, Vec::new()),
            bits: AtomicU64::new(value.to_bits()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn set_val(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn val(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Argument for Parameter {
    impl_arg_state!();

    fn class_name(&self) -> &'static str {
        "Parameter"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::host_only()
    }

    fn kind(&self) -> ArgKind {
        ArgKind::Parameter
    }

    fn compute(&self, out: &mut [f64], _data: &dyn SpanSource) -> Result<(), KernelError> {
        self.core.note_eval();
        out[0] = self.val();
        Ok(())
    }

    fn value(&self) -> f64 {
        self.val()
    }

    fn value_reset_counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Dataset-bound leaf. Its span is published by the engine when a dataset is
/// bound; it has no kernel of its own.
pub struct DataVector {
    core: ArgCore,
}

impl DataVector {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            core: ArgCore::new(name, Vec::new()),
        })
    }
}

impl Argument for DataVector {
    impl_arg_state!();

    fn class_name(&self) -> &'static str {
        "DataVector"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            host: false,
            device: false,
            reducer: false,
        }
    }

    fn kind(&self) -> ArgKind {
        ArgKind::DatasetLeaf
    }

    fn compute(&self, _out: &mut [f64], _data: &dyn SpanSource) -> Result<(), KernelError> {
        Err(KernelError::new(format!(
            "dataset column '{}' is not bound by the current dataset",
            self.core.id
        )))
    }
}

/// Scalar-encoded category leaf.
pub struct Category {
    core: ArgCore,
    index: AtomicU64,
}

impl Category {
    pub fn new(name: &str, index: u32) -> Arc<Self> {
        Arc::new(Self {
            core: ArgCore::new(name, Vec::new()),
            index: AtomicU64::new(u64::from(index)),
        })
    }

    pub fn set_index(&self, index: u32) {
        self.index.store(u64::from(index), Ordering::Relaxed);
    }
}

impl Argument for Category {
    impl_arg_state!();

    fn class_name(&self) -> &'static str {
        "Category"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::host_only()
    }

    fn kind(&self) -> ArgKind {
        ArgKind::Category
    }

    fn compute(&self, out: &mut [f64], _data: &dyn SpanSource) -> Result<(), KernelError> {
        self.core.note_eval();
        out[0] = self.value();
        Ok(())
    }

    fn value(&self) -> f64 {
        self.index.load(Ordering::Relaxed) as f64
    }
}

// ============================================================================
// Derived ops
// ============================================================================

macro_rules! elementwise_binary {
    ($(#[$meta:meta])* $name:ident, $class:literal, $op:expr) => {
        $(#[$meta])*
        pub struct $name {
            core: ArgCore,
        }

        impl $name {
            pub fn new(name: &str, a: ArgRef, b: ArgRef) -> Arc<Self> {
                Arc::new(Self {
                    core: ArgCore::new(name, vec![a, b]),
                })
            }
        }

        impl Argument for $name {
            impl_arg_state!();

            fn class_name(&self) -> &'static str {
                $class
            }

            fn capabilities(&self) -> Capabilities {
                Capabilities::batched()
            }

            fn kind(&self) -> ArgKind {
                ArgKind::Derived
            }

            fn compute(&self, out: &mut [f64], data: &dyn SpanSource) -> Result<(), KernelError> {
                self.core.note_eval();
                let a = input(data, &self.core.servers[0])?;
                let b = input(data, &self.core.servers[1])?;
                let op: fn(f64, f64) -> f64 = $op;
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = op(at(a, i), at(b, i));
                }
                Ok(())
            }
        }
    };
}

elementwise_binary!(
    /// Elementwise sum of two inputs, broadcasting scalars.
    Add,
    "Add",
    |a, b| a + b
);

elementwise_binary!(
    /// Elementwise product of two inputs, broadcasting scalars.
    Mul,
    "Mul",
    |a, b| a * b
);

/// Elementwise negative natural logarithm.
pub struct NegLog {
    core: ArgCore,
}

impl NegLog {
    pub fn new(name: &str, a: ArgRef) -> Arc<Self> {
        Arc::new(Self {
            core: ArgCore::new(name, vec![a]),
        })
    }
}

impl Argument for NegLog {
    impl_arg_state!();

    fn class_name(&self) -> &'static str {
        "NegLog"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::batched()
    }

    fn kind(&self) -> ArgKind {
        ArgKind::Derived
    }

    fn compute(&self, out: &mut [f64], data: &dyn SpanSource) -> Result<(), KernelError> {
        self.core.note_eval();
        let a = input(data, &self.core.servers[0])?;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = -at(a, i).ln();
        }
        Ok(())
    }
}

macro_rules! reducer {
    ($(#[$meta:meta])* $name:ident, $class:literal, $fold:expr) => {
        $(#[$meta])*
        pub struct $name {
            core: ArgCore,
        }

        impl $name {
            pub fn new(name: &str, a: ArgRef) -> Arc<Self> {
                Arc::new(Self {
                    core: ArgCore::new(name, vec![a]),
                })
            }
        }

        impl Argument for $name {
            impl_arg_state!();

            fn class_name(&self) -> &'static str {
                $class
            }

            fn capabilities(&self) -> Capabilities {
                Capabilities::reducing()
            }

            fn kind(&self) -> ArgKind {
                ArgKind::Derived
            }

            fn compute(&self, out: &mut [f64], data: &dyn SpanSource) -> Result<(), KernelError> {
                self.core.note_eval();
                let a = input(data, &self.core.servers[0])?;
                let fold: fn(&[f64]) -> f64 = $fold;
                out[0] = fold(a.as_slice());
                Ok(())
            }
        }
    };
}

reducer!(
    /// Sum of all input elements; 0 for an empty span.
    Sum,
    "Sum",
    |values| values.iter().sum()
);

reducer!(
    /// Arithmetic mean of all input elements; 0 for an empty span.
    Mean,
    "Mean",
    |values| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }
);
