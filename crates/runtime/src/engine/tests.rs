//! End-to-end engine scenarios: dirty minimality, heterogeneous crossings,
//! failure isolation, and cross-mode agreement.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use batchfit_foundation::args::{Add, DataVector, Mean, Mul, NegLog, Parameter, Sum};
use batchfit_foundation::{ArgId, ArgKind, ArgRef, Argument, Capabilities, KernelError, SpanSource};

use crate::dataset::{DataOptions, MemoryData};
use crate::device::SoftwareDevice;
use crate::error::Error;

use super::{Engine, EvalMode};

/// Flexible test node: explicit capabilities and a closure body.
struct TestNode {
    id: ArgId,
    class: &'static str,
    servers: Vec<ArgRef>,
    caps: Capabilities,
    token: AtomicUsize,
    always_dirty: AtomicBool,
    evals: AtomicU64,
    #[allow(clippy::type_complexity)]
    body: Box<
        dyn Fn(&mut [f64], &dyn SpanSource) -> std::result::Result<(), KernelError> + Send + Sync,
    >,
}

impl TestNode {
    fn new(
        id: &str,
        class: &'static str,
        servers: Vec<ArgRef>,
        caps: Capabilities,
        body: impl Fn(&mut [f64], &dyn SpanSource) -> std::result::Result<(), KernelError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ArgId::from(id),
            class,
            servers,
            caps,
            token: AtomicUsize::new(usize::MAX),
            always_dirty: AtomicBool::new(false),
            evals: AtomicU64::new(0),
            body: Box::new(body),
        })
    }
}

impl Argument for TestNode {
    fn id(&self) -> &ArgId {
        &self.id
    }
    fn class_name(&self) -> &'static str {
        self.class
    }
    fn servers(&self) -> &[ArgRef] {
        &self.servers
    }
    fn capabilities(&self) -> Capabilities {
        self.caps
    }
    fn kind(&self) -> ArgKind {
        ArgKind::Derived
    }
    fn compute(
        &self,
        out: &mut [f64],
        data: &dyn SpanSource,
    ) -> std::result::Result<(), KernelError> {
        self.evals.fetch_add(1, Ordering::Relaxed);
        (self.body)(out, data)
    }
    fn data_token(&self) -> Option<usize> {
        match self.token.load(Ordering::Relaxed) {
            usize::MAX => None,
            token => Some(token),
        }
    }
    fn set_data_token(&self, token: Option<usize>) {
        self.token
            .store(token.unwrap_or(usize::MAX), Ordering::Relaxed);
    }
    fn always_dirty(&self) -> bool {
        self.always_dirty.load(Ordering::Relaxed)
    }
    fn set_always_dirty(&self, on: bool) -> bool {
        self.always_dirty.swap(on, Ordering::Relaxed)
    }
    fn eval_count(&self) -> u64 {
        self.evals.load(Ordering::Relaxed)
    }
}

fn bind(engine: &mut Engine, data: &MemoryData) {
    engine.set_data(data, &DataOptions::default()).unwrap();
}

#[test]
fn test_sum_of_two_parameters() {
    let a = Parameter::new("a", 3.0);
    let b = Parameter::new("b", 4.0);
    let add = Add::new("top", a.clone(), b.clone());

    let mut engine = Engine::new(add.clone()).unwrap();
    assert_eq!(engine.get_val().unwrap(), 7.0);
    assert_eq!(add.eval_count(), 1);

    b.set_val(5.5);
    assert_eq!(engine.get_val().unwrap(), 8.5);
    // The sum kernel ran exactly once more.
    assert_eq!(add.eval_count(), 2);
    assert_eq!(engine.evaluations(), 2);
}

#[test]
fn test_dataset_mean() {
    let x = DataVector::new("x");
    let mean = Mean::new("top", x.clone());

    let mut engine = Engine::new(mean).unwrap();
    let data = MemoryData::new().with_column("x", vec![1.0, 2.0, 3.0, 4.0]);
    bind(&mut engine, &data);

    assert_eq!(engine.get_val().unwrap(), 2.5);
    // A reducer's full span is one element.
    assert_eq!(engine.get_values().unwrap(), vec![2.5]);
}

#[test]
fn test_pointwise_product_then_reduce() {
    let x = DataVector::new("x");
    let s = Parameter::new("s", 2.0);
    let y = Mul::new("y", x.clone(), s.clone());
    let top = Sum::new("top", y.clone());

    let mut engine = Engine::new(top.clone()).unwrap();
    let data = MemoryData::new().with_column("x", vec![1.0, 2.0, 3.0, 4.0]);
    bind(&mut engine, &data);

    assert_eq!(engine.get_val().unwrap(), 20.0);

    s.set_val(0.5);
    assert_eq!(engine.get_val().unwrap(), 5.0);
    // The product re-ran; the dataset column never runs a kernel.
    assert_eq!(y.eval_count(), 2);
    assert_eq!(x.eval_count(), 0);
}

#[test]
fn test_second_evaluation_reruns_nothing() {
    let x = DataVector::new("x");
    let s = Parameter::new("s", 2.0);
    let y = Mul::new("y", x.clone(), s.clone());
    let top = Sum::new("top", y.clone());

    let mut engine = Engine::new(top.clone()).unwrap();
    let data = MemoryData::new().with_column("x", vec![1.0, 2.0]);
    bind(&mut engine, &data);

    let first = engine.get_val().unwrap();
    let y_runs = y.eval_count();
    let top_runs = top.eval_count();

    let second = engine.get_val().unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
    assert_eq!(y.eval_count(), y_runs);
    assert_eq!(top.eval_count(), top_runs);
}

#[test]
fn test_parameter_invalidation_cascade() {
    let p = Parameter::new("p", 2.0);
    let f = Add::new("f", p.clone(), p.clone());
    let g = Mul::new("g", f.clone(), f.clone());
    let h = Add::new("h", g.clone(), g.clone());

    let mut engine = Engine::new(h.clone()).unwrap();
    // p=2: f=4, g=16, h=32.
    assert_eq!(engine.get_val().unwrap(), 32.0);

    p.set_val(1.0);
    // f=2, g=4, h=8; every stage re-evaluated once.
    assert_eq!(engine.get_val().unwrap(), 8.0);
    assert_eq!(f.eval_count(), 2);
    assert_eq!(g.eval_count(), 2);
    assert_eq!(h.eval_count(), 2);

    // No change: nothing re-evaluates.
    assert_eq!(engine.get_val().unwrap(), 8.0);
    assert_eq!(f.eval_count(), 2);
    assert_eq!(g.eval_count(), 2);
    assert_eq!(h.eval_count(), 2);
}

#[test]
fn test_single_parameter_graph() {
    let p = Parameter::new("p", 42.0);
    let mut engine = Engine::new(p.clone()).unwrap();
    assert_eq!(engine.get_val().unwrap(), 42.0);

    p.set_val(-1.5);
    assert_eq!(engine.get_val().unwrap(), -1.5);
}

#[test]
fn test_get_parameters_sorted_and_dataset_bound_excluded() {
    let beta = Parameter::new("beta", 1.0);
    let alpha = Parameter::new("alpha", 2.0);
    let nu = Parameter::new("nu", 3.0);
    let inner = Add::new("inner", beta.clone(), alpha.clone());
    let top = Add::new("top", inner, nu.clone());

    let mut engine = Engine::new(top).unwrap();
    // `nu` is an observable in this dataset, not a fit parameter.
    let data = MemoryData::new().with_column("nu", vec![9.0]);
    bind(&mut engine, &data);

    let params = engine.get_parameters();
    let names: Vec<&str> = params.iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
}

#[test]
fn test_failure_isolation() {
    let fail = Arc::new(AtomicBool::new(false));
    let x = DataVector::new("x");
    let body_fail = fail.clone();
    let x_for_body = x.clone();
    let flaky = TestNode::new(
        "flaky",
        "Flaky",
        vec![x.clone() as ArgRef],
        Capabilities::host_only(),
        move |out, data| {
            if body_fail.load(Ordering::Relaxed) {
                return Err(KernelError::new("injected failure"));
            }
            let input = data
                .get(x_for_body.as_ref())
                .ok_or_else(|| KernelError::unbound(x_for_body.id()))?;
            for (slot, &v) in out.iter_mut().zip(input.as_slice()) {
                *slot = v * 2.0;
            }
            Ok(())
        },
    );
    let top = Sum::new("top", flaky.clone());

    let mut engine = Engine::new(top.clone()).unwrap();
    let data = MemoryData::new().with_column("x", vec![1.0, 2.0, 3.0]);
    bind(&mut engine, &data);

    fail.store(true, Ordering::Relaxed);
    match engine.get_val() {
        Err(Error::Kernel { node, .. }) => assert_eq!(node.as_str(), "flaky"),
        other => panic!("expected kernel failure, got {other:?}"),
    }

    // Corrected inputs on the next evaluation complete normally.
    fail.store(false, Ordering::Relaxed);
    assert_eq!(engine.get_val().unwrap(), 12.0);
}

#[test]
fn test_print_lists_every_node() {
    let a = Parameter::new("a", 3.0);
    let b = Parameter::new("b", 4.0);
    let top = Add::new("top", a, b);

    let mut engine = Engine::new(top).unwrap();
    engine.get_val().unwrap();

    let mut sink = Vec::new();
    engine.print(&mut sink).unwrap();
    let table = String::from_utf8(sink).unwrap();
    assert!(table.contains("Name"));
    assert!(table.contains("top"));
    assert!(table.contains("Parameter"));
    assert!(table.contains("7.000000"));
}

#[test]
fn test_tokens_cleared_at_teardown() {
    let x = DataVector::new("x");
    let top = Sum::new("top", x.clone());

    {
        let mut engine = Engine::new(top.clone()).unwrap();
        let data = MemoryData::new().with_column("x", vec![1.0, 2.0]);
        bind(&mut engine, &data);
        assert!(x.data_token().is_some());
        // Non-scalar nodes run with their own caches bypassed.
        assert!(x.always_dirty());
    }
    // Teardown restores the graph's original state.
    assert_eq!(x.data_token(), None);
    assert_eq!(top.data_token(), None);
    assert!(!x.always_dirty());
    assert!(!top.always_dirty());
}

#[test]
fn test_device_mode_requires_backend() {
    let p = Parameter::new("p", 1.0);
    let result = Engine::with_mode(p, EvalMode::Device, None);
    assert!(matches!(result, Err(Error::DeviceUnavailable)));
}

#[test]
fn test_cross_device_crossing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let rows: Vec<f64> = (0..1024).map(|i| i as f64).collect();
    let x = DataVector::new("x");
    let s = Parameter::new("s", 2.0);
    // y runs on the device; z is host-only and reads y's mirror.
    let y = Mul::new("y", x.clone(), s.clone());
    let y_for_body = y.clone() as ArgRef;
    let z = TestNode::new(
        "z",
        "HostOnlyOp",
        vec![y.clone() as ArgRef],
        Capabilities::host_only(),
        move |out, data| {
            let input = data
                .get(y_for_body.as_ref())
                .ok_or_else(|| KernelError::unbound(y_for_body.id()))?;
            for (slot, &v) in out.iter_mut().zip(input.as_slice()) {
                *slot = v + 1.0;
            }
            Ok(())
        },
    );

    let backend = SoftwareDevice::new();
    let mut engine = Engine::with_backend(z.clone(), backend).unwrap();
    let data = MemoryData::new().with_column("x", rows.clone());
    bind(&mut engine, &data);

    let y_info = engine
        .nodes
        .iter()
        .find(|info| info.arg.id().as_str() == "y")
        .unwrap();
    assert!(y_info.computes_on_device());
    assert!(y_info.copy_after_evaluation);

    assert_eq!(engine.get_val().unwrap(), 1.0); // 0*2 + 1

    // Both sides hold y's span after the evaluation.
    let host_side = engine.data_host.at(y.as_ref()).unwrap();
    let device_side = engine.data_device.at(y.as_ref()).unwrap();
    assert_eq!(host_side.len(), 1024);
    assert_eq!(device_side.len(), 1024);
    assert_eq!(host_side.as_slice()[3], 6.0);
    assert_eq!(device_side.as_slice()[3], 6.0);

    // And z saw the host-visible mirror.
    let values = engine.get_values().unwrap();
    assert_eq!(values.len(), 1024);
    assert_eq!(values[1023], 1023.0 * 2.0 + 1.0);
}

#[test]
fn test_cross_mode_agreement() {
    let build = || {
        let x = DataVector::new("x");
        let s = Parameter::new("s", 0.5);
        let shifted = Add::new("shifted", x.clone(), s.clone());
        let logged = NegLog::new("logged", shifted);
        Sum::new("nll", logged) as ArgRef
    };
    let data = MemoryData::new().with_column("x", vec![1.0, 2.0, 3.0, 4.0]);

    let mut host = Engine::new(build()).unwrap();
    bind(&mut host, &data);
    let host_val = host.get_val().unwrap();

    let mut device = Engine::with_backend(build(), SoftwareDevice::new()).unwrap();
    bind(&mut device, &data);
    let device_val = device.get_val().unwrap();

    assert!((host_val - device_val).abs() < 1e-12);
}

#[test]
fn test_device_mode_scalar_graph_allocates_no_device_buffers() {
    let a = Parameter::new("a", 3.0);
    let b = Parameter::new("b", 4.0);
    let top = Add::new("top", a, b);

    let mut engine = Engine::with_backend(top, SoftwareDevice::new()).unwrap();
    assert_eq!(engine.get_val().unwrap(), 7.0);
    assert_eq!(engine.buffers.device_allocations(), 0);
}

#[test]
fn test_device_mode_reducer_chain() {
    let x = DataVector::new("x");
    let s = Parameter::new("s", 2.0);
    let y = Mul::new("y", x.clone(), s.clone());
    let top = Sum::new("top", y.clone());

    let mut engine = Engine::with_backend(top.clone(), SoftwareDevice::new()).unwrap();
    let data = MemoryData::new().with_column("x", vec![1.0, 2.0, 3.0, 4.0]);
    bind(&mut engine, &data);

    assert_eq!(engine.get_val().unwrap(), 20.0);
    s.set_val(0.5);
    // Device mode has no dirty tracking; every evaluation recomputes.
    assert_eq!(engine.get_val().unwrap(), 5.0);
}

#[test]
fn test_device_kernel_failure_leaves_engine_usable() {
    let fail = Arc::new(AtomicBool::new(true));
    let x = DataVector::new("x");
    let body_fail = fail.clone();
    let x_for_body = x.clone();
    let flaky = TestNode::new(
        "flaky",
        "Flaky",
        vec![x.clone() as ArgRef],
        Capabilities::batched(),
        move |out, data| {
            if body_fail.load(Ordering::Relaxed) {
                return Err(KernelError::new("injected device failure"));
            }
            let input = data
                .get(x_for_body.as_ref())
                .ok_or_else(|| KernelError::unbound(x_for_body.id()))?;
            for (slot, &v) in out.iter_mut().zip(input.as_slice()) {
                *slot = v * 3.0;
            }
            Ok(())
        },
    );
    let top = Sum::new("top", flaky.clone());

    let mut engine = Engine::with_backend(top, SoftwareDevice::new()).unwrap();
    let data = MemoryData::new().with_column("x", vec![1.0, 2.0]);
    bind(&mut engine, &data);

    match engine.get_val() {
        Err(Error::Kernel { node, .. }) => assert_eq!(node.as_str(), "flaky"),
        other => panic!("expected kernel failure, got {other:?}"),
    }

    fail.store(false, Ordering::Relaxed);
    assert_eq!(engine.get_val().unwrap(), 9.0);
}

#[test]
fn test_zero_row_dataset() {
    let x = DataVector::new("x");
    let s = Parameter::new("s", 2.0);
    let y = Mul::new("y", x.clone(), s.clone());
    let top = Mean::new("top", y.clone());

    let mut engine = Engine::new(top.clone()).unwrap();
    let data = MemoryData::new().with_column("x", Vec::new());
    bind(&mut engine, &data);

    // Kernels receive empty spans and must not fault.
    assert_eq!(engine.get_val().unwrap(), 0.0);
}

#[test]
fn test_rebinding_a_dataset_resets_state() {
    let x = DataVector::new("x");
    let top = Sum::new("top", x.clone());

    let mut engine = Engine::new(top.clone()).unwrap();
    bind(&mut engine, &MemoryData::new().with_column("x", vec![1.0, 2.0]));
    assert_eq!(engine.get_val().unwrap(), 3.0);

    bind(
        &mut engine,
        &MemoryData::new().with_column("x", vec![5.0, 6.0, 7.0]),
    );
    assert_eq!(engine.get_val().unwrap(), 18.0);
}

#[test]
fn test_topological_invariant_on_engine_order() {
    let x = DataVector::new("x");
    let s = Parameter::new("s", 1.0);
    let y = Mul::new("y", x.clone(), s.clone());
    let top = Sum::new("top", y);

    let engine = Engine::new(top.clone()).unwrap();
    for info in &engine.nodes {
        for &server in &info.server_infos {
            assert!(server < info.i_node);
        }
    }
    assert_eq!(
        engine.nodes.last().unwrap().arg.id().as_str(),
        "top"
    );
}
