//! batchfit runtime.
//!
//! This crate evaluates a directed acyclic expression graph of numeric
//! nodes repeatedly during iterative optimization of a scalar objective:
//! prepare the graph once, bind a dataset, then call
//! [`Engine::get_val`] as often as the optimizer needs.
//!
//! # Architecture
//!
//! - [`buffers`] - Pooled host, device, and pinned-host buffers
//! - [`data_map`] - Node-keyed span tables, one per side
//! - [`graph`] - Topological ordering, edge caching, output sizes
//! - [`dataset`] - Dataset extraction contract and an in-memory source
//! - [`device`] - Device backend contract and the software reference backend
//! - [`engine`] - The facade: bind data, evaluate, list parameters
//! - [`error`] - Error types for preparation and evaluation failures
//!
//! # Execution Model
//!
//! The host side is single-threaded and cooperative: one thread drives
//! evaluation and kernels run to completion. In device mode, device work
//! runs concurrently on per-node streams; ordering between streams is
//! established exclusively by recorded completion events, and the host
//! yields briefly whenever no host-runnable node exists.
//!
//! # Example
//!
//! ```
//! use batchfit_foundation::args::{Add, Parameter};
//! use batchfit_runtime::Engine;
//!
//! let a = Parameter::new("a", 3.0);
//! let b = Parameter::new("b", 4.0);
//! let top = Add::new("top", a.clone(), b.clone());
//!
//! let mut engine = Engine::new(top).unwrap();
//! assert_eq!(engine.get_val().unwrap(), 7.0);
//!
//! b.set_val(5.5);
//! assert_eq!(engine.get_val().unwrap(), 8.5);
//! ```

pub mod buffers;
pub mod data_map;
pub mod dataset;
pub mod device;
pub mod engine;
pub mod error;
pub mod graph;

pub use buffers::{Buffer, BufferKind, BufferManager};
pub use data_map::{DataMap, SpanSnapshot};
pub use dataset::{DataOptions, DataSource, DataSpans, MemoryData};
pub use device::{BackendRef, DeviceBackend, SoftwareDevice};
pub use engine::{Engine, EvalMode};
pub use error::{Error, Result};
pub use graph::topological_order;
