//! Node-keyed span tables.
//!
//! A [`DataMap`] records, for one side (host or device), the span each node
//! most recently published, plus the per-node stream configuration used for
//! asynchronous kernels touching that node. The engine keeps one host map
//! and, in device mode, one device map.
//!
//! Kernels resolve their inputs through the map: by the compact data token
//! (the node's topological position) when one is installed, by identity
//! otherwise.

use indexmap::IndexMap;

use batchfit_foundation::{ArgId, Argument, SendSpan, Span, SpanSource};

use crate::device::StreamId;
use crate::error::{Error, Result};

/// Span table for one side of the engine.
#[derive(Default)]
pub struct DataMap {
    slots: Vec<Option<Span>>,
    by_id: IndexMap<ArgId, usize>,
    config: Vec<Option<StreamId>>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the table for `n` nodes, dropping all published spans and
    /// identity bindings. Stream configuration is preserved where it fits.
    pub fn resize(&mut self, n: usize) {
        self.slots = vec![None; n];
        self.by_id.clear();
        self.config.resize(n, None);
    }

    /// Drop every published span, keeping the table size and configuration.
    pub fn clear_spans(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.by_id.clear();
    }

    /// Publish `span` as the current output of the node at `token`.
    pub fn set(&mut self, token: usize, id: &ArgId, span: Span) {
        self.slots[token] = Some(span);
        self.by_id.insert(id.clone(), token);
    }

    /// The published span for `arg`.
    ///
    /// Fails with [`Error::UnboundNode`] if the node has not been published
    /// on this side during the current evaluation.
    pub fn at(&self, arg: &dyn Argument) -> Result<Span> {
        self.lookup(arg).ok_or_else(|| Error::UnboundNode {
            node: arg.id().clone(),
        })
    }

    /// Stream used for asynchronous kernels touching the node at `token`.
    pub fn set_config(&mut self, token: usize, stream: StreamId) {
        if self.config.len() <= token {
            self.config.resize(token + 1, None);
        }
        self.config[token] = Some(stream);
    }

    pub fn config(&self, token: usize) -> Option<StreamId> {
        self.config.get(token).copied().flatten()
    }

    fn lookup(&self, arg: &dyn Argument) -> Option<Span> {
        if let Some(token) = arg.data_token() {
            if let Some(span) = self.slots.get(token).copied().flatten() {
                return Some(span);
            }
        }
        let token = self.by_id.get(arg.id())?;
        self.slots.get(*token).copied().flatten()
    }
}

impl SpanSource for DataMap {
    fn get(&self, arg: &dyn Argument) -> Option<Span> {
        self.lookup(arg)
    }
}

/// Frozen view of a handful of spans, safe to hand to the backend worker.
///
/// The scheduler snapshots a node's input spans at launch time so the worker
/// never reads the live [`DataMap`] while the host thread mutates it.
pub struct SpanSnapshot {
    entries: Vec<(ArgId, SendSpan)>,
}

impl SpanSnapshot {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, id: ArgId, span: Span) {
        self.entries.push((id, SendSpan(span)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SpanSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanSource for SpanSnapshot {
    fn get(&self, arg: &dyn Argument) -> Option<Span> {
        self.entries
            .iter()
            .find(|(id, _)| id == arg.id())
            .map(|(_, span)| span.0)
    }
}
