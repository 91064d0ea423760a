//! Dataset extraction: the collaborator that turns raw observations into
//! per-node spans.
//!
//! The engine consumes a [`DataSource`]; binding a dataset means asking the
//! source for a [`DataSpans`] map under a set of [`DataOptions`] (named
//! range, optional partition tag, weight policies) and publishing the
//! resulting columns onto the graph's dataset leaves.
//!
//! [`MemoryData`] is a small in-memory implementation sufficient for tests
//! and modest fits: named f64 columns with optional per-row weights, named
//! row masks ("ranges"), a partition tag per column, and scalar global
//! observables.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use batchfit_foundation::ArgId;

use crate::error::Result;

/// Extraction policies for one dataset bind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataOptions {
    /// Named row mask to select; `None` selects every row.
    pub range: Option<String>,
    /// Restrict to columns carrying this partition tag (untagged columns
    /// are always included).
    pub partition: Option<String>,
    /// Drop rows whose weight is exactly zero.
    pub skip_zero_weights: bool,
    /// Publish the dataset's scalar global observables as spans.
    pub take_global_observables_from_data: bool,
}

/// Owned column storage keyed by node identity.
///
/// The engine keeps the bound `DataSpans` alive for as long as the dataset
/// is current, so the spans it publishes into the data maps stay valid
/// across evaluations.
#[derive(Debug, Default)]
pub struct DataSpans {
    columns: IndexMap<ArgId, Vec<f64>>,
}

impl DataSpans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ArgId, values: Vec<f64>) {
        self.columns.insert(id, values);
    }

    pub fn get(&self, id: &ArgId) -> Option<&[f64]> {
        self.columns.get(id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArgId, &[f64])> {
        self.columns.iter().map(|(id, v)| (id, v.as_slice()))
    }
}

/// Produces per-node spans for the engine to bind.
pub trait DataSource {
    fn spans(&self, options: &DataOptions) -> Result<DataSpans>;
}

struct Column {
    values: Vec<f64>,
    partition: Option<String>,
}

/// In-memory dataset with named columns.
#[derive(Default)]
pub struct MemoryData {
    columns: IndexMap<String, Column>,
    weights: Option<Vec<f64>>,
    ranges: IndexMap<String, Vec<bool>>,
    globals: IndexMap<String, f64>,
    rows: Option<usize>,
}

impl MemoryData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observation column. All columns must share one row count.
    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Self {
        self.check_rows(values.len());
        self.columns.insert(
            name.to_string(),
            Column {
                values,
                partition: None,
            },
        );
        self
    }

    /// Add a column visible only under the given partition tag.
    pub fn with_partitioned_column(mut self, name: &str, tag: &str, values: Vec<f64>) -> Self {
        self.check_rows(values.len());
        self.columns.insert(
            name.to_string(),
            Column {
                values,
                partition: Some(tag.to_string()),
            },
        );
        self
    }

    /// Attach per-row weights.
    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.check_rows(weights.len());
        self.weights = Some(weights);
        self
    }

    /// Register a named row mask.
    pub fn with_range(mut self, name: &str, mask: Vec<bool>) -> Self {
        self.check_rows(mask.len());
        self.ranges.insert(name.to_string(), mask);
        self
    }

    /// Register a scalar global observable.
    pub fn with_global(mut self, name: &str, value: f64) -> Self {
        self.globals.insert(name.to_string(), value);
        self
    }

    fn check_rows(&mut self, len: usize) {
        match self.rows {
            None => self.rows = Some(len),
            Some(rows) => assert_eq!(rows, len, "all columns must share one row count"),
        }
    }

    fn row_mask(&self, options: &DataOptions) -> Vec<bool> {
        let rows = self.rows.unwrap_or(0);
        let mut mask = match options.range.as_ref().and_then(|r| self.ranges.get(r)) {
            Some(named) => named.clone(),
            None => vec![true; rows],
        };
        if options.skip_zero_weights {
            if let Some(weights) = &self.weights {
                for (slot, &w) in mask.iter_mut().zip(weights) {
                    if w == 0.0 {
                        *slot = false;
                    }
                }
            }
        }
        mask
    }
}

impl DataSource for MemoryData {
    fn spans(&self, options: &DataOptions) -> Result<DataSpans> {
        let mask = self.row_mask(options);

        let mut out = DataSpans::new();
        for (name, column) in &self.columns {
            if let (Some(wanted), Some(tag)) = (&options.partition, &column.partition) {
                if wanted != tag {
                    continue;
                }
            }
            let values: Vec<f64> = column
                .values
                .iter()
                .zip(&mask)
                .filter(|(_, &keep)| keep)
                .map(|(&v, _)| v)
                .collect();
            out.insert(ArgId::from(name.as_str()), values);
        }

        if options.take_global_observables_from_data {
            for (name, &value) in &self.globals {
                out.insert(ArgId::from(name.as_str()), vec![value]);
            }
        }

        Ok(out)
    }
}
