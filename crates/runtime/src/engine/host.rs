//! Host-only fast path: dirty propagation and minimal recompute.
//!
//! One pass in topological order per evaluation. A parameter whose change
//! counter moved invalidates its clients and republishes its value; a
//! derived node recomputes only if some ancestor marked it dirty. Because
//! clients are marked dirty *before* their servers recompute and nodes are
//! visited in topological order, a single pass suffices.

use crate::error::Result;

use super::Engine;

impl Engine {
    pub(super) fn eval_host(&mut self) -> Result<f64> {
        for i in 0..self.nodes.len() {
            if self.nodes[i].from_dataset {
                // Bound spans are already published.
                continue;
            }
            if self.nodes[i].is_variable {
                self.process_variable(i)?;
            } else if self.nodes[i].is_dirty {
                self.set_clients_dirty(i);
                self.compute_host_node(i)?;
                self.nodes[i].is_dirty = false;
            }
        }

        let top = self.nodes.last().expect("graph has at least one node");
        Ok(self.data_host.at(top.arg.as_ref())?.first())
    }

    /// Re-publish a parameter leaf if its counter moved since the last
    /// evaluation.
    fn process_variable(&mut self, i: usize) -> Result<()> {
        let counter = self.nodes[i].arg.value_reset_counter();
        if self.nodes[i].last_set_val_count == counter {
            return Ok(());
        }
        self.nodes[i].last_set_val_count = counter;
        self.set_clients_dirty(i);
        self.compute_host_node(i)?;
        self.nodes[i].is_dirty = false;
        Ok(())
    }
}
