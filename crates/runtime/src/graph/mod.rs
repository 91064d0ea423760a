//! Graph preparation: ordering, edge caching, tokens, and sizes.
//!
//! Given the value-reachable set of a top node, this module produces the
//! engine's working representation: a topologically ordered vector of
//! [`NodeInfo`]s with mutual server/client index edges, compact data tokens
//! installed on the graph, and (once a dataset is bound) each node's output
//! size.

mod info;
mod topology;

pub(crate) use info::NodeInfo;
pub use topology::topological_order;

use indexmap::IndexMap;

use batchfit_foundation::{ArgId, ArgRef};

use crate::dataset::DataSpans;
use crate::error::{Error, Result};

/// Build the ordered NodeInfo vector for `order` (already topological).
///
/// Installs data tokens on every non-parameter node (the token is the
/// node's topological position) and syncs tokens onto de-duplicated
/// aliases.
pub(crate) fn build_node_infos(order: Vec<ArgRef>) -> Vec<NodeInfo> {
    let mut position: IndexMap<ArgId, usize> = IndexMap::with_capacity(order.len());
    let mut nodes: Vec<NodeInfo> = Vec::with_capacity(order.len());

    for (i, arg) in order.into_iter().enumerate() {
        position.insert(arg.id().clone(), i);
        let info = NodeInfo::new(arg, i);
        if !info.is_variable {
            info.arg.set_data_token(Some(i));
        }
        nodes.push(info);
    }

    for i in 0..nodes.len() {
        let mut servers = Vec::with_capacity(nodes[i].arg.servers().len());
        for server in nodes[i].arg.servers() {
            let s = position[server.id()];
            if !servers.contains(&s) {
                servers.push(s);
            }
        }
        for &s in &servers {
            nodes[s].client_infos.push(i);
        }
        nodes[i].server_infos = servers;
    }

    sync_data_tokens(&nodes);
    nodes
}

/// Propagate data tokens onto server aliases.
///
/// Graph providers may hand out distinct objects sharing one identity; the
/// ordered set keeps only the first. Any alias still reachable through a
/// client's server list receives the canonical node's token so kernels
/// resolve it to the same slot.
pub(crate) fn sync_data_tokens(nodes: &[NodeInfo]) {
    let tokens: IndexMap<&ArgId, Option<usize>> = nodes
        .iter()
        .map(|info| (info.arg.id(), info.arg.data_token()))
        .collect();

    for info in nodes {
        for server in info.arg.servers() {
            let Some(token) = tokens.get(server.id()).copied().flatten() else {
                continue;
            };
            if server.data_token() != Some(token) {
                server.set_data_token(Some(token));
            }
        }
    }
}

/// Determine each node's output size from the bound dataset.
///
/// A leaf bound by the dataset takes its span length. Every other node is
/// scalar unless some server is non-scalar, in which case all non-scalar
/// servers must agree on a common size; reducers collapse back to one
/// element regardless.
pub(crate) fn propagate_output_sizes(nodes: &mut [NodeInfo], spans: &DataSpans) -> Result<()> {
    for i in 0..nodes.len() {
        let size = if let Some(column) = spans.get(nodes[i].arg.id()) {
            column.len()
        } else {
            let mut size = 1usize;
            for k in 0..nodes[i].server_infos.len() {
                let server_size = nodes[nodes[i].server_infos[k]].output_size;
                if server_size == 1 {
                    continue;
                }
                if size == 1 {
                    size = server_size;
                } else if size != server_size {
                    return Err(Error::SizeMismatch {
                        node: nodes[i].arg.id().clone(),
                        expected: size,
                        found: server_size,
                    });
                }
            }
            if nodes[i].arg.capabilities().reducer {
                1
            } else {
                size
            }
        };
        nodes[i].output_size = size;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use batchfit_foundation::args::{Add, DataVector, Mean, Parameter};
    use batchfit_foundation::{value_reachable, ArgRef, Argument};

    use super::*;

    fn prepared(top: ArgRef) -> Vec<NodeInfo> {
        build_node_infos(topological_order(value_reachable(&top)).unwrap())
    }

    #[test]
    fn test_edges_are_mutual() {
        let a = Parameter::new("a", 1.0);
        let b = Parameter::new("b", 2.0);
        let top: ArgRef = Add::new("top", a.clone(), b.clone());

        let nodes = prepared(top);
        let top_idx = nodes.len() - 1;
        assert_eq!(nodes[top_idx].server_infos.len(), 2);
        for &s in &nodes[top_idx].server_infos {
            assert_eq!(nodes[s].client_infos, vec![top_idx]);
        }
    }

    #[test]
    fn test_tokens_skip_parameters() {
        let a = Parameter::new("a", 1.0);
        let x = DataVector::new("x");
        let top: ArgRef = Add::new("top", a.clone(), x.clone());

        let nodes = prepared(top);
        for info in &nodes {
            if info.is_variable {
                assert_eq!(info.arg.data_token(), None);
            } else {
                assert_eq!(info.arg.data_token(), Some(info.i_node));
            }
        }
    }

    #[test]
    fn test_size_propagation_and_reducers() {
        let x = DataVector::new("x");
        let s = Parameter::new("s", 2.0);
        let y = Add::new("y", x.clone(), s.clone());
        let top: ArgRef = Mean::new("top", y.clone());

        let mut nodes = prepared(top);
        let mut spans = DataSpans::new();
        spans.insert(x.id().clone(), vec![1.0, 2.0, 3.0]);
        propagate_output_sizes(&mut nodes, &spans).unwrap();

        let size_of = |name: &str| {
            nodes
                .iter()
                .find(|n| n.arg.id().as_str() == name)
                .unwrap()
                .output_size
        };
        assert_eq!(size_of("x"), 3);
        assert_eq!(size_of("s"), 1);
        assert_eq!(size_of("y"), 3);
        assert_eq!(size_of("top"), 1);
    }

    #[test]
    fn test_size_mismatch_is_detected() {
        let x = DataVector::new("x");
        let z = DataVector::new("z");
        let top: ArgRef = Add::new("top", x.clone(), z.clone());

        let mut nodes = prepared(top);
        let mut spans = DataSpans::new();
        spans.insert(x.id().clone(), vec![1.0, 2.0, 3.0]);
        spans.insert(z.id().clone(), vec![1.0, 2.0]);
        let result = propagate_output_sizes(&mut nodes, &spans);
        assert!(matches!(result, Err(Error::SizeMismatch { .. })));
    }
}
