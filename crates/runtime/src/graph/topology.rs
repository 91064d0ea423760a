//! Topological ordering and cycle detection for graph preparation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use indexmap::IndexMap;

use batchfit_foundation::{ArgId, ArgRef};

use crate::error::{Error, Result};

/// Order `nodes` so that every server precedes its clients, using Kahn's
/// algorithm.
///
/// Ties are broken by discovery index, which keeps the order stable for a
/// given graph provider. Because every node in a value-reachable set is an
/// ancestor of the top node, the top node always comes last.
///
/// Fails with [`Error::CycleDetected`] naming the nodes that could not be
/// ordered.
pub fn topological_order(nodes: Vec<ArgRef>) -> Result<Vec<ArgRef>> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let position: IndexMap<ArgId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id().clone(), i))
        .collect();

    // In-degrees over server edges, de-duplicated per (server, client) pair.
    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let mut seen: Vec<usize> = Vec::new();
        for server in node.servers() {
            let Some(&s) = position.get(server.id()) else {
                continue;
            };
            if seen.contains(&s) {
                continue;
            }
            seen.push(s);
            in_degree[i] += 1;
            dependents[s].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(nodes[i].clone());
        for &client in &dependents[i] {
            in_degree[client] -= 1;
            if in_degree[client] == 0 {
                ready.push(Reverse(client));
            }
        }
    }

    if order.len() != nodes.len() {
        let cycle: Vec<ArgId> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, node)| node.id().clone())
            .collect();
        return Err(Error::CycleDetected { nodes: cycle });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use batchfit_foundation::args::{Add, Parameter};
    use batchfit_foundation::value_reachable;

    use super::*;

    #[test]
    fn test_chain_orders_servers_first() {
        let a = Parameter::new("a", 1.0);
        let b = Parameter::new("b", 2.0);
        let mid = Add::new("mid", a.clone(), b.clone());
        let top: ArgRef = Add::new("top", mid.clone(), a.clone());

        let order = topological_order(value_reachable(&top)).unwrap();
        let ids: Vec<&str> = order.iter().map(|n| n.id().as_str()).collect();

        let pos = |name: &str| ids.iter().position(|&id| id == name).unwrap();
        assert!(pos("a") < pos("mid"));
        assert!(pos("b") < pos("mid"));
        assert!(pos("mid") < pos("top"));
        assert_eq!(*ids.last().unwrap(), "top");
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let a = Parameter::new("a", 1.0);
        let left = Add::new("left", a.clone(), a.clone());
        let right = Add::new("right", a.clone(), a.clone());
        let top: ArgRef = Add::new("top", left, right);

        let order = topological_order(value_reachable(&top)).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.last().unwrap().id().as_str(), "top");
    }

    /// Test-only node; a cyclic graph cannot be built from the argument
    /// library's constructors, so this one takes its servers verbatim.
    struct RawNode {
        id: ArgId,
        servers: Vec<ArgRef>,
    }

    impl RawNode {
        fn new(id: &str, servers: Vec<ArgRef>) -> Arc<Self> {
            Arc::new(Self {
                id: ArgId::from(id),
                servers,
            })
        }
    }

    impl batchfit_foundation::Argument for RawNode {
        fn id(&self) -> &ArgId {
            &self.id
        }
        fn class_name(&self) -> &'static str {
            "RawNode"
        }
        fn servers(&self) -> &[ArgRef] {
            &self.servers
        }
        fn capabilities(&self) -> batchfit_foundation::Capabilities {
            batchfit_foundation::Capabilities::host_only()
        }
        fn kind(&self) -> batchfit_foundation::ArgKind {
            batchfit_foundation::ArgKind::Derived
        }
        fn compute(
            &self,
            _out: &mut [f64],
            _data: &dyn batchfit_foundation::SpanSource,
        ) -> std::result::Result<(), batchfit_foundation::KernelError> {
            Ok(())
        }
        fn data_token(&self) -> Option<usize> {
            None
        }
        fn set_data_token(&self, _token: Option<usize>) {}
        fn always_dirty(&self) -> bool {
            false
        }
        fn set_always_dirty(&self, _on: bool) -> bool {
            false
        }
        fn eval_count(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_cycle_is_detected() {
        // Two nodes referencing each other by identity: `a` reads `b`, and
        // `b` reads a node whose identity is also `a`.
        let b_placeholder = RawNode::new("b", Vec::new());
        let a = RawNode::new("a", vec![b_placeholder as ArgRef]);
        let b = RawNode::new("b", vec![a.clone() as ArgRef]);

        let result = topological_order(vec![a as ArgRef, b as ArgRef]);
        assert!(matches!(result, Err(Error::CycleDetected { .. })));
    }
}
