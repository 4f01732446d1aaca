use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::errors::FatalError;
use crate::graph::{NodeSlot, SemistaticGraph};
use crate::type_info::TypeId;

/// Verify that the graph, projected onto its non-terminal nodes, is acyclic.
///
/// Terminal nodes have no outgoing edges, so they can never take part in a
/// cycle; the projection falls out for free. A node depending on itself is
/// reported as a self-loop rather than a one-element cycle.
pub(crate) fn check(graph: &SemistaticGraph) -> Result<(), FatalError> {
    let mut dep_graph: DiGraph<TypeId, ()> = DiGraph::with_capacity(graph.len(), graph.len());
    let petgraph_indices: Vec<_> = graph
        .indices()
        .map(|node| dep_graph.add_node(graph.type_id(node)))
        .collect();

    for node in graph.indices() {
        if let NodeSlot::Create(_) = graph.initial_slot(node) {
            for target in graph.targets(node).flatten() {
                if target == node {
                    return Err(FatalError::SelfLoop(graph.type_id(node)));
                }
                dep_graph.add_edge(
                    petgraph_indices[node.0 as usize],
                    petgraph_indices[target.0 as usize],
                    (),
                );
            }
        }
    }

    for component in tarjan_scc(&dep_graph) {
        if component.len() > 1 {
            return Err(FatalError::DependencyCycle {
                cycle: component
                    .into_iter()
                    .map(|index| dep_graph[index])
                    .collect(),
            });
        }
    }
    Ok(())
}
