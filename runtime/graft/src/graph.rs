use ahash::{HashMap, HashMapExt};

use crate::component::entry::{BindingDeps, CreateFn, ObjectPtr};
use crate::type_info::TypeId;

/// A cursor into the binding graph of one normalized component.
///
/// Dependency edges are resolved to cursors during graph construction, so the
/// injector's hot path never goes back through the type-id lookup map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(pub(crate) u32);

// Edge target standing in for a dependency with no binding. Such targets only
// survive in normalized components with outstanding requirements, which can
// never be turned into an injector.
const MISSING_TARGET: u32 = u32::MAX;

/// What a graph node holds.
///
/// A terminal node holds the address of an already-constructed object. A
/// non-terminal node holds the callback that will construct it; the injector
/// overwrites the node with the terminal form after the first construction.
#[derive(Debug, Clone, Copy)]
pub enum NodeSlot {
    Terminal(ObjectPtr),
    Create(CreateFn),
}

#[derive(Debug, Clone)]
pub(crate) struct GraphNode {
    type_id: TypeId,
    initial: NodeSlot,
    deps: BindingDeps,
    edges_start: u32,
    edges_len: u32,
}

/// The binding graph in its post-normalization form: contiguous node storage,
/// adjacency lists packed as offsets into one shared edge array, and a
/// type-id lookup map for the entry points.
///
/// Node storage is fixed once built; only the injector's copy of the node
/// slots changes afterwards.
#[derive(Debug, Clone, Default)]
pub struct SemistaticGraph {
    nodes: Vec<GraphNode>,
    edge_targets: Vec<u32>,
    index_of: HashMap<TypeId, NodeIndex>,
}

impl SemistaticGraph {
    /// Build the graph from `(type id, slot, deps)` triples.
    ///
    /// Dependencies without a matching node are wired to a sentinel target
    /// and reported back as the component's requirements.
    pub(crate) fn build(
        bindings: Vec<(TypeId, NodeSlot, BindingDeps)>,
    ) -> (SemistaticGraph, Vec<TypeId>) {
        let mut index_of = HashMap::with_capacity(bindings.len());
        for (position, (type_id, _, _)) in bindings.iter().enumerate() {
            index_of.insert(*type_id, NodeIndex(position as u32));
        }

        let mut missing = Vec::new();
        let mut nodes = Vec::with_capacity(bindings.len());
        let mut edge_targets = Vec::new();
        for (type_id, initial, deps) in bindings {
            let edges_start = edge_targets.len() as u32;
            for dep in deps.iter() {
                match index_of.get(dep) {
                    Some(target) => edge_targets.push(target.0),
                    None => {
                        missing.push(*dep);
                        edge_targets.push(MISSING_TARGET);
                    }
                }
            }
            nodes.push(GraphNode {
                type_id,
                initial,
                deps,
                edges_start,
                edges_len: (edge_targets.len() as u32) - edges_start,
            });
        }
        (
            SemistaticGraph {
                nodes,
                edge_targets,
                index_of,
            },
            missing,
        )
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// The cursor for `type_id`, if it has a node.
    pub fn index_of(&self, type_id: TypeId) -> Option<NodeIndex> {
        self.index_of.get(&type_id).copied()
    }

    pub(crate) fn type_id(&self, node: NodeIndex) -> TypeId {
        self.nodes[node.0 as usize].type_id
    }

    pub(crate) fn initial_slot(&self, node: NodeIndex) -> NodeSlot {
        self.nodes[node.0 as usize].initial
    }

    pub(crate) fn deps(&self, node: NodeIndex) -> &BindingDeps {
        &self.nodes[node.0 as usize].deps
    }

    /// The precomputed target of the `dep_index`-th dependency edge of `node`.
    pub fn dep_target(&self, node: NodeIndex, dep_index: usize) -> Option<NodeIndex> {
        let node = &self.nodes[node.0 as usize];
        debug_assert!((dep_index as u32) < node.edges_len);
        let target = self.edge_targets[node.edges_start as usize + dep_index];
        (target != MISSING_TARGET).then_some(NodeIndex(target))
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = NodeIndex> + use<> {
        (0..self.nodes.len() as u32).map(NodeIndex)
    }

    pub(crate) fn targets(&self, node: NodeIndex) -> impl Iterator<Item = Option<NodeIndex>> + '_ {
        let node = &self.nodes[node.0 as usize];
        let start = node.edges_start as usize;
        self.edge_targets[start..start + node.edges_len as usize]
            .iter()
            .map(|&target| (target != MISSING_TARGET).then_some(NodeIndex(target)))
    }
}
