use ahash::HashMap;
use indexmap::IndexMap;

use crate::arena::FixedSizeAllocatorData;
use crate::component::entry::{
    BindingDeps, CreateFn, MultibindingCreateFn, MultibindingVectorFn, ObjectPtr,
};
use crate::graph::SemistaticGraph;
use crate::type_info::TypeId;

/// One normalized multibinding element: either still to construct, or the
/// address of the constructed object.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MultibindingState {
    Pending(MultibindingCreateFn),
    Constructed(ObjectPtr),
}

/// Every multibinding contribution for one type, plus the callback that
/// assembles the aggregated vector once all elements exist.
#[derive(Debug, Clone)]
pub(crate) struct NormalizedMultibindingSet {
    pub(crate) elems: Vec<MultibindingState>,
    pub(crate) create_vector: MultibindingVectorFn,
}

/// What it takes to undo one applied binding compression: the original
/// interface and concrete bindings, keyed (in the owning map) by the hidden
/// concrete type.
#[derive(Debug, Clone)]
pub(crate) struct CompressedBindingUndoInfo {
    pub(crate) interface_id: TypeId,
    pub(crate) interface_create: CreateFn,
    pub(crate) interface_deps: BindingDeps,
    pub(crate) concrete_create: CreateFn,
    pub(crate) concrete_deps: BindingDeps,
}

/// The read-only result of normalizing a component: the binding graph, the
/// multibinding sets, the exact arena sizing, the compression undo map, and
/// the residual requirements.
///
/// A normalized component can be shared (behind an `Arc`) by any number of
/// injectors; each injector copies the node slots and multibinding states it
/// will mutate.
#[derive(Debug)]
pub struct NormalizedComponent {
    pub(crate) graph: SemistaticGraph,
    pub(crate) multibindings: IndexMap<TypeId, NormalizedMultibindingSet>,
    pub(crate) allocator_data: FixedSizeAllocatorData,
    pub(crate) compression_undo: HashMap<TypeId, CompressedBindingUndoInfo>,
    pub(crate) exposed: Vec<TypeId>,
    pub(crate) requirements: Vec<TypeId>,
}

// A normalized component is immutable. The raw pointers it holds are the
// addresses of instance bindings, which the front-end requires to reference
// thread-safe data.
unsafe impl Send for NormalizedComponent {}
unsafe impl Sync for NormalizedComponent {}

impl NormalizedComponent {
    /// The types this component consumes from outside: every dependency (and
    /// exposed type) that no binding satisfies. Non-empty requirements must
    /// be supplied by an overlay before an injector can be built.
    pub fn requirements(&self) -> &[TypeId] {
        &self.requirements
    }

    /// The types the final injector must be able to serve.
    pub fn exposed_types(&self) -> &[TypeId] {
        &self.exposed
    }

    /// `true` if `type_id` has a (non-multibinding) binding.
    pub fn has_binding(&self, type_id: TypeId) -> bool {
        self.graph.index_of(type_id).is_some()
    }

    /// The number of distinct bound types.
    pub fn binding_count(&self) -> usize {
        self.graph.len()
    }

    /// The number of multibinding contributions declared for `type_id`.
    pub fn multibinding_len(&self, type_id: TypeId) -> usize {
        self.multibindings
            .get(&type_id)
            .map_or(0, |set| set.elems.len())
    }

    /// The arena sizing computed during normalization.
    pub fn allocator_data(&self) -> &FixedSizeAllocatorData {
        &self.allocator_data
    }

    /// `true` if the binding for `interface_id` was fused with a concrete
    /// binding during normalization.
    pub fn was_compressed(&self, concrete_id: TypeId) -> bool {
        self.compression_undo.contains_key(&concrete_id)
    }
}
