use ahash::{HashMap, HashMapExt};

use crate::normalize::normalized::CompressedBindingUndoInfo;
use crate::normalize::{MultibindingRecord, ProcessedBinding};
use crate::component::entry::{CreateFn, Multibinding};
use crate::type_info::TypeId;

/// A compressed-binding hint, keyed (in the owning map) by the concrete type
/// it would hide.
pub(crate) struct CompressionCandidate {
    pub(crate) interface_id: TypeId,
    pub(crate) create_as_interface: CreateFn,
}

/// Filter the compression candidates down to the legal ones and apply them:
/// the interface slot takes over the concrete binding's create callback and
/// dependency list, and the concrete type loses its own node.
///
/// A candidate `(I, C)` is dropped when `C` is still observable on its own:
/// as a dependency of a multibinding, as an exposed type, or as a dependency
/// of any surviving binding other than `I`.
///
/// Returns the undo map, keyed by the hidden concrete type.
pub(crate) fn perform(
    bindings: &mut HashMap<TypeId, ProcessedBinding>,
    mut candidates: HashMap<TypeId, CompressionCandidate>,
    multibinding_records: &[MultibindingRecord],
    exposed_types: &[TypeId],
) -> HashMap<TypeId, CompressedBindingUndoInfo> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    for record in multibinding_records {
        if let Multibinding::ToConstruct { deps, .. } = &record.multibinding {
            for dep in deps.iter() {
                candidates.remove(dep);
            }
        }
    }

    // `C` may be hidden even when `I` is exposed in its place.
    for type_id in exposed_types {
        candidates.remove(type_id);
    }

    let mut observed_elsewhere = Vec::new();
    for (type_id, binding) in bindings.iter() {
        if let ProcessedBinding::ToConstruct { deps, .. } = binding {
            for dep in deps.iter() {
                if let Some(candidate) = candidates.get(dep)
                    && candidate.interface_id != *type_id
                {
                    observed_elsewhere.push(*dep);
                }
            }
        }
    }
    for concrete_id in observed_elsewhere {
        candidates.remove(&concrete_id);
    }

    // Two chained candidates (I -> C, C -> X) cannot exist: the concrete side
    // of a candidate is always a constructor or provider binding, never an
    // interface binding.

    let mut undo = HashMap::with_capacity(candidates.len());
    for (concrete_id, candidate) in candidates {
        let Some(ProcessedBinding::ToConstruct {
            create: interface_create,
            deps: interface_deps,
            ..
        }) = bindings.get(&candidate.interface_id)
        else {
            // The hint's interface binding never materialized; nothing to fuse.
            continue;
        };
        let (interface_create, interface_deps) = (*interface_create, interface_deps.clone());
        let Some(ProcessedBinding::ToConstruct {
            create: concrete_create,
            deps: concrete_deps,
            allocation,
        }) = bindings.get(&concrete_id)
        else {
            continue;
        };
        let (concrete_create, concrete_deps, allocation) =
            (*concrete_create, concrete_deps.clone(), *allocation);

        tracing::debug!(
            interface = %candidate.interface_id,
            concrete = %concrete_id,
            "performing binding compression",
        );
        undo.insert(
            concrete_id,
            CompressedBindingUndoInfo {
                interface_id: candidate.interface_id,
                interface_create,
                interface_deps,
                concrete_create,
                concrete_deps: concrete_deps.clone(),
            },
        );
        // The fused create constructs the concrete value and stores the
        // upcast slot, so it inherits the concrete binding's dependencies.
        bindings.insert(
            candidate.interface_id,
            ProcessedBinding::ToConstruct {
                create: candidate.create_as_interface,
                deps: concrete_deps,
                allocation,
            },
        );
        bindings.remove(&concrete_id);
    }
    undo
}
