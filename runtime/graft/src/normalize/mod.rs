//! The one-shot pass from a component's declaration log to a resolvable
//! binding graph: lazy-component expansion, deduplication, binding
//! compression, multibinding collection, arena sizing, and cycle checking.

mod compression;
#[cfg(not(feature = "no_loop_check"))]
mod loop_check;
pub(crate) mod normalized;

pub use normalized::NormalizedComponent;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::arena::FixedSizeAllocatorData;
use crate::component::ComponentStorage;
use crate::component::entry::{
    Allocation, BindingDeps, ComponentStorageEntry, CreateFn, LazyComponent, Multibinding,
    MultibindingVectorFn, ObjectPtr, no_deps,
};
use crate::errors::{FatalError, fatal};
use crate::graph::{NodeSlot, SemistaticGraph};
use crate::normalize::compression::CompressionCandidate;
use crate::normalize::normalized::{
    CompressedBindingUndoInfo, MultibindingState, NormalizedMultibindingSet,
};
use crate::type_info::TypeId;

/// Normalize `storage` into a resolvable form, for the injector(s) serving
/// `exposed_types`. Fatal on any declaration error.
pub fn normalize(storage: ComponentStorage, exposed_types: &[TypeId]) -> NormalizedComponent {
    match try_normalize(storage, exposed_types) {
        Ok(normalized) => normalized,
        Err(error) => fatal(error),
    }
}

/// Fallible variant of [`normalize`]. On error, no partially-normalized form
/// is produced.
pub fn try_normalize(
    storage: ComponentStorage,
    exposed_types: &[TypeId],
) -> Result<NormalizedComponent, FatalError> {
    let mut allocator_data = FixedSizeAllocatorData::default();
    let output = process_entries(storage.release(), None, &mut allocator_data, true)?;
    let ProcessOutput {
        mut bindings,
        compression_candidates,
        multibindings,
    } = output;

    let compression_undo = compression::perform(
        &mut bindings,
        compression_candidates,
        &multibindings,
        exposed_types,
    );

    let normalized = build_component(
        bindings,
        multibindings,
        IndexMap::new(),
        allocator_data,
        compression_undo,
        exposed_types.to_vec(),
    );

    #[cfg(not(feature = "no_loop_check"))]
    loop_check::check(&normalized.graph)?;

    tracing::debug!(
        bindings = normalized.graph.len(),
        multibinding_types = normalized.multibindings.len(),
        requirements = normalized.requirements.len(),
        "component normalized",
    );
    Ok(normalized)
}

/// Normalize `overlay` against a shared `base` and merge the two into the
/// private form of one injector: duplicates are checked for consistency
/// against the base, compressions whose hidden concrete type the overlay
/// observes are undone, and multibinding sets are merged.
pub(crate) fn try_normalize_overlay(
    base: &NormalizedComponent,
    overlay: ComponentStorage,
) -> Result<NormalizedComponent, FatalError> {
    let mut allocator_data = base.allocator_data.clone();
    // Compression hints in the overlay are ignored: compressing against a
    // shared, already-built base cannot be undone later.
    let output = process_entries(overlay.release(), Some(base), &mut allocator_data, false)?;
    let ProcessOutput {
        bindings: new_bindings,
        multibindings: new_multibindings,
        ..
    } = output;

    let mut merged: HashMap<TypeId, ProcessedBinding> = HashMap::with_capacity(
        base.graph.len() + new_bindings.len(),
    );
    for node in base.graph.indices() {
        let binding = match base.graph.initial_slot(node) {
            NodeSlot::Terminal(object) => ProcessedBinding::Constructed { object },
            NodeSlot::Create(create) => ProcessedBinding::ToConstruct {
                create,
                deps: base.graph.deps(node).clone(),
                allocation: Allocation::Unknown,
            },
        };
        merged.insert(base.graph.type_id(node), binding);
    }

    // A base compression must be undone when the overlay binds something that
    // observes the hidden concrete type directly.
    let mut compressions_to_undo: HashSet<TypeId> = HashSet::new();
    for (type_id, binding) in &new_bindings {
        if let ProcessedBinding::ToConstruct { deps, .. } = binding {
            for dep in deps.iter() {
                if let Some(info) = base.compression_undo.get(dep)
                    && info.interface_id != *type_id
                {
                    compressions_to_undo.insert(*dep);
                }
            }
        }
    }
    for record in &new_multibindings {
        if let Multibinding::ToConstruct { deps, .. } = &record.multibinding {
            for dep in deps.iter() {
                if base.compression_undo.contains_key(dep) {
                    compressions_to_undo.insert(*dep);
                }
            }
        }
    }
    for concrete_id in compressions_to_undo {
        let info = &base.compression_undo[&concrete_id];
        tracing::debug!(
            interface = %info.interface_id,
            concrete = %concrete_id,
            "undoing binding compression",
        );
        // Both re-created bindings are already covered by the base's
        // allocator data, hence the `Unknown` allocation tag.
        merged.insert(
            concrete_id,
            ProcessedBinding::ToConstruct {
                create: info.concrete_create,
                deps: info.concrete_deps.clone(),
                allocation: Allocation::Unknown,
            },
        );
        merged.insert(
            info.interface_id,
            ProcessedBinding::ToConstruct {
                create: info.interface_create,
                deps: info.interface_deps.clone(),
                allocation: Allocation::Unknown,
            },
        );
    }

    for (type_id, binding) in new_bindings {
        merged.insert(type_id, binding);
    }

    let normalized = build_component(
        merged,
        new_multibindings,
        base.multibindings.clone(),
        allocator_data,
        HashMap::new(),
        base.exposed.clone(),
    );

    #[cfg(not(feature = "no_loop_check"))]
    loop_check::check(&normalized.graph)?;

    Ok(normalized)
}

/// A binding as it sits in the normalization working map.
#[derive(Debug, Clone)]
pub(crate) enum ProcessedBinding {
    Constructed {
        object: ObjectPtr,
    },
    ToConstruct {
        create: CreateFn,
        deps: BindingDeps,
        allocation: Allocation,
    },
}

/// One collected multibinding contribution, paired with the aggregation
/// callback from its vector-creator sentinel.
pub(crate) struct MultibindingRecord {
    pub(crate) type_id: TypeId,
    pub(crate) multibinding: Multibinding,
    pub(crate) create_vector: MultibindingVectorFn,
}

struct ProcessOutput {
    bindings: HashMap<TypeId, ProcessedBinding>,
    compression_candidates: HashMap<TypeId, CompressionCandidate>,
    multibindings: Vec<MultibindingRecord>,
}

/// The stack-driven pass over the declaration log.
///
/// The log arrives in declaration order and is reversed once onto a work
/// stack, so pops observe entries left to right. Expanding a lazy component
/// pushes an end marker in its place and its entries above it; the marker
/// moves the component from `in_progress` to `fully_expanded` when every
/// entry above it has been consumed.
fn process_entries(
    entries: Vec<ComponentStorageEntry>,
    base: Option<&NormalizedComponent>,
    allocator_data: &mut FixedSizeAllocatorData,
    collect_compression: bool,
) -> Result<ProcessOutput, FatalError> {
    let mut stack = entries;
    stack.reverse();

    let mut bindings: HashMap<TypeId, ProcessedBinding> = HashMap::new();
    let mut compression_candidates: HashMap<TypeId, CompressionCandidate> = HashMap::new();
    let mut multibindings: Vec<MultibindingRecord> = Vec::new();

    let mut fully_expanded: HashSet<LazyComponent> = HashSet::new();
    let mut in_progress: HashSet<LazyComponent> = HashSet::new();
    let mut replacements: HashMap<LazyComponent, LazyComponent> = HashMap::new();

    while let Some(entry) = stack.pop() {
        match entry {
            ComponentStorageEntry::ConstructedBinding { type_id, object } => {
                if let Some(existing) = lookup(base, &bindings, type_id) {
                    match existing {
                        ProcessedBinding::Constructed { object: previous }
                            if previous == object => {}
                        _ => return Err(FatalError::InconsistentBindings(type_id)),
                    }
                    // Duplicate but consistent.
                    continue;
                }
                allocator_data.add_externally_allocated_type(type_id);
                bindings.insert(type_id, ProcessedBinding::Constructed { object });
            }

            ComponentStorageEntry::BindingToConstruct {
                type_id,
                create,
                deps,
                allocation,
            } => {
                if let Some(existing) = lookup(base, &bindings, type_id) {
                    match existing {
                        ProcessedBinding::ToConstruct {
                            create: previous, ..
                        } if previous == create => {}
                        _ => return Err(FatalError::InconsistentBindings(type_id)),
                    }
                    continue;
                }
                match allocation {
                    Allocation::NeedsAllocation => allocator_data.add_type(type_id),
                    Allocation::NoAllocation => {
                        allocator_data.add_externally_allocated_type(type_id)
                    }
                    Allocation::Unknown => {}
                }
                bindings.insert(
                    type_id,
                    ProcessedBinding::ToConstruct {
                        create,
                        deps,
                        allocation,
                    },
                );
            }

            ComponentStorageEntry::CompressedBinding {
                interface_id,
                concrete_id,
                create_as_interface,
            } => {
                if collect_compression {
                    compression_candidates.insert(
                        concrete_id,
                        CompressionCandidate {
                            interface_id,
                            create_as_interface,
                        },
                    );
                }
            }

            ComponentStorageEntry::Multibinding {
                type_id,
                multibinding,
            } => {
                let Some(ComponentStorageEntry::MultibindingVectorCreator {
                    create_vector, ..
                }) = stack.pop()
                else {
                    panic!("multibinding entry without its vector-creator sentinel");
                };
                multibindings.push(MultibindingRecord {
                    type_id,
                    multibinding,
                    create_vector,
                });
            }

            ComponentStorageEntry::MultibindingVectorCreator { create_vector, .. } => {
                let Some(ComponentStorageEntry::Multibinding {
                    type_id,
                    multibinding,
                }) = stack.pop()
                else {
                    panic!("vector-creator sentinel without its multibinding entry");
                };
                multibindings.push(MultibindingRecord {
                    type_id,
                    multibinding,
                    create_vector,
                });
            }

            ComponentStorageEntry::LazyComponent(component) => {
                // Resolve replacements before expansion, transitively; a
                // replacement ring would otherwise expand forever.
                let mut component = component;
                let mut substituted: SmallVec<[LazyComponent; 2]> = SmallVec::new();
                while let Some(replacement) = replacements.get(&component) {
                    if substituted.contains(replacement) {
                        return Err(FatalError::InstallationLoop {
                            component: component.fun_addr(),
                        });
                    }
                    substituted.push(component);
                    component = replacement.clone();
                }

                if fully_expanded.contains(&component) {
                    // Already installed; a second installation is a no-op.
                    continue;
                }
                if !in_progress.insert(component.clone()) {
                    return Err(FatalError::InstallationLoop {
                        component: component.fun_addr(),
                    });
                }
                tracing::trace!(component = component.fun_addr(), "expanding lazy component");
                let expanded = component.install();
                stack.push(ComponentStorageEntry::ExpansionEndMarker(component));
                let mut expanded = expanded.release();
                expanded.reverse();
                stack.extend(expanded);
            }

            ComponentStorageEntry::ExpansionEndMarker(component) => {
                in_progress.remove(&component);
                fully_expanded.insert(component);
            }

            ComponentStorageEntry::ReplacedLazyComponent(replaced) => {
                let Some(ComponentStorageEntry::ReplacementLazyComponent(replacement)) =
                    stack.pop()
                else {
                    panic!("replaced-component entry without its replacement entry");
                };
                if fully_expanded.contains(&replaced) || in_progress.contains(&replaced) {
                    return Err(FatalError::ReplacementAfterInstall {
                        component: replaced.fun_addr(),
                    });
                }
                match replacements.get(&replaced) {
                    Some(previous) if *previous != replacement => {
                        return Err(FatalError::InconsistentReplacement {
                            component: replaced.fun_addr(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        replacements.insert(replaced, replacement);
                    }
                }
            }

            ComponentStorageEntry::ReplacementLazyComponent(_) => {
                panic!("replacement entry without a preceding replaced-component entry");
            }
        }
    }

    debug_assert!(in_progress.is_empty());
    Ok(ProcessOutput {
        bindings,
        compression_candidates,
        multibindings,
    })
}

fn lookup(
    base: Option<&NormalizedComponent>,
    bindings: &HashMap<TypeId, ProcessedBinding>,
    type_id: TypeId,
) -> Option<ProcessedBinding> {
    if let Some(binding) = bindings.get(&type_id) {
        return Some(binding.clone());
    }
    let base = base?;
    let node = base.graph.index_of(type_id)?;
    Some(match base.graph.initial_slot(node) {
        NodeSlot::Terminal(object) => ProcessedBinding::Constructed { object },
        NodeSlot::Create(create) => ProcessedBinding::ToConstruct {
            create,
            deps: base.graph.deps(node).clone(),
            allocation: Allocation::Unknown,
        },
    })
}

/// Assemble the normalized component: deterministic node order, resolved
/// edges, merged multibinding sets, and the residual requirements.
fn build_component(
    bindings: HashMap<TypeId, ProcessedBinding>,
    multibinding_records: Vec<MultibindingRecord>,
    base_multibindings: IndexMap<TypeId, NormalizedMultibindingSet>,
    mut allocator_data: FixedSizeAllocatorData,
    compression_undo: HashMap<TypeId, CompressedBindingUndoInfo>,
    exposed: Vec<TypeId>,
) -> NormalizedComponent {
    let mut nodes: Vec<(TypeId, NodeSlot, BindingDeps)> = bindings
        .into_iter()
        .map(|(type_id, binding)| match binding {
            ProcessedBinding::Constructed { object } => {
                (type_id, NodeSlot::Terminal(object), no_deps())
            }
            ProcessedBinding::ToConstruct { create, deps, .. } => {
                (type_id, NodeSlot::Create(create), deps)
            }
        })
        .collect();
    // Descriptor-address order: stable within one process, cheap to compute.
    nodes.sort_by_key(|(type_id, _, _)| *type_id);
    let (graph, mut missing) = SemistaticGraph::build(nodes);

    let mut multibindings = base_multibindings;
    for record in multibinding_records {
        let set = multibindings
            .entry(record.type_id)
            .or_insert_with(|| NormalizedMultibindingSet {
                elems: Vec::new(),
                create_vector: record.create_vector,
            });
        set.create_vector = record.create_vector;
        match record.multibinding {
            Multibinding::Constructed { object } => {
                allocator_data.add_externally_allocated_type(record.type_id);
                set.elems.push(MultibindingState::Constructed(object));
            }
            Multibinding::ToConstruct {
                create,
                deps,
                allocation,
            } => {
                match allocation {
                    Allocation::NeedsAllocation => allocator_data.add_type(record.type_id),
                    Allocation::NoAllocation => {
                        allocator_data.add_externally_allocated_type(record.type_id)
                    }
                    Allocation::Unknown => {}
                }
                for dep in deps.iter() {
                    if graph.index_of(*dep).is_none() {
                        missing.push(*dep);
                    }
                }
                set.elems.push(MultibindingState::Pending(create));
            }
        }
    }

    // An exposed type may be served by a binding, by multibindings, or both.
    for type_id in &exposed {
        if graph.index_of(*type_id).is_none() && !multibindings.contains_key(type_id) {
            missing.push(*type_id);
        }
    }
    missing.sort();
    missing.dedup();

    NormalizedComponent {
        graph,
        multibindings,
        allocator_data,
        compression_undo,
        exposed,
        requirements: missing,
    }
}
