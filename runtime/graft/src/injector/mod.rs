mod provider;

pub use provider::Provider;

use std::cell::Cell;
use std::ptr::NonNull;

use indexmap::IndexMap;
use once_cell::unsync::OnceCell;

use crate::arena::FixedSizeArena;
use crate::component::ComponentStorage;
use crate::component::entry::ObjectPtr;
use crate::errors::{FatalError, fatal};
use crate::graph::{NodeIndex, NodeSlot, SemistaticGraph};
use crate::normalize::normalized::{MultibindingState, NormalizedComponent};
use crate::type_info::TypeId;

/// An aggregated multibinding vector, type-erased for caching.
///
/// Owns a boxed `Vec<*const T>`; the element type is recovered by the typed
/// accessor that knows which `T` the multibinding was registered under.
#[derive(Debug)]
pub struct ErasedVec {
    ptr: NonNull<u8>,
    len: usize,
    drop_fn: unsafe fn(NonNull<u8>),
}

impl ErasedVec {
    pub fn from_vec<T: ?Sized>(vec: Vec<*const T>) -> ErasedVec {
        let len = vec.len();
        let ptr = NonNull::new(Box::into_raw(Box::new(vec)) as *mut u8).unwrap();
        ErasedVec {
            ptr,
            len,
            drop_fn: drop_erased_vec::<T>,
        }
    }

    /// # Safety
    ///
    /// `T` must be the element type this vector was created with.
    pub unsafe fn as_slice<T: ?Sized>(&self) -> &[*const T] {
        unsafe { &*(self.ptr.as_ptr() as *const Vec<*const T>) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ErasedVec {
    fn drop(&mut self) {
        unsafe { (self.drop_fn)(self.ptr) };
    }
}

unsafe fn drop_erased_vec<T: ?Sized>(ptr: NonNull<u8>) {
    drop(unsafe { Box::from_raw(ptr.as_ptr() as *mut Vec<*const T>) });
}

#[derive(Debug)]
struct MultibindingRuntimeSet {
    elems: Vec<Cell<MultibindingState>>,
    create_vector: crate::component::entry::MultibindingVectorFn,
    aggregated: OnceCell<ErasedVec>,
}

/// The type-erased engine behind an [`Injector`]: the private copy of the
/// binding graph's node slots, the multibinding state, and the arena.
///
/// All mutation goes through interior-mutable cells, so the `create`
/// callbacks run behind a shared reference and are free to recurse into the
/// storage for their dependencies.
#[derive(Debug)]
pub struct InjectorStorage {
    graph: SemistaticGraph,
    states: Vec<Cell<NodeSlot>>,
    multibindings: IndexMap<TypeId, MultibindingRuntimeSet>,
    arena: FixedSizeArena,
    // The nodes of the exposed types; the roots of the eager-injection walk.
    // Exposed types served by multibindings alone have no node here.
    exposed: Vec<NodeIndex>,
}

impl InjectorStorage {
    fn new(normalized: NormalizedComponent) -> Result<InjectorStorage, FatalError> {
        if !normalized.requirements.is_empty() {
            return Err(FatalError::UnsatisfiedRequirements {
                missing: normalized.requirements,
            });
        }
        let arena = FixedSizeArena::new(&normalized.allocator_data);
        let states: Vec<Cell<NodeSlot>> = normalized
            .graph
            .indices()
            .map(|node| Cell::new(normalized.graph.initial_slot(node)))
            .collect();
        let exposed = normalized
            .exposed
            .iter()
            .filter_map(|type_id| normalized.graph.index_of(*type_id))
            .collect();
        let multibindings = normalized
            .multibindings
            .into_iter()
            .map(|(type_id, set)| {
                let runtime = MultibindingRuntimeSet {
                    elems: set.elems.into_iter().map(Cell::new).collect(),
                    create_vector: set.create_vector,
                    aggregated: OnceCell::new(),
                };
                (type_id, runtime)
            })
            .collect();
        Ok(InjectorStorage {
            graph: normalized.graph,
            states,
            multibindings,
            arena,
            exposed,
        })
    }

    /// The cursor for `type_id`'s node, if it has one.
    pub fn node_of(&self, type_id: TypeId) -> Option<NodeIndex> {
        self.graph.index_of(type_id)
    }

    /// The cursor of the `dep_index`-th dependency of `node`.
    ///
    /// A direct offset lookup; the edge targets were resolved during
    /// normalization and injector construction verified that none of them is
    /// missing.
    pub fn dep_node(&self, node: NodeIndex, dep_index: usize) -> NodeIndex {
        self.graph
            .dep_target(node, dep_index)
            .expect("dependency edge without a node survived injector construction")
    }

    /// The address of the value at `node`, constructing it (and,
    /// recursively, its dependencies, depth-first in declared order) on the
    /// first request.
    pub fn get_ptr(&self, node: NodeIndex) -> ObjectPtr {
        match self.states[node.0 as usize].get() {
            NodeSlot::Terminal(object) => object,
            NodeSlot::Create(create) => {
                let object = unsafe { create(self, node) };
                if object.is_null() {
                    fatal(FatalError::NullProvider(self.graph.type_id(node)));
                }
                self.states[node.0 as usize].set(NodeSlot::Terminal(object));
                object
            }
        }
    }

    /// As [`get_ptr`](Self::get_ptr), addressed by type. Fatal if the type
    /// has no binding.
    pub fn get_ptr_by_id(&self, type_id: TypeId) -> ObjectPtr {
        match self.graph.index_of(type_id) {
            Some(node) => self.get_ptr(node),
            None => fatal(FatalError::UnboundType(type_id)),
        }
    }

    /// As [`get_ptr_by_id`](Self::get_ptr_by_id), but `None` for an unbound
    /// type instead of fatal.
    pub fn try_get_ptr_by_id(&self, type_id: TypeId) -> Option<ObjectPtr> {
        self.graph.index_of(type_id).map(|node| self.get_ptr(node))
    }

    /// The arena backing this injector's constructed objects.
    pub fn arena(&self) -> &FixedSizeArena {
        &self.arena
    }

    /// The aggregated multibinding vector for `type_id`, or `None` if no
    /// multibinding was declared for it. Constructed and memoized on the
    /// first call.
    pub fn get_multibindings_ptr(&self, type_id: TypeId) -> Option<&ErasedVec> {
        let set = self.multibindings.get(&type_id)?;
        Some(set.aggregated.get_or_init(|| {
            for elem in &set.elems {
                if let MultibindingState::Pending(create) = elem.get() {
                    let object = unsafe { create(self) };
                    if object.is_null() {
                        fatal(FatalError::NullProvider(type_id));
                    }
                    elem.set(MultibindingState::Constructed(object));
                }
            }
            unsafe { (set.create_vector)(self, type_id) }
        }))
    }

    /// The constructed element addresses for `type_id`'s multibinding, in
    /// aggregation order. Only meaningful from within a vector-creator
    /// callback, after the engine has constructed every element.
    pub fn constructed_multibinding_objects(&self, type_id: TypeId) -> Vec<ObjectPtr> {
        let Some(set) = self.multibindings.get(&type_id) else {
            return Vec::new();
        };
        set.elems
            .iter()
            .map(|elem| match elem.get() {
                MultibindingState::Constructed(object) => object,
                MultibindingState::Pending(_) => {
                    unreachable!("vector creator invoked before element construction")
                }
            })
            .collect()
    }

    /// The address of the value at `node`, only if it has already been
    /// constructed. Never constructs anything.
    pub fn terminal_ptr(&self, node: NodeIndex) -> Option<ObjectPtr> {
        match self.states[node.0 as usize].get() {
            NodeSlot::Terminal(object) => Some(object),
            NodeSlot::Create(_) => None,
        }
    }

    /// Construct every node reachable from the exposed types (each request
    /// recurses through its dependencies) and aggregate every multibinding
    /// vector.
    ///
    /// Afterwards every node the exposed surface can reach is terminal and
    /// every cache is populated; a binding nothing exposed depends on stays
    /// lazy.
    pub fn eagerly_inject_all(&self) {
        tracing::debug!(
            exposed = self.exposed.len(),
            multibinding_types = self.multibindings.len(),
            "eagerly injecting all bindings",
        );
        for &node in &self.exposed {
            self.get_ptr(node);
        }
        let type_ids: Vec<TypeId> = self.multibindings.keys().copied().collect();
        for type_id in type_ids {
            self.get_multibindings_ptr(type_id);
        }
    }
}

/// The runtime object that resolves `get` requests by walking the binding
/// graph and constructing objects on demand, each at most once.
///
/// An injector is single-threaded (`!Sync`): lazy construction mutates the
/// node slots through interior mutability. [`Injector::into_shared`]
/// constructs everything eagerly and returns a handle that can be read from
/// multiple threads.
#[derive(Debug)]
pub struct Injector {
    // Boxed so that `Provider` handles hold a stable address even when the
    // injector value itself moves.
    storage: Box<InjectorStorage>,
}

impl Injector {
    /// Build an injector owning `normalized`. Fatal if the component still
    /// has unsatisfied requirements.
    pub fn new(normalized: NormalizedComponent) -> Injector {
        match Injector::try_new(normalized) {
            Ok(injector) => injector,
            Err(error) => fatal(error),
        }
    }

    /// Fallible variant of [`new`](Injector::new).
    pub fn try_new(normalized: NormalizedComponent) -> Result<Injector, FatalError> {
        Ok(Injector {
            storage: Box::new(InjectorStorage::new(normalized)?),
        })
    }

    /// Build an injector from a shared normalized component plus an
    /// additional (typically per-request) component that supplies its
    /// requirements. Fatal on any normalization error in the overlay, or if
    /// requirements remain unsatisfied.
    pub fn with_overlay(base: &NormalizedComponent, overlay: ComponentStorage) -> Injector {
        match Injector::try_with_overlay(base, overlay) {
            Ok(injector) => injector,
            Err(error) => fatal(error),
        }
    }

    /// Fallible variant of [`with_overlay`](Injector::with_overlay).
    pub fn try_with_overlay(
        base: &NormalizedComponent,
        overlay: ComponentStorage,
    ) -> Result<Injector, FatalError> {
        let merged = crate::normalize::try_normalize_overlay(base, overlay)?;
        Injector::try_new(merged)
    }

    /// A reference to the value bound at `T`, constructing it on the first
    /// request. Fatal if `T` is not bound.
    pub fn get<T: 'static>(&self) -> &T {
        let object = self.storage.get_ptr_by_id(TypeId::of::<T>());
        unsafe { &*(object as *const T) }
    }

    /// A reference to the value bound at the interface `I`.
    pub fn get_interface<I: ?Sized + 'static>(&self) -> &I {
        let slot = self.storage.get_ptr_by_id(TypeId::of_interface::<I>()) as *const *const I;
        unsafe { &**slot }
    }

    /// A reference to the value bound at `T` under the annotation `A`.
    pub fn get_annotated<A: 'static, T: 'static>(&self) -> &T {
        let object = self.storage.get_ptr_by_id(TypeId::of_annotated::<A, T>());
        unsafe { &*(object as *const T) }
    }

    /// A deferred handle for `T`: construction is delayed until
    /// [`Provider::get`] is called.
    ///
    /// The handle is not lifetime-checked (it must be storable inside
    /// injected objects, which are `'static`); it must not be used after
    /// this injector is dropped.
    pub fn get_provider<T: 'static>(&self) -> Provider<T> {
        match self.storage.node_of(TypeId::of::<T>()) {
            Some(node) => Provider::new(&self.storage, node),
            None => fatal(FatalError::UnboundType(TypeId::of::<T>())),
        }
    }

    /// As [`get`](Injector::get), but `None` when `T` is not bound.
    /// Meant for tests of the surrounding front-end.
    pub fn unsafe_get<T: 'static>(&self) -> Option<&T> {
        self.storage
            .try_get_ptr_by_id(TypeId::of::<T>())
            .map(|object| unsafe { &*(object as *const T) })
    }

    /// The aggregated multibindings for `T`, memoized after the first call.
    /// Empty if no multibinding was declared for `T`.
    pub fn get_multibindings<T: 'static>(&self) -> &[&T] {
        match self.storage.get_multibindings_ptr(TypeId::of::<T>()) {
            None => &[],
            Some(vec) => unsafe {
                let slice = vec.as_slice::<T>();
                std::slice::from_raw_parts(slice.as_ptr() as *const &T, slice.len())
            },
        }
    }

    /// The aggregated multibindings for the interface `I`.
    pub fn get_interface_multibindings<I: ?Sized + 'static>(&self) -> &[&I] {
        match self
            .storage
            .get_multibindings_ptr(TypeId::of_interface::<I>())
        {
            None => &[],
            Some(vec) => unsafe {
                let slice = vec.as_slice::<I>();
                std::slice::from_raw_parts(slice.as_ptr() as *const &I, slice.len())
            },
        }
    }

    /// Construct every node reachable from the exposed types, and every
    /// multibinding element, now.
    pub fn eagerly_inject_all(&self) {
        self.storage.eagerly_inject_all();
    }

    /// The low-level, type-erased storage. The typed shim's create callbacks
    /// go through this.
    pub fn storage(&self) -> &InjectorStorage {
        &self.storage
    }

    /// Inject everything eagerly and return a handle that is safe to share
    /// across threads.
    pub fn into_shared(self) -> SharedInjector {
        self.eagerly_inject_all();
        SharedInjector { inner: self }
    }
}

/// An eagerly-injected injector that can be read concurrently.
///
/// Obtained via [`Injector::into_shared`], which constructs everything the
/// exposed types reach and aggregates every multibinding vector first. The
/// accessors here are pure reads: they serve terminal nodes and populated
/// caches, and refuse to construct anything.
pub struct SharedInjector {
    inner: Injector,
}

// Eager injection makes every node reachable from the exposed surface
// terminal and memoizes every multibinding vector before a `SharedInjector`
// exists, and the accessors below never construct, so the interior-mutable
// cells are never written again; concurrent access is read-only. Instance
// bindings must reference thread-safe data, which the front-end guarantees.
unsafe impl Send for SharedInjector {}
unsafe impl Sync for SharedInjector {}

impl SharedInjector {
    fn read_ptr(&self, type_id: TypeId) -> ObjectPtr {
        let storage = self.inner.storage();
        let Some(node) = storage.node_of(type_id) else {
            fatal(FatalError::UnboundType(type_id));
        };
        match storage.terminal_ptr(node) {
            Some(object) => object,
            None => panic!(
                "the type `{type_id}` was not constructed during eager injection; \
                 a shared injector only serves types reachable from the exposed set"
            ),
        }
    }

    pub fn get<T: 'static>(&self) -> &T {
        unsafe { &*(self.read_ptr(TypeId::of::<T>()) as *const T) }
    }

    pub fn get_interface<I: ?Sized + 'static>(&self) -> &I {
        let slot = self.read_ptr(TypeId::of_interface::<I>()) as *const *const I;
        unsafe { &**slot }
    }

    pub fn get_annotated<A: 'static, T: 'static>(&self) -> &T {
        unsafe { &*(self.read_ptr(TypeId::of_annotated::<A, T>()) as *const T) }
    }

    /// `None` when `T` is unbound, or bound but left unconstructed by the
    /// eager walk.
    pub fn unsafe_get<T: 'static>(&self) -> Option<&T> {
        let storage = self.inner.storage();
        let node = storage.node_of(TypeId::of::<T>())?;
        storage
            .terminal_ptr(node)
            .map(|object| unsafe { &*(object as *const T) })
    }

    // The multibinding caches are all populated during eager injection, so
    // delegating stays on the read path.
    pub fn get_multibindings<T: 'static>(&self) -> &[&T] {
        self.inner.get_multibindings::<T>()
    }

    pub fn get_interface_multibindings<I: ?Sized + 'static>(&self) -> &[&I] {
        self.inner.get_interface_multibindings::<I>()
    }
}
