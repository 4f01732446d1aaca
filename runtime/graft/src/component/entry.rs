use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::component::ComponentStorage;
use crate::graph::NodeIndex;
use crate::injector::{ErasedVec, InjectorStorage};
use crate::type_info::TypeId;

/// A thin, type-erased pointer to a node value.
///
/// Trait-object values are reached through an arena-allocated fat-pointer
/// slot, so every node value has a thin address.
pub type ObjectPtr = *const u8;

/// Constructs the value of a non-terminal node.
///
/// The callback fetches its dependencies through the node's precomputed edge
/// cursors, in declared order, and returns the address of the constructed
/// value (in the arena, or registered with it).
pub type CreateFn = unsafe fn(&InjectorStorage, NodeIndex) -> ObjectPtr;

/// Constructs one multibinding element.
///
/// Multibindings are not graph nodes; their dependencies are fetched through
/// the type-id lookup instead of edge cursors.
pub type MultibindingCreateFn = unsafe fn(&InjectorStorage) -> ObjectPtr;

/// Assembles the aggregated, memoized vector for one multibinding type, once
/// every element has been constructed.
pub type MultibindingVectorFn = unsafe fn(&InjectorStorage, TypeId) -> ErasedVec;

/// The shared, immutable dependency list of a binding: the types its create
/// callback fetches, in the order it fetches them.
pub type BindingDeps = Arc<[TypeId]>;

pub(crate) fn no_deps() -> BindingDeps {
    Arc::from([])
}

/// Whether the injector's arena must reserve space for a binding's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// The value is constructed in the arena.
    NeedsAllocation,
    /// The value lives outside the arena buffer; only a destructor slot is
    /// reserved.
    NoAllocation,
    /// Accounted for elsewhere. Used when a binding re-enters a graph whose
    /// allocator data already covers it (undoing a binding compression).
    Unknown,
}

/// One record in a component's declaration log.
///
/// The compile-time front-end lowers every declarative operation to a
/// sequence of these; normalization consumes the log and nothing else.
#[derive(Debug, Clone)]
pub enum ComponentStorageEntry {
    /// A binding to an object that is already alive and owned elsewhere.
    /// The injector never destroys it.
    ConstructedBinding { type_id: TypeId, object: ObjectPtr },
    /// A binding to an object the injector will construct on demand.
    BindingToConstruct {
        type_id: TypeId,
        create: CreateFn,
        deps: BindingDeps,
        allocation: Allocation,
    },
    /// A hint that the `interface_id` slot may be fused with the
    /// `concrete_id` slot if nothing else observes the concrete type.
    CompressedBinding {
        interface_id: TypeId,
        concrete_id: TypeId,
        create_as_interface: CreateFn,
    },
    /// One contribution to the aggregated collection keyed by `type_id`.
    /// Always appended adjacent to its vector-creator sentinel.
    Multibinding {
        type_id: TypeId,
        multibinding: Multibinding,
    },
    /// The sentinel paired with each multibinding entry; carries the
    /// aggregation callback for the multibinding's type.
    MultibindingVectorCreator {
        type_id: TypeId,
        create_vector: MultibindingVectorFn,
    },
    /// A sub-component to expand during normalization.
    LazyComponent(LazyComponent),
    /// Internal to normalization: marks the point at which a lazy
    /// component's expansion completes. Never appended by callers.
    ExpansionEndMarker(LazyComponent),
    /// First half of a replacement pair: the component to be substituted.
    ReplacedLazyComponent(LazyComponent),
    /// Second half of a replacement pair: the substitute.
    ReplacementLazyComponent(LazyComponent),
}

impl ComponentStorageEntry {
    /// Bind the interface `interface_id` to the concrete type `concrete_id`.
    ///
    /// `create_as_interface` fetches the concrete object (the sole
    /// dependency), upcasts it, and stores the interface slot in the arena.
    pub fn bind(
        interface_id: TypeId,
        concrete_id: TypeId,
        create_as_interface: CreateFn,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::BindingToConstruct {
            type_id: interface_id,
            create: create_as_interface,
            deps: Arc::from([concrete_id]),
            allocation: Allocation::NeedsAllocation,
        }
    }

    /// Register an externally-owned, already-constructed object.
    ///
    /// # Safety contract
    ///
    /// `object` must outlive every injector built from a component containing
    /// this entry. The front-end enforces this with lifetimes; the erased
    /// layer cannot.
    pub fn bind_instance(type_id: TypeId, object: ObjectPtr) -> ComponentStorageEntry {
        ComponentStorageEntry::ConstructedBinding { type_id, object }
    }

    /// Construct `type_id` from the listed dependency types via a
    /// user-supplied provider.
    pub fn provider(
        type_id: TypeId,
        deps: &[TypeId],
        create: CreateFn,
        allocation: Allocation,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::BindingToConstruct {
            type_id,
            create,
            deps: Arc::from(deps),
            allocation,
        }
    }

    /// Construct `type_id` from the listed dependency types via its own
    /// constructor. Semantically identical to [`provider`](Self::provider)
    /// with in-arena allocation; the distinction exists for diagnostics.
    pub fn constructor(type_id: TypeId, deps: &[TypeId], create: CreateFn) -> ComponentStorageEntry {
        ComponentStorageEntry::BindingToConstruct {
            type_id,
            create,
            deps: Arc::from(deps),
            allocation: Allocation::NeedsAllocation,
        }
    }

    /// Provide a compression hint for an interface binding.
    ///
    /// `create_as_interface` constructs the concrete type directly (reusing
    /// its dependency list) and stores the upcast slot.
    pub fn compressed(
        interface_id: TypeId,
        concrete_id: TypeId,
        create_as_interface: CreateFn,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::CompressedBinding {
            interface_id,
            concrete_id,
            create_as_interface,
        }
    }

    /// An already-constructed multibinding contribution. Same ownership
    /// contract as [`bind_instance`](Self::bind_instance).
    pub fn multibinding_instance(type_id: TypeId, object: ObjectPtr) -> ComponentStorageEntry {
        ComponentStorageEntry::Multibinding {
            type_id,
            multibinding: Multibinding::Constructed { object },
        }
    }

    /// A multibinding contribution constructed on first aggregation.
    pub fn multibinding_provider(
        type_id: TypeId,
        deps: &[TypeId],
        create: MultibindingCreateFn,
        allocation: Allocation,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::Multibinding {
            type_id,
            multibinding: Multibinding::ToConstruct {
                create,
                deps: Arc::from(deps),
                allocation,
            },
        }
    }

    /// The sentinel that must accompany every multibinding entry.
    pub fn multibinding_vector_creator(
        type_id: TypeId,
        create_vector: MultibindingVectorFn,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::MultibindingVectorCreator {
            type_id,
            create_vector,
        }
    }

    /// Install a sub-component, expanded (once) during normalization.
    pub fn install(component: fn() -> ComponentStorage) -> ComponentStorageEntry {
        ComponentStorageEntry::LazyComponent(LazyComponent::no_args(component))
    }

    /// Install a parameterized sub-component. Two installations are the same
    /// installation when the function pointer and the arguments both match.
    pub fn install_with_args<A: LazyArgs>(
        component: fn(A) -> ComponentStorage,
        args: A,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::LazyComponent(LazyComponent::with_args(component, args))
    }

    /// Declare that `component`, wherever it is later installed, must be
    /// substituted. Must be immediately followed by the matching
    /// [`replacement`](Self::replacement) entry.
    pub fn replace(component: fn() -> ComponentStorage) -> ComponentStorageEntry {
        ComponentStorageEntry::ReplacedLazyComponent(LazyComponent::no_args(component))
    }

    pub fn replace_with_args<A: LazyArgs>(
        component: fn(A) -> ComponentStorage,
        args: A,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::ReplacedLazyComponent(LazyComponent::with_args(component, args))
    }

    /// The substitute half of a replacement pair.
    pub fn replacement(component: fn() -> ComponentStorage) -> ComponentStorageEntry {
        ComponentStorageEntry::ReplacementLazyComponent(LazyComponent::no_args(component))
    }

    pub fn replacement_with_args<A: LazyArgs>(
        component: fn(A) -> ComponentStorage,
        args: A,
    ) -> ComponentStorageEntry {
        ComponentStorageEntry::ReplacementLazyComponent(LazyComponent::with_args(component, args))
    }
}

/// One multibinding contribution, as it sits in the declaration log.
#[derive(Debug, Clone)]
pub enum Multibinding {
    Constructed {
        object: ObjectPtr,
    },
    ToConstruct {
        create: MultibindingCreateFn,
        deps: BindingDeps,
        allocation: Allocation,
    },
}

/// The arguments of a parameterized lazy component.
///
/// Equality and hashing must be structural: two installations with equal
/// arguments are one installation.
pub trait LazyArgs: Clone + Eq + Hash + 'static {}

impl<A: Clone + Eq + Hash + 'static> LazyArgs for A {}

/// A function that, when invoked, produces further component entries.
///
/// Identity is the function pointer for the no-args flavor, and the function
/// pointer plus structural equality of the argument tuple for the
/// parameterized flavor.
#[derive(Clone)]
pub enum LazyComponent {
    NoArgs { component: fn() -> ComponentStorage },
    WithArgs(LazyComponentWithArgs),
}

impl LazyComponent {
    fn no_args(component: fn() -> ComponentStorage) -> LazyComponent {
        LazyComponent::NoArgs { component }
    }

    fn with_args<A: LazyArgs>(component: fn(A) -> ComponentStorage, args: A) -> LazyComponent {
        LazyComponent::WithArgs(LazyComponentWithArgs {
            inner: Arc::new(ComponentFnWithArgs { component, args }),
        })
    }

    /// Invoke the component function, producing the entries to expand.
    pub(crate) fn install(&self) -> ComponentStorage {
        match self {
            LazyComponent::NoArgs { component } => component(),
            LazyComponent::WithArgs(with_args) => with_args.inner.install(),
        }
    }

    /// The address of the component function, for diagnostics.
    pub(crate) fn fun_addr(&self) -> usize {
        match self {
            LazyComponent::NoArgs { component } => *component as usize,
            LazyComponent::WithArgs(with_args) => with_args.inner.fun_addr(),
        }
    }
}

impl PartialEq for LazyComponent {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LazyComponent::NoArgs { component: a }, LazyComponent::NoArgs { component: b }) => {
                std::ptr::fn_addr_eq(*a, *b)
            }
            (LazyComponent::WithArgs(a), LazyComponent::WithArgs(b)) => {
                a.inner.args_eq(b.inner.as_ref())
            }
            _ => false,
        }
    }
}

impl Eq for LazyComponent {}

impl Hash for LazyComponent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            LazyComponent::NoArgs { component } => {
                (*component as usize).hash(state);
            }
            LazyComponent::WithArgs(with_args) => {
                with_args.inner.fun_addr().hash(state);
                with_args.inner.hash_args(state);
            }
        }
    }
}

impl fmt::Debug for LazyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LazyComponent::NoArgs { .. } => {
                write!(f, "LazyComponent::NoArgs({:#x})", self.fun_addr())
            }
            LazyComponent::WithArgs(_) => {
                write!(f, "LazyComponent::WithArgs({:#x})", self.fun_addr())
            }
        }
    }
}

/// The parameterized flavor: the function pointer and argument tuple live
/// behind a shared, type-erased allocation — the only heap data a component
/// entry owns.
#[derive(Clone)]
pub struct LazyComponentWithArgs {
    inner: Arc<dyn ErasedComponentFn>,
}

trait ErasedComponentFn {
    fn fun_addr(&self) -> usize;
    fn install(&self) -> ComponentStorage;
    fn args_eq(&self, other: &dyn ErasedComponentFn) -> bool;
    fn hash_args(&self, state: &mut dyn Hasher);
    fn as_any(&self) -> &dyn Any;
}

struct ComponentFnWithArgs<A> {
    component: fn(A) -> ComponentStorage,
    args: A,
}

impl<A: LazyArgs> ErasedComponentFn for ComponentFnWithArgs<A> {
    fn fun_addr(&self) -> usize {
        self.component as usize
    }

    fn install(&self) -> ComponentStorage {
        (self.component)(self.args.clone())
    }

    fn args_eq(&self, other: &dyn ErasedComponentFn) -> bool {
        match other.as_any().downcast_ref::<ComponentFnWithArgs<A>>() {
            Some(other) => {
                std::ptr::fn_addr_eq(self.component, other.component) && self.args == other.args
            }
            None => false,
        }
    }

    fn hash_args(&self, mut state: &mut dyn Hasher) {
        self.args.hash(&mut state);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
