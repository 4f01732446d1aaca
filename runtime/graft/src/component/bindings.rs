//! The typed shim the compile-time front-end lowers component declarations
//! through: traits at the construction seams, dependency-shape markers, and
//! typed entry factories that monomorphize the engine's erased callbacks.

use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::component::entry::{Allocation, ComponentStorageEntry, ObjectPtr};
use crate::errors::{FatalError, fatal};
use crate::graph::NodeIndex;
use crate::injector::{ErasedVec, InjectorStorage, Provider};
use crate::type_info::TypeId;

/// A type the injector can construct from its dependencies, in the arena.
pub trait Inject: Sized + 'static {
    /// The dependency shapes, as a tuple of markers ([`Ref`], [`IfaceRef`],
    /// [`AnnotatedRef`], [`Deferred`]).
    type Deps: DepList;

    // The lifetime is explicit: implementations whose dependency tuples
    // carry no references must still declare it to match this signature.
    fn inject<'i>(deps: <Self::Deps as DepList>::Output<'i>) -> Self;
}

/// A type obtained from a provider that allocates it itself; the injector
/// takes ownership of the box and reclaims it when it is dropped.
pub trait InjectBoxed: Sized + 'static {
    type Deps: DepList;

    fn inject_boxed<'i>(deps: <Self::Deps as DepList>::Output<'i>) -> Box<Self>;
}

/// Upcast seam for interface bindings: how a concrete `C` is viewed as the
/// interface `I`.
pub trait AsInterface<I: ?Sized + 'static>: 'static {
    fn as_interface(&self) -> &I;
}

/// One dependency shape: which type id it resolves through and what the
/// constructor receives.
pub trait DepSpec {
    type Output<'i>;

    fn type_id() -> TypeId;

    /// # Safety
    ///
    /// `node` must be the cursor of this dependency's binding.
    unsafe fn resolve<'i>(storage: &'i InjectorStorage, node: NodeIndex) -> Self::Output<'i>;
}

/// A shared reference to the sized dependency `T`.
pub struct Ref<T>(PhantomData<T>);

impl<T: 'static> DepSpec for Ref<T> {
    type Output<'i> = &'i T;

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    unsafe fn resolve<'i>(storage: &'i InjectorStorage, node: NodeIndex) -> &'i T {
        unsafe { &*(storage.get_ptr(node) as *const T) }
    }
}

/// A shared reference to the interface dependency `I`.
pub struct IfaceRef<I: ?Sized>(PhantomData<I>);

impl<I: ?Sized + 'static> DepSpec for IfaceRef<I> {
    type Output<'i> = &'i I;

    fn type_id() -> TypeId {
        TypeId::of_interface::<I>()
    }

    unsafe fn resolve<'i>(storage: &'i InjectorStorage, node: NodeIndex) -> &'i I {
        let slot = storage.get_ptr(node) as *const *const I;
        unsafe { &**slot }
    }
}

/// A shared reference to `T` bound under the annotation `A`.
pub struct AnnotatedRef<A, T>(PhantomData<(A, T)>);

impl<A: 'static, T: 'static> DepSpec for AnnotatedRef<A, T> {
    type Output<'i> = &'i T;

    fn type_id() -> TypeId {
        TypeId::of_annotated::<A, T>()
    }

    unsafe fn resolve<'i>(storage: &'i InjectorStorage, node: NodeIndex) -> &'i T {
        unsafe { &*(storage.get_ptr(node) as *const T) }
    }
}

/// A [`Provider`] handle for `T`: the dependency's construction is deferred
/// until the handle's `get`, and skipped entirely if it never happens.
pub struct Deferred<T>(PhantomData<T>);

impl<T: 'static> DepSpec for Deferred<T> {
    type Output<'i> = Provider<T>;

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    unsafe fn resolve<'i>(storage: &'i InjectorStorage, node: NodeIndex) -> Provider<T> {
        Provider::new(storage, node)
    }
}

/// An ordered tuple of dependency shapes.
pub trait DepList {
    type Output<'i>;

    fn type_ids() -> SmallVec<[TypeId; 4]>;

    /// Resolve through the node's precomputed dependency edges.
    ///
    /// # Safety
    ///
    /// `node`'s edges must match [`type_ids`](Self::type_ids), in order.
    unsafe fn fetch<'i>(storage: &'i InjectorStorage, node: NodeIndex) -> Self::Output<'i>;

    /// Resolve through the type-id lookup. Used where no graph node carries
    /// the edges (multibinding element construction).
    ///
    /// # Safety
    ///
    /// Every listed type must be bound (fatal otherwise).
    unsafe fn fetch_by_id<'i>(storage: &'i InjectorStorage) -> Self::Output<'i>;
}

impl DepList for () {
    type Output<'i> = ();

    fn type_ids() -> SmallVec<[TypeId; 4]> {
        SmallVec::new()
    }

    unsafe fn fetch<'i>(_: &'i InjectorStorage, _: NodeIndex) -> Self::Output<'i> {}

    unsafe fn fetch_by_id<'i>(_: &'i InjectorStorage) -> Self::Output<'i> {}
}

fn node_of_or_fatal(storage: &InjectorStorage, type_id: TypeId) -> NodeIndex {
    match storage.node_of(type_id) {
        Some(node) => node,
        None => fatal(FatalError::UnboundType(type_id)),
    }
}

macro_rules! impl_dep_list {
    ($( ($($spec:ident => $idx:tt),+) )+) => {
        $(
            impl<$($spec: DepSpec),+> DepList for ($($spec,)+) {
                type Output<'i> = ($($spec::Output<'i>,)+);

                fn type_ids() -> SmallVec<[TypeId; 4]> {
                    smallvec::smallvec![$($spec::type_id()),+]
                }

                unsafe fn fetch<'i>(storage: &'i InjectorStorage, node: NodeIndex) -> Self::Output<'i> {
                    ($( unsafe { $spec::resolve(storage, storage.dep_node(node, $idx)) }, )+)
                }

                unsafe fn fetch_by_id<'i>(storage: &'i InjectorStorage) -> Self::Output<'i> {
                    ($( unsafe { $spec::resolve(storage, node_of_or_fatal(storage, $spec::type_id())) }, )+)
                }
            }
        )+
    };
}

impl_dep_list! {
    (A0 => 0)
    (A0 => 0, A1 => 1)
    (A0 => 0, A1 => 1, A2 => 2)
    (A0 => 0, A1 => 1, A2 => 2, A3 => 3)
    (A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4)
    (A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5)
    (A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5, A6 => 6)
    (A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5, A6 => 6, A7 => 7)
}

// ---------------------------------------------------------------------------
// Typed entry factories. Each monomorphization yields one `create` function
// item, so duplicate declarations of the same binding dedup by callback
// identity during normalization.
// ---------------------------------------------------------------------------

unsafe fn create_via_inject<T: Inject>(storage: &InjectorStorage, node: NodeIndex) -> ObjectPtr {
    let deps = unsafe { T::Deps::fetch(storage, node) };
    storage.arena().construct(T::inject(deps)) as ObjectPtr
}

/// Construct `T` in the arena from its [`Inject`] implementation.
pub fn constructor<T: Inject>() -> ComponentStorageEntry {
    ComponentStorageEntry::constructor(TypeId::of::<T>(), &T::Deps::type_ids(), create_via_inject::<T>)
}

/// Construct `T` under the annotation `A`. The payload and its dependencies
/// are those of `T`; only the binding key differs.
pub fn annotated_constructor<A: 'static, T: Inject>() -> ComponentStorageEntry {
    ComponentStorageEntry::constructor(
        TypeId::of_annotated::<A, T>(),
        &T::Deps::type_ids(),
        create_via_inject::<T>,
    )
}

unsafe fn create_via_boxed<T: InjectBoxed>(storage: &InjectorStorage, node: NodeIndex) -> ObjectPtr {
    let deps = unsafe { T::Deps::fetch(storage, node) };
    let ptr = Box::into_raw(T::inject_boxed(deps));
    storage.arena().register_external(ptr);
    ptr as ObjectPtr
}

/// Bind `T` to a provider that boxes it; the injector owns the box.
pub fn boxed_provider<T: InjectBoxed>() -> ComponentStorageEntry {
    ComponentStorageEntry::provider(
        TypeId::of::<T>(),
        &T::Deps::type_ids(),
        create_via_boxed::<T>,
        Allocation::NoAllocation,
    )
}

/// Register an externally-owned instance as the binding for `T`.
pub fn instance<T: 'static>(object: &'static T) -> ComponentStorageEntry {
    ComponentStorageEntry::bind_instance(TypeId::of::<T>(), object as *const T as ObjectPtr)
}

/// Register an externally-owned instance as the binding for `T` under the
/// annotation `A`.
pub fn annotated_instance<A: 'static, T: 'static>(object: &'static T) -> ComponentStorageEntry {
    ComponentStorageEntry::bind_instance(
        TypeId::of_annotated::<A, T>(),
        object as *const T as ObjectPtr,
    )
}

unsafe fn create_bound_interface<I: ?Sized + 'static, C: AsInterface<I>>(
    storage: &InjectorStorage,
    node: NodeIndex,
) -> ObjectPtr {
    let concrete = unsafe { &*(storage.get_ptr(storage.dep_node(node, 0)) as *const C) };
    let slot: *const I = concrete.as_interface();
    storage.arena().construct(slot) as ObjectPtr
}

/// Bind the interface `I` to the concrete type `C`. `C` needs its own
/// binding; this entry only adds the upcast slot.
pub fn bind<I: ?Sized + 'static, C: AsInterface<I>>() -> ComponentStorageEntry {
    ComponentStorageEntry::bind(
        TypeId::of_interface::<I>(),
        TypeId::of::<C>(),
        create_bound_interface::<I, C>,
    )
}

unsafe fn create_compressed_interface<I: ?Sized + 'static, C: Inject + AsInterface<I>>(
    storage: &InjectorStorage,
    node: NodeIndex,
) -> ObjectPtr {
    // The node this runs at inherited the concrete type's dependency edges
    // when the compression was applied.
    let deps = unsafe { C::Deps::fetch(storage, node) };
    let concrete = storage.arena().construct(C::inject(deps));
    let slot: *const I = unsafe { (*concrete).as_interface() };
    storage.arena().construct(slot) as ObjectPtr
}

/// The compression hint accompanying `bind::<I, C>()` + `constructor::<C>()`:
/// if nothing else observes `C`, the `I` slot is fused with `C`'s
/// construction, skipping one graph node.
pub fn compressed_constructor<I: ?Sized + 'static, C: Inject + AsInterface<I>>()
-> ComponentStorageEntry {
    ComponentStorageEntry::compressed(
        TypeId::of_interface::<I>(),
        TypeId::of::<C>(),
        create_compressed_interface::<I, C>,
    )
}

// Multibinding factories return the (sentinel, contribution) pair; append
// both, adjacent, in this order.

unsafe fn create_sized_vector<T: 'static>(storage: &InjectorStorage, type_id: TypeId) -> ErasedVec {
    let objects = storage.constructed_multibinding_objects(type_id);
    ErasedVec::from_vec::<T>(objects.into_iter().map(|object| object as *const T).collect())
}

unsafe fn create_interface_vector<I: ?Sized + 'static>(
    storage: &InjectorStorage,
    type_id: TypeId,
) -> ErasedVec {
    let objects = storage.constructed_multibinding_objects(type_id);
    ErasedVec::from_vec::<I>(
        objects
            .into_iter()
            .map(|object| unsafe { *(object as *const *const I) })
            .collect(),
    )
}

unsafe fn create_multibound_interface<I: ?Sized + 'static, C: AsInterface<I>>(
    storage: &InjectorStorage,
) -> ObjectPtr {
    let concrete = unsafe { &*(storage.get_ptr_by_id(TypeId::of::<C>()) as *const C) };
    let slot: *const I = concrete.as_interface();
    storage.arena().construct(slot) as ObjectPtr
}

/// Contribute `C`, viewed as the interface `I`, to `I`'s multibindings.
pub fn multibinding_bind<I: ?Sized + 'static, C: AsInterface<I>>() -> [ComponentStorageEntry; 2] {
    let interface_id = TypeId::of_interface::<I>();
    [
        ComponentStorageEntry::multibinding_vector_creator(interface_id, create_interface_vector::<I>),
        ComponentStorageEntry::multibinding_provider(
            interface_id,
            &[TypeId::of::<C>()],
            create_multibound_interface::<I, C>,
            Allocation::NeedsAllocation,
        ),
    ]
}

unsafe fn create_multibinding_via_inject<T: Inject>(storage: &InjectorStorage) -> ObjectPtr {
    let deps = unsafe { T::Deps::fetch_by_id(storage) };
    storage.arena().construct(T::inject(deps)) as ObjectPtr
}

/// Contribute a freshly constructed `T` to `T`'s multibindings.
pub fn multibinding_provider<T: Inject>() -> [ComponentStorageEntry; 2] {
    let type_id = TypeId::of::<T>();
    [
        ComponentStorageEntry::multibinding_vector_creator(type_id, create_sized_vector::<T>),
        ComponentStorageEntry::multibinding_provider(
            type_id,
            &T::Deps::type_ids(),
            create_multibinding_via_inject::<T>,
            Allocation::NeedsAllocation,
        ),
    ]
}

/// Contribute an externally-owned instance to `T`'s multibindings.
pub fn multibinding_instance<T: 'static>(object: &'static T) -> [ComponentStorageEntry; 2] {
    let type_id = TypeId::of::<T>();
    [
        ComponentStorageEntry::multibinding_vector_creator(type_id, create_sized_vector::<T>),
        ComponentStorageEntry::multibinding_instance(type_id, object as *const T as ObjectPtr),
    ]
}

/// Contribute an externally-owned instance of `C`, viewed as the interface
/// `I`, to `I`'s multibindings.
pub fn multibinding_interface_instance<I: ?Sized + 'static, C: AsInterface<I>>(
    object: &'static C,
) -> [ComponentStorageEntry; 2] {
    let interface_id = TypeId::of_interface::<I>();
    // The upcast slot is immortal, like the instance it points at.
    let slot: &'static *const I = Box::leak(Box::new(object.as_interface() as *const I));
    [
        ComponentStorageEntry::multibinding_vector_creator(interface_id, create_interface_vector::<I>),
        ComponentStorageEntry::multibinding_instance(
            interface_id,
            slot as *const *const I as ObjectPtr,
        ),
    ]
}
