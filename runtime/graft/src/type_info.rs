use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use ahash::{HashMap, HashMapExt};
use once_cell::sync::Lazy;
use static_assertions::assert_impl_all;

/// The descriptor record behind a [`TypeId`].
///
/// One descriptor is interned per injectable type, process-wide, and never
/// freed. Everything the engine needs to know about a type at runtime lives
/// here: how to name it in diagnostics, how much arena space an instance
/// takes, and whether dropping an instance is a no-op.
#[derive(Debug)]
pub struct TypeInfo {
    name: &'static str,
    size: usize,
    align: usize,
    trivially_destructible: bool,
}

impl TypeInfo {
    /// The fully qualified name of the type, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The size, in bytes, of the value stored for this type.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The alignment, in bytes, of the value stored for this type.
    pub fn align(&self) -> usize {
        self.align
    }

    /// `true` if dropping a value of this type is a no-op.
    ///
    /// Trivially destructible types don't consume a destructor slot in the
    /// arena.
    pub fn is_trivially_destructible(&self) -> bool {
        self.trivially_destructible
    }
}

/// A cheap, copyable handle identifying one injectable type.
///
/// Two handles are equal if and only if they identify the same type:
/// equality, hashing and ordering are all defined over the address of the
/// interned [`TypeInfo`] record, never over its contents.
#[derive(Clone, Copy)]
pub struct TypeId {
    info: &'static TypeInfo,
}

assert_impl_all!(TypeId: Send, Sync, Copy);

impl TypeId {
    /// The handle for a sized type `T`.
    ///
    /// The value stored for `T` is a `T` itself.
    pub fn of<T: 'static>() -> TypeId {
        intern(
            std::any::TypeId::of::<T>(),
            || TypeInfo {
                name: std::any::type_name::<T>(),
                size: std::mem::size_of::<T>(),
                align: std::mem::align_of::<T>(),
                trivially_destructible: !std::mem::needs_drop::<T>(),
            },
        )
    }

    /// The handle for an interface (trait object) type `I`.
    ///
    /// Trait object pointers are fat, so the value stored for `I` is a
    /// `*const I` slot; size and alignment describe that slot, and dropping
    /// it is always trivial. The referenced object is owned by the node of
    /// the concrete type it was upcast from.
    pub fn of_interface<I: ?Sized + 'static>() -> TypeId {
        intern(
            std::any::TypeId::of::<I>(),
            || TypeInfo {
                name: std::any::type_name::<I>(),
                size: std::mem::size_of::<*const I>(),
                align: std::mem::align_of::<*const I>(),
                trivially_destructible: true,
            },
        )
    }

    /// The handle for `T` under the annotation marker `A`.
    ///
    /// `Annotated<A, T>` and `Annotated<B, T>` are entirely distinct handles
    /// for the same payload type, which is all an annotation amounts to at
    /// runtime. Size, alignment and destructibility are those of `T`.
    pub fn of_annotated<A: 'static, T: 'static>() -> TypeId {
        intern(
            std::any::TypeId::of::<Annotated<A, T>>(),
            || TypeInfo {
                name: std::any::type_name::<Annotated<A, T>>(),
                size: std::mem::size_of::<T>(),
                align: std::mem::align_of::<T>(),
                trivially_destructible: !std::mem::needs_drop::<T>(),
            },
        )
    }

    /// The interned descriptor record.
    pub fn info(&self) -> &'static TypeInfo {
        self.info
    }

    fn addr(&self) -> usize {
        self.info as *const TypeInfo as usize
    }
}

impl PartialEq for TypeId {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.info, other.info)
    }
}

impl Eq for TypeId {}

impl Hash for TypeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl PartialOrd for TypeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeId").field(&self.info.name).finish()
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info.name)
    }
}

/// A marker distinguishing multiple independent bindings of the same
/// underlying type.
///
/// Only ever used as a type-level key; values of this type are never
/// constructed.
pub struct Annotated<A, T> {
    _marker: PhantomData<(A, T)>,
}

static REGISTRY: Lazy<std::sync::Mutex<HashMap<std::any::TypeId, &'static TypeInfo>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

fn intern(key: std::any::TypeId, info: impl FnOnce() -> TypeInfo) -> TypeId {
    let mut registry = REGISTRY.lock().unwrap();
    let info: &'static TypeInfo = *registry
        .entry(key)
        .or_insert_with(|| Box::leak(Box::new(info())));
    TypeId { info }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter {}

    #[test]
    fn same_type_yields_same_handle() {
        assert_eq!(TypeId::of::<u64>(), TypeId::of::<u64>());
        assert_eq!(
            TypeId::of_interface::<dyn Greeter>(),
            TypeId::of_interface::<dyn Greeter>()
        );
    }

    #[test]
    fn distinct_types_yield_distinct_handles() {
        assert_ne!(TypeId::of::<u64>(), TypeId::of::<i64>());
        assert_ne!(TypeId::of::<String>(), TypeId::of_interface::<dyn Greeter>());
    }

    #[test]
    fn annotations_split_the_same_payload_type() {
        struct Hot;
        struct Cold;
        let hot = TypeId::of_annotated::<Hot, String>();
        let cold = TypeId::of_annotated::<Cold, String>();
        assert_ne!(hot, cold);
        assert_ne!(hot, TypeId::of::<String>());
        // The payload layout is what the arena will see.
        assert_eq!(hot.info().size(), std::mem::size_of::<String>());
        assert_eq!(hot.info().align(), std::mem::align_of::<String>());
        assert!(!hot.info().is_trivially_destructible());
    }

    #[test]
    fn descriptor_reports_the_stored_value_layout() {
        let id = TypeId::of::<u32>();
        assert_eq!(id.info().size(), 4);
        assert_eq!(id.info().align(), 4);
        assert!(id.info().is_trivially_destructible());

        let iface = TypeId::of_interface::<dyn Greeter>();
        assert_eq!(iface.info().size(), std::mem::size_of::<*const dyn Greeter>());
        assert!(iface.info().is_trivially_destructible());
    }
}
