use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::type_info::TypeId;

/// Accumulates, during normalization, the exact capacity the arena of one
/// injector must be constructed with.
///
/// Each `add_type` call entitles the resulting arena to one in-arena
/// construction of that type; each `add_externally_allocated_type` call
/// entitles it to one destructor-slot registration for an object that lives
/// outside the buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FixedSizeAllocatorData {
    total_size: usize,
    num_destructor_slots: usize,
    #[cfg(feature = "debug_assertions")]
    multiplicities: ahash::HashMap<TypeId, usize>,
}

impl FixedSizeAllocatorData {
    /// Reserve space for one in-arena instance of `type_id`.
    pub fn add_type(&mut self, type_id: TypeId) {
        #[cfg(feature = "debug_assertions")]
        {
            *self.multiplicities.entry(type_id).or_insert(0) += 1;
        }
        if !type_id.info().is_trivially_destructible() {
            self.num_destructor_slots += 1;
        }
        self.total_size += Self::maximum_required_space(type_id);
    }

    /// Reserve one destructor slot for an instance of `type_id` that is
    /// allocated outside the arena buffer.
    pub fn add_externally_allocated_type(&mut self, type_id: TypeId) {
        let _ = type_id;
        self.num_destructor_slots += 1;
    }

    /// The buffer capacity the accumulated reservations require.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// The number of destructor slots the accumulated reservations require.
    pub fn num_destructor_slots(&self) -> usize {
        self.num_destructor_slots
    }

    // The worst case is a maximally misaligned bump pointer: `align - 1`
    // padding bytes, then the value itself.
    fn maximum_required_space(type_id: TypeId) -> usize {
        type_id.info().align() + type_id.info().size() - 1
    }
}

type DestroyFn = unsafe fn(*mut u8);

/// A bump allocator whose total capacity is fixed at construction and whose
/// memory is retained until the allocator itself is dropped.
///
/// On drop, every recorded destructor runs in reverse registration order:
/// objects die in the reverse of their construction order, which is the
/// reverse of dependency order.
#[derive(Debug)]
pub struct FixedSizeArena {
    buffer: NonNull<u8>,
    capacity: usize,
    used: Cell<usize>,
    on_destruction: RefCell<Vec<(DestroyFn, *mut u8)>>,
}

impl FixedSizeArena {
    /// Allocate an arena sized exactly for the reservations in `data`.
    pub fn new(data: &FixedSizeAllocatorData) -> FixedSizeArena {
        // The first byte is wasted so that a zero-capacity arena still owns a
        // valid, deallocatable buffer.
        let layout = Layout::from_size_align(data.total_size + 1, 1).unwrap();
        let buffer = match NonNull::new(unsafe { alloc(layout) }) {
            Some(buffer) => buffer,
            None => handle_alloc_error(layout),
        };
        FixedSizeArena {
            buffer,
            capacity: data.total_size,
            used: Cell::new(0),
            on_destruction: RefCell::new(Vec::with_capacity(data.num_destructor_slots)),
        }
    }

    /// Move `value` into the arena and return a pointer to it.
    ///
    /// The pointer stays valid, at a stable address, until the arena is
    /// dropped. Construction runs behind a shared reference: dependency
    /// construction is free to call `construct` again before this frame's
    /// caller returns.
    pub fn construct<T>(&self, value: T) -> *const T {
        let size = std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();
        let slot = if size == 0 {
            NonNull::<T>::dangling().as_ptr()
        } else {
            let offset = self.used.get();
            let start = unsafe { self.buffer.as_ptr().add(offset) };
            let padding = start.align_offset(align);
            debug_assert!(
                offset + padding + size <= self.capacity,
                "arena over-commit: the allocator data under-counted `{}`",
                std::any::type_name::<T>(),
            );
            self.used.set(offset + padding + size);
            unsafe { start.add(padding) as *mut T }
        };
        unsafe { std::ptr::write(slot, value) };
        // Registered only once the value is in place, so a panicking
        // dependency constructor never leaves a slot for a never-built value.
        if std::mem::needs_drop::<T>() {
            self.push_destructor(drop_in_arena::<T>, slot as *mut u8);
        }
        slot
    }

    /// Record `ptr` as an external (boxed) object to reclaim when the arena
    /// is dropped.
    pub fn register_external<T>(&self, ptr: *mut T) {
        self.push_destructor(drop_external::<T>, ptr as *mut u8);
    }

    fn push_destructor(&self, destroy: DestroyFn, ptr: *mut u8) {
        let mut on_destruction = self.on_destruction.borrow_mut();
        debug_assert!(
            on_destruction.len() < on_destruction.capacity(),
            "arena destructor stack over-commit",
        );
        on_destruction.push((destroy, ptr));
    }
}

impl Drop for FixedSizeArena {
    fn drop(&mut self) {
        let on_destruction = self.on_destruction.get_mut();
        for (destroy, ptr) in on_destruction.drain(..).rev() {
            unsafe { destroy(ptr) };
        }
        let layout = Layout::from_size_align(self.capacity + 1, 1).unwrap();
        unsafe { dealloc(self.buffer.as_ptr(), layout) };
    }
}

unsafe fn drop_in_arena<T>(ptr: *mut u8) {
    unsafe { std::ptr::drop_in_place(ptr as *mut T) };
}

unsafe fn drop_external<T>(ptr: *mut u8) {
    drop(unsafe { Box::from_raw(ptr as *mut T) });
}
