//! The runtime engine behind graft's compile-time-checked dependency
//! injection.
//!
//! The compile-time front-end proves that a component tree is well-formed and
//! lowers it to a declaration log ([`ComponentStorage`]). This crate is
//! everything that happens after that proof:
//!
//! - [`normalize`] turns the log into a [`NormalizedComponent`]: a semi-static
//!   binding graph plus multibinding sets, with lazy sub-components expanded,
//!   duplicates folded, interface bindings compressed onto their concrete
//!   types where legal, and the arena sized exactly.
//! - [`Injector`] wraps a normalized component and serves `get` requests by
//!   walking the graph depth-first, constructing each object at most once in
//!   a fixed-capacity arena, and destroying everything in reverse
//!   construction order when it is dropped.
//!
//! Because the front-end has already ruled out every recoverable mistake, the
//! engine treats anything left as fatal: it renders a diagnostic naming the
//! offending types and panics. The `try_*` entry points expose the underlying
//! [`FatalError`] for the front-end's own tests.

// Callback identity is binding identity: two entries describe the same
// binding exactly when they carry the same monomorphized `create` function.
#![allow(unpredictable_function_pointer_comparisons)]

pub mod arena;
pub mod component;
mod errors;
pub mod graph;
pub mod injector;
mod normalize;
mod type_info;

pub use component::ComponentStorage;
pub use component::entry::ComponentStorageEntry;
pub use errors::FatalError;
pub use injector::{Injector, Provider, SharedInjector};
pub use normalize::{NormalizedComponent, normalize, try_normalize};
pub use type_info::{Annotated, TypeId, TypeInfo};
