//! End-to-end injection scenarios: graph construction, caching, interface
//! bindings, multibindings, deferred providers, and the eager/shared path.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use graft::component::bindings::{
    self, AsInterface, Deferred, IfaceRef, Inject, InjectBoxed, Ref,
};
use graft::{ComponentStorage, ComponentStorageEntry, Injector, TypeId, normalize};

mod simple_chain {
    use super::*;

    pub static CONSTRUCTED: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    pub struct Engine {
        pub cylinders: u32,
    }

    impl Inject for Engine {
        type Deps = ();

        fn inject<'i>(_: ()) -> Engine {
            CONSTRUCTED.lock().unwrap().push("engine");
            Engine { cylinders: 4 }
        }
    }

    pub struct Car {
        pub cylinders: u32,
    }

    impl Inject for Car {
        type Deps = (Ref<Engine>,);

        fn inject((engine,): (&Engine,)) -> Car {
            CONSTRUCTED.lock().unwrap().push("car");
            Car {
                cylinders: engine.cylinders,
            }
        }
    }
}

#[test]
fn dependencies_are_constructed_before_their_consumers_and_cached() {
    use simple_chain::{CONSTRUCTED, Car, Engine};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::constructor::<Engine>());
    storage.append(bindings::constructor::<Car>());
    let normalized = normalize(storage, &[TypeId::of::<Car>()]);
    let injector = Injector::new(normalized);

    let car = injector.get::<Car>();
    assert_eq!(car.cylinders, 4);
    assert_eq!(*CONSTRUCTED.lock().unwrap(), vec!["engine", "car"]);

    let again = injector.get::<Car>();
    assert!(std::ptr::eq(car, again));
    // Still one construction each.
    assert_eq!(CONSTRUCTED.lock().unwrap().len(), 2);
}

mod drop_order {
    use super::*;

    pub static DROPPED: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    pub struct Leaf;

    impl Inject for Leaf {
        type Deps = ();

        fn inject<'i>(_: ()) -> Leaf {
            Leaf
        }
    }

    impl Drop for Leaf {
        fn drop(&mut self) {
            DROPPED.lock().unwrap().push("leaf");
        }
    }

    pub struct Root;

    impl Inject for Root {
        type Deps = (Ref<Leaf>,);

        fn inject(_: (&Leaf,)) -> Root {
            Root
        }
    }

    impl Drop for Root {
        fn drop(&mut self) {
            DROPPED.lock().unwrap().push("root");
        }
    }
}

#[test]
fn objects_are_dropped_in_reverse_construction_order() {
    use drop_order::{DROPPED, Leaf, Root};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::constructor::<Leaf>());
    storage.append(bindings::constructor::<Root>());
    let injector = Injector::new(normalize(storage, &[TypeId::of::<Root>()]));
    injector.get::<Root>();
    drop(injector);

    assert_eq!(*DROPPED.lock().unwrap(), vec!["root", "leaf"]);
}

mod interface_binding {
    use super::*;

    pub static BUILT: AtomicUsize = AtomicUsize::new(0);

    pub trait Writer {
        fn name(&self) -> &'static str;
    }

    pub struct StdoutWriter;

    impl Inject for StdoutWriter {
        type Deps = ();

        fn inject<'i>(_: ()) -> StdoutWriter {
            BUILT.fetch_add(1, Ordering::SeqCst);
            StdoutWriter
        }
    }

    impl Writer for StdoutWriter {
        fn name(&self) -> &'static str {
            "stdout"
        }
    }

    impl AsInterface<dyn Writer> for StdoutWriter {
        fn as_interface(&self) -> &(dyn Writer + 'static) {
            self
        }
    }

    pub struct Logger {
        pub sink: &'static str,
    }

    impl Inject for Logger {
        type Deps = (IfaceRef<dyn Writer>,);

        fn inject((writer,): (&dyn Writer,)) -> Logger {
            Logger {
                sink: writer.name(),
            }
        }
    }
}

#[test]
fn an_interface_resolves_to_its_bound_concrete_type() {
    use interface_binding::{BUILT, Logger, StdoutWriter, Writer};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::constructor::<StdoutWriter>());
    storage.append(bindings::bind::<dyn Writer, StdoutWriter>());
    storage.append(bindings::constructor::<Logger>());
    let injector = Injector::new(normalize(
        storage,
        &[TypeId::of_interface::<dyn Writer>(), TypeId::of::<Logger>()],
    ));

    let writer = injector.get_interface::<dyn Writer>();
    assert_eq!(writer.name(), "stdout");
    // The interface view aliases the concrete instance.
    let concrete = injector.get::<StdoutWriter>();
    assert!(std::ptr::eq(
        writer as *const dyn Writer as *const u8,
        concrete as *const StdoutWriter as *const u8,
    ));
    assert_eq!(injector.get::<Logger>().sink, "stdout");
    assert_eq!(BUILT.load(Ordering::SeqCst), 1);
}

mod listeners {
    use super::*;

    pub trait Listener {
        fn label(&self) -> &'static str;
    }

    macro_rules! listener {
        ($name:ident, $label:literal) => {
            pub struct $name;

            impl Inject for $name {
                type Deps = ();

                fn inject<'i>(_: ()) -> $name {
                    $name
                }
            }

            impl Listener for $name {
                fn label(&self) -> &'static str {
                    $label
                }
            }

            impl AsInterface<dyn Listener> for $name {
                fn as_interface(&self) -> &(dyn Listener + 'static) {
                    self
                }
            }
        };
    }

    listener!(AuditListener, "audit");
    listener!(MetricsListener, "metrics");
}

#[test]
fn multibindings_aggregate_every_contribution_and_cache_the_vector() {
    use listeners::{AuditListener, Listener, MetricsListener};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::constructor::<AuditListener>());
    storage.append(bindings::constructor::<MetricsListener>());
    storage.append_all(bindings::multibinding_bind::<dyn Listener, AuditListener>());
    storage.append_all(bindings::multibinding_bind::<dyn Listener, MetricsListener>());
    let injector = Injector::new(normalize(
        storage,
        &[TypeId::of_interface::<dyn Listener>()],
    ));

    let all = injector.get_interface_multibindings::<dyn Listener>();
    assert_eq!(all.len(), 2);
    assert!(!std::ptr::eq(
        all[0] as *const dyn Listener as *const u8,
        all[1] as *const dyn Listener as *const u8,
    ));
    // Aggregation order is unspecified; compare as a set.
    let mut labels: Vec<_> = all.iter().map(|listener| listener.label()).collect();
    labels.sort();
    assert_eq!(labels, vec!["audit", "metrics"]);

    let cached = injector.get_interface_multibindings::<dyn Listener>();
    assert_eq!(cached.as_ptr(), all.as_ptr());
}

mod sized_multibindings {
    use super::*;

    #[derive(Debug)]
    pub struct Rule {
        pub name: &'static str,
    }

    impl Inject for Rule {
        type Deps = ();

        fn inject<'i>(_: ()) -> Rule {
            Rule { name: "constructed" }
        }
    }

    pub static STATIC_RULE: Rule = Rule { name: "static" };
}

#[test]
fn sized_multibindings_mix_instances_and_providers() {
    use sized_multibindings::{Rule, STATIC_RULE};

    let mut storage = ComponentStorage::new();
    storage.append_all(bindings::multibinding_instance::<Rule>(&STATIC_RULE));
    storage.append_all(bindings::multibinding_provider::<Rule>());
    let injector = Injector::new(normalize(storage, &[TypeId::of::<Rule>()]));

    let rules = injector.get_multibindings::<Rule>();
    let mut names: Vec<_> = rules.iter().map(|rule| rule.name).collect();
    names.sort();
    assert_eq!(names, vec!["constructed", "static"]);
    // The instance contribution is served by address, not by copy.
    assert!(rules
        .iter()
        .any(|rule| std::ptr::eq(*rule, &STATIC_RULE)));

    // No multibinding was declared for this type.
    assert!(injector.get_multibindings::<u64>().is_empty());
}

mod deferred {
    use super::*;

    pub static EXPENSIVE_BUILDS: AtomicUsize = AtomicUsize::new(0);

    pub struct Expensive;

    impl Inject for Expensive {
        type Deps = ();

        fn inject<'i>(_: ()) -> Expensive {
            EXPENSIVE_BUILDS.fetch_add(1, Ordering::SeqCst);
            Expensive
        }
    }

    pub struct Frontend {
        pub fallback: graft::Provider<Expensive>,
    }

    impl Inject for Frontend {
        type Deps = (Deferred<Expensive>,);

        fn inject<'i>((fallback,): (graft::Provider<Expensive>,)) -> Frontend {
            Frontend { fallback }
        }
    }
}

#[test]
fn a_deferred_dependency_is_only_constructed_when_its_provider_is_used() {
    use deferred::{EXPENSIVE_BUILDS, Expensive, Frontend};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::constructor::<Expensive>());
    storage.append(bindings::constructor::<Frontend>());
    let injector = Injector::new(normalize(storage, &[TypeId::of::<Frontend>()]));

    let frontend = injector.get::<Frontend>();
    assert_eq!(EXPENSIVE_BUILDS.load(Ordering::SeqCst), 0);

    let first = frontend.fallback.get();
    let second = frontend.fallback.get();
    assert!(std::ptr::eq(first, second));
    assert_eq!(EXPENSIVE_BUILDS.load(Ordering::SeqCst), 1);
}

mod eager {
    use super::*;

    pub static BUILDS: AtomicUsize = AtomicUsize::new(0);

    pub struct Config {
        pub port: u16,
    }

    impl Inject for Config {
        type Deps = ();

        fn inject<'i>(_: ()) -> Config {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            Config { port: 8080 }
        }
    }

    pub struct Server {
        pub port: u16,
    }

    impl Inject for Server {
        type Deps = (Ref<Config>,);

        fn inject((config,): (&Config,)) -> Server {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            Server { port: config.port }
        }
    }

    pub static ORPHAN_BUILDS: AtomicUsize = AtomicUsize::new(0);

    pub struct Orphan;

    impl Inject for Orphan {
        type Deps = ();

        fn inject<'i>(_: ()) -> Orphan {
            ORPHAN_BUILDS.fetch_add(1, Ordering::SeqCst);
            Orphan
        }
    }
}

#[test]
fn eager_injection_constructs_the_exposed_closure_once_and_enables_shared_reads() {
    use eager::{BUILDS, Config, ORPHAN_BUILDS, Orphan, Server};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::constructor::<Config>());
    storage.append(bindings::constructor::<Server>());
    storage.append(bindings::constructor::<Orphan>());
    let injector = Injector::new(normalize(storage, &[TypeId::of::<Server>()]));

    injector.eagerly_inject_all();
    assert_eq!(BUILDS.load(Ordering::SeqCst), 2);
    // Bound, but nothing the exposed types reach depends on it: stays lazy.
    assert_eq!(ORPHAN_BUILDS.load(Ordering::SeqCst), 0);
    // Nothing further to construct.
    let server = injector.get::<Server>();
    assert_eq!(server.port, 8080);
    assert_eq!(BUILDS.load(Ordering::SeqCst), 2);

    let shared = injector.into_shared();
    let baseline = shared.get::<Server>() as *const eager::Server as usize;
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let server = shared.get::<Server>();
                assert_eq!(server.port, 8080);
                assert_eq!(server as *const eager::Server as usize, baseline);
            });
        }
    });
    assert_eq!(BUILDS.load(Ordering::SeqCst), 2);

    // The shared handle never constructs: the unreached binding reads as
    // absent instead of being built on demand.
    assert!(shared.unsafe_get::<Orphan>().is_none());
    assert_eq!(ORPHAN_BUILDS.load(Ordering::SeqCst), 0);
}

mod annotated {
    use super::*;

    pub struct Primary;
    pub struct Replica;

    #[derive(Debug)]
    pub struct DbUrl {
        pub url: &'static str,
    }

    pub static PRIMARY: DbUrl = DbUrl {
        url: "db://primary",
    };
    pub static REPLICA: DbUrl = DbUrl {
        url: "db://replica",
    };
}

#[test]
fn annotations_keep_bindings_of_the_same_type_apart() {
    use annotated::{DbUrl, PRIMARY, Primary, REPLICA, Replica};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::annotated_instance::<Primary, DbUrl>(&PRIMARY));
    storage.append(bindings::annotated_instance::<Replica, DbUrl>(&REPLICA));
    let injector = Injector::new(normalize(
        storage,
        &[
            TypeId::of_annotated::<Primary, DbUrl>(),
            TypeId::of_annotated::<Replica, DbUrl>(),
        ],
    ));

    assert_eq!(injector.get_annotated::<Primary, DbUrl>().url, "db://primary");
    assert_eq!(injector.get_annotated::<Replica, DbUrl>().url, "db://replica");
    // The un-annotated type was never bound.
    assert!(injector.unsafe_get::<DbUrl>().is_none());
}

mod instances {
    pub static DROPS: super::AtomicUsize = super::AtomicUsize::new(0);

    pub struct Clock {
        pub now: u64,
    }

    impl Drop for Clock {
        fn drop(&mut self) {
            DROPS.fetch_add(1, super::Ordering::SeqCst);
        }
    }
}

#[test]
fn instance_bindings_are_served_by_address_and_never_dropped() {
    use instances::{Clock, DROPS};

    let clock: &'static Clock = Box::leak(Box::new(Clock { now: 42 }));

    let mut storage = ComponentStorage::new();
    storage.append(bindings::instance::<Clock>(clock));
    let injector = Injector::new(normalize(storage, &[TypeId::of::<Clock>()]));

    let seen = injector.get::<Clock>();
    assert!(std::ptr::eq(seen, clock));
    assert_eq!(seen.now, 42);
    drop(injector);
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);
}

mod boxed {
    use super::*;

    pub static DROPS: AtomicUsize = AtomicUsize::new(0);

    pub struct Pool {
        pub connections: usize,
    }

    impl InjectBoxed for Pool {
        type Deps = ();

        fn inject_boxed<'i>(_: ()) -> Box<Pool> {
            Box::new(Pool { connections: 8 })
        }
    }

    impl Drop for Pool {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn boxed_providers_hand_ownership_to_the_injector() {
    use boxed::{DROPS, Pool};

    let mut storage = ComponentStorage::new();
    storage.append(bindings::boxed_provider::<Pool>());
    let injector = Injector::new(normalize(storage, &[TypeId::of::<Pool>()]));

    assert_eq!(injector.get::<Pool>().connections, 8);
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);
    drop(injector);
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
}

mod nested_storages {
    use super::*;

    pub struct Inner;

    impl Inject for Inner {
        type Deps = ();

        fn inject<'i>(_: ()) -> Inner {
            Inner
        }
    }

    pub struct Outer;

    impl Inject for Outer {
        type Deps = (Ref<Inner>,);

        fn inject(_: (&Inner,)) -> Outer {
            Outer
        }
    }
}

#[test]
fn installing_one_storage_into_another_preserves_its_entries() {
    use nested_storages::{Inner, Outer};

    let mut inner = ComponentStorage::new();
    inner.append(bindings::constructor::<Inner>());

    let mut outer = ComponentStorage::new();
    outer.append(bindings::constructor::<Outer>());
    outer.install(inner);

    let injector = Injector::new(normalize(outer, &[TypeId::of::<Outer>()]));
    injector.get::<Outer>();
    assert!(injector.unsafe_get::<Inner>().is_some());
}

mod runtime_failures {
    pub struct Unregistered;

    pub struct Flaky;
}

#[test]
#[should_panic(expected = "no binding was provided for the type")]
fn requesting_an_unbound_type_is_fatal() {
    use runtime_failures::Unregistered;

    let injector = Injector::new(normalize(ComponentStorage::new(), &[]));
    injector.get::<Unregistered>();
}

#[test]
#[should_panic(expected = "returned a null pointer")]
fn a_provider_returning_a_null_pointer_is_fatal() {
    use graft::component::entry::{Allocation, ObjectPtr};
    use graft::graph::NodeIndex;
    use graft::injector::InjectorStorage;
    use runtime_failures::Flaky;

    unsafe fn never_build(_: &InjectorStorage, _: NodeIndex) -> ObjectPtr {
        std::ptr::null()
    }

    let mut storage = ComponentStorage::new();
    storage.append(ComponentStorageEntry::provider(
        TypeId::of::<Flaky>(),
        &[],
        never_build,
        Allocation::NoAllocation,
    ));
    let injector = Injector::new(normalize(storage, &[TypeId::of::<Flaky>()]));
    injector.get::<Flaky>();
}
