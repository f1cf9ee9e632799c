use std::sync::Arc;

use crate::error::Result;
use crate::work::SizedUnit;
use crate::worker::{SingleUnitAdapter, SingleUnitProcessor, WorkerCtx};

use super::*;

type Unit = SizedUnit<u32>;

struct Noop;

impl SingleUnitProcessor<Unit> for Noop {
    fn process(&mut self, _ctx: &WorkerCtx<Unit>, _unit: Unit) -> Result<()> {
        Ok(())
    }
}

#[test]
fn named_object_collection_round_trips_by_type_and_name() {
    let mut objects = NamedObjectCollection::new();
    objects.insert("greeting", Arc::new("hello".to_string()));
    objects.insert("count", Arc::new(42u32));

    assert_eq!(*objects.get::<String>("greeting").unwrap(), "hello");
    assert_eq!(*objects.get::<u32>("count").unwrap(), 42);
    assert!(objects.get::<u32>("greeting").is_none());
    assert!(objects.get::<String>("missing").is_none());
}

#[test]
fn construct_resolves_the_registered_triple() {
    let mut factory: WorkerFactory<Unit> = WorkerFactory::new(NamedObjectCollection::new());
    factory.register("sort", "mapper", "default", |_objects| {
        Ok(Box::new(SingleUnitAdapter::new(Noop)))
    });

    assert!(factory.construct("sort", "mapper", "default").is_ok());
}

#[test]
fn construct_fails_for_an_unregistered_triple() {
    let factory: WorkerFactory<Unit> = WorkerFactory::new(NamedObjectCollection::new());
    let err = factory.construct("sort", "mapper", "default").unwrap_err();
    assert!(matches!(
        err,
        crate::error::ThemisError::UnknownWorkerImplementation { .. }
    ));
}

#[test]
fn caching_allocator_wrapped_constructor_can_reach_its_pool() {
    let mut factory: WorkerFactory<Unit> = WorkerFactory::new(NamedObjectCollection::new());
    factory.register_with_caching_allocator(
        "sort",
        "reducer",
        "default",
        "reducer-pool",
        crate::caching_allocator::CachingAllocator::new(2, 128),
        |objects| {
            let pool = objects
                .get::<crate::caching_allocator::CachingAllocator>("reducer-pool")
                .expect("pool registered by register_with_caching_allocator");
            assert_eq!(pool.capacity(), 2);
            Ok(Box::new(SingleUnitAdapter::new(Noop)))
        },
    );

    assert!(factory.construct("sort", "reducer", "default").is_ok());
}
