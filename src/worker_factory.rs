//! Worker factory and named-object registry (`core/ImplementationList.{h,cc}`,
//! `core/NamedObjectCollection.{h,cc}`, spec §4.6.4): resolves
//! `(application, worker_type, implementation)` triples to constructors,
//! and injects named dependencies (sockets, shared maps, disk lists, the
//! partition-function table) into them by name.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::caching_allocator::CachingAllocator;
use crate::error::{Result, ThemisError};
use crate::work::WorkUnit;
use crate::worker::Worker;

/// A named bag of type-erased dependencies a worker constructor may pull
/// from (spec §4.6.4: "inject dependencies... into constructors by name
/// and optional scope"). Optional scoping is modeled as a dotted prefix
/// on the name (`"phase.stage.name"`) rather than a separate mechanism,
/// since that is all a scope amounts to once names are just strings.
#[derive(Default)]
pub struct NamedObjectCollection {
    objects: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl NamedObjectCollection {
    /// An empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object under `name`. Overwrites any previous
    /// registration under the same name.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: Arc<T>) {
        self.objects.insert(name.into(), value);
    }

    /// Fetch and downcast the object registered under `name`. Returns
    /// `None` if nothing is registered, or if it was registered under a
    /// different concrete type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.objects.get(name)?.clone().downcast::<T>().ok()
    }
}

/// A constructor: given the shared dependency bag, build a boxed worker.
pub type WorkerConstructor<T> =
    Box<dyn Fn(&NamedObjectCollection) -> Result<Box<dyn Worker<T>>> + Send + Sync>;

/// Registry from `(application, worker_type, implementation)` to a
/// constructor (spec §4.6.4). `application` is typically the phase name
/// and `worker_type` the stage name, but neither is otherwise interpreted
/// by the factory itself.
pub struct WorkerFactory<T: WorkUnit> {
    constructors: HashMap<(String, String, String), WorkerConstructor<T>>,
    objects: NamedObjectCollection,
}

impl<T: WorkUnit> WorkerFactory<T> {
    /// A factory with no registered constructors, owning `objects` as its
    /// named-dependency bag.
    pub fn new(objects: NamedObjectCollection) -> Self {
        Self {
            constructors: HashMap::new(),
            objects,
        }
    }

    /// The dependency bag constructors are built against.
    pub fn objects(&self) -> &NamedObjectCollection {
        &self.objects
    }

    /// Register a constructor under `(application, worker_type,
    /// implementation)`.
    pub fn register(
        &mut self,
        application: impl Into<String>,
        worker_type: impl Into<String>,
        implementation: impl Into<String>,
        constructor: impl Fn(&NamedObjectCollection) -> Result<Box<dyn Worker<T>>> + Send + Sync + 'static,
    ) {
        self.constructors.insert(
            (application.into(), worker_type.into(), implementation.into()),
            Box::new(constructor),
        );
    }

    /// Register under `(application, worker_type, "caching")`-style
    /// implementation names that also need a preallocated buffer pool
    /// (spec §4.6.4: "the factory may wrap the constructor in a caching
    /// allocator"). `name` is the key constructors use to pull the pool
    /// back out of the dependency bag via [`NamedObjectCollection::get`].
    pub fn register_with_caching_allocator(
        &mut self,
        application: impl Into<String>,
        worker_type: impl Into<String>,
        implementation: impl Into<String>,
        pool_object_name: impl Into<String>,
        pool: CachingAllocator,
        constructor: impl Fn(&NamedObjectCollection) -> Result<Box<dyn Worker<T>>> + Send + Sync + 'static,
    ) {
        self.objects.insert(pool_object_name, Arc::new(pool));
        self.register(application, worker_type, implementation, constructor);
    }

    /// Build a worker from the registered constructor for the given
    /// triple. Fails with [`ThemisError::UnknownWorkerImplementation`] if
    /// nothing was ever registered under it.
    pub fn construct(
        &self,
        application: &str,
        worker_type: &str,
        implementation: &str,
    ) -> Result<Box<dyn Worker<T>>> {
        let key = (
            application.to_string(),
            worker_type.to_string(),
            implementation.to_string(),
        );
        let constructor = self.constructors.get(&key).ok_or_else(|| {
            ThemisError::UnknownWorkerImplementation {
                application: application.to_string(),
                worker_type: worker_type.to_string(),
                implementation: implementation.to_string(),
            }
        })?;
        constructor(&self.objects)
    }
}

#[cfg(test)]
#[path = "worker_factory.test.rs"]
mod tests;
