//! Ordered registration list consumed by `Engine::initialize`.

use super::construct::{construct, Constructible};
use super::{Engine, Instance, ResolveResult, ServiceKey};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Builds one instance of a registered service.
pub type Factory = Arc<dyn Fn(&dyn Engine) -> ResolveResult<Instance> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Built on first resolve, then cloned out of the cache.
    Singleton,
    /// Built on every resolve.
    Transient,
}

#[derive(Clone)]
pub struct ServiceDescriptor {
    pub key: ServiceKey,
    pub lifetime: Lifetime,
    pub factory: Factory,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service", &self.key.name())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Registrations in the order they were made.
#[derive(Debug, Clone, Default)]
pub struct ServiceCollection {
    descriptors: Vec<ServiceDescriptor>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a ready-made value; every resolve returns a clone.
    pub fn add_singleton<T>(&mut self, value: T) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |_: &dyn Engine| -> ResolveResult<Instance> {
            Ok(Box::new(value.clone()))
        });
        self.push(ServiceKey::of::<T>(), Lifetime::Singleton, factory)
    }

    /// Registers a lazily built value, created once on first resolve.
    pub fn add_singleton_with<T, F>(&mut self, build: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&dyn Engine) -> ResolveResult<T> + Send + Sync + 'static,
    {
        let cell: OnceCell<T> = OnceCell::new();
        let factory: Factory = Arc::new(move |engine: &dyn Engine| -> ResolveResult<Instance> {
            let value = cell.get_or_try_init(|| build(engine))?;
            Ok(Box::new(value.clone()))
        });
        self.push(ServiceKey::of::<T>(), Lifetime::Singleton, factory)
    }

    /// Registers a factory invoked on every resolve.
    pub fn add_transient<T, F>(&mut self, build: F) -> &mut Self
    where
        T: 'static,
        F: Fn(&dyn Engine) -> ResolveResult<T> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |engine: &dyn Engine| -> ResolveResult<Instance> {
            Ok(Box::new(build(engine)?))
        });
        self.push(ServiceKey::of::<T>(), Lifetime::Transient, factory)
    }

    /// Registers `T` as transient, built from its constructor table.
    pub fn add_constructible<T: Constructible>(&mut self) -> &mut Self {
        self.add_transient::<T, _>(|engine| construct::<T>(engine))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        let key = ServiceKey::of::<T>();
        self.descriptors.iter().any(|descriptor| descriptor.key == key)
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    pub(crate) fn into_descriptors(self) -> Vec<ServiceDescriptor> {
        self.descriptors
    }

    fn push(&mut self, key: ServiceKey, lifetime: Lifetime, factory: Factory) -> &mut Self {
        self.descriptors.push(ServiceDescriptor {
            key,
            lifetime,
            factory,
        });
        self
    }
}
