//! Default engine: an immutable provider built once from a service collection.
//!
//! # Invariants
//! - The provider is set at most once; later `initialize` calls fail.
//! - An uninitialized engine resolves nothing.
//! - A type already being resolved on the current thread is reported as a
//!   cycle instead of re-entering its factory.

use super::collection::{ServiceCollection, ServiceDescriptor};
use super::{Engine, Instance, ResolveError, ResolveResult, ServiceKey};
use crate::config::normalize_environment;
use log::info;
use once_cell::sync::OnceCell;
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static RESOLVING: RefCell<Vec<TypeId>> = const { RefCell::new(Vec::new()) };
}

struct ServiceProvider {
    environment: String,
    descriptors: Vec<ServiceDescriptor>,
    index: HashMap<ServiceKey, Vec<usize>>,
}

impl ServiceProvider {
    fn build(services: ServiceCollection, environment: String) -> Self {
        let descriptors = services.into_descriptors();
        let mut index: HashMap<ServiceKey, Vec<usize>> = HashMap::new();
        for (position, descriptor) in descriptors.iter().enumerate() {
            index.entry(descriptor.key).or_default().push(position);
        }
        Self {
            environment,
            descriptors,
            index,
        }
    }

    fn positions(&self, key: &ServiceKey) -> &[usize] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// `Engine` backed by a `ServiceCollection`.
#[derive(Default)]
pub struct ServiceEngine {
    provider: OnceCell<ServiceProvider>,
}

impl ServiceEngine {
    /// Uninitialized engine; resolves nothing until `initialize`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine initialized with `services`.
    pub fn with_services(services: ServiceCollection, environment: &str) -> Self {
        let provider = OnceCell::new();
        let _ = provider.set(ServiceProvider::build(
            services,
            normalize_environment(environment),
        ));
        Self { provider }
    }

    fn invoke(&self, descriptor: &ServiceDescriptor) -> ResolveResult<Instance> {
        let _guard = ResolutionGuard::enter(descriptor.key)?;
        (descriptor.factory)(self as &dyn Engine)
    }
}

impl Engine for ServiceEngine {
    fn initialize(&self, services: ServiceCollection, environment: &str) -> ResolveResult<()> {
        let environment = normalize_environment(environment);
        let registrations = services.len();
        self.provider
            .set(ServiceProvider::build(services, environment.clone()))
            .map_err(|_| ResolveError::AlreadyInitialized)?;
        info!(
            "event=engine_init module=engine status=ok environment={} registrations={}",
            environment, registrations
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.provider.get().is_some()
    }

    fn environment(&self) -> Option<&str> {
        self.provider
            .get()
            .map(|provider| provider.environment.as_str())
    }

    fn resolve_key(&self, key: ServiceKey) -> ResolveResult<Instance> {
        let provider = self
            .provider
            .get()
            .ok_or(ResolveError::NotRegistered(key.name()))?;
        let position = provider
            .positions(&key)
            .last()
            .copied()
            .ok_or(ResolveError::NotRegistered(key.name()))?;
        self.invoke(&provider.descriptors[position])
    }

    fn resolve_all_keys(&self, key: ServiceKey) -> ResolveResult<Vec<Instance>> {
        let Some(provider) = self.provider.get() else {
            return Ok(Vec::new());
        };
        provider
            .positions(&key)
            .iter()
            .map(|position| self.invoke(&provider.descriptors[*position]))
            .collect()
    }

    fn is_registered(&self, key: ServiceKey) -> bool {
        self.provider
            .get()
            .is_some_and(|provider| !provider.positions(&key).is_empty())
    }
}

/// Marks a service as in-flight on this thread until dropped.
struct ResolutionGuard;

impl ResolutionGuard {
    fn enter(key: ServiceKey) -> ResolveResult<Self> {
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&key.id()) {
                return Err(ResolveError::Cycle(key.name()));
            }
            stack.push(key.id());
            Ok(ResolutionGuard)
        })
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
