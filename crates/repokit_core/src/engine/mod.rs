//! Service resolver ("engine") and component discovery.
//!
//! # Responsibility
//! - Build an immutable provider from an ordered `ServiceCollection`.
//! - Resolve typed components, falling back to constructor tables for
//!   types with no registration.
//! - Discover `Configurator`s linked into the binary.
//!
//! # Invariants
//! - A provider is built at most once per engine.
//! - `resolve` returns the last registration for a type; `resolve_all`
//!   returns every registration in registration order.
//! - Constructor-table fallback never mutates the provider.

use std::any::{type_name, Any, TypeId};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

mod collection;
mod construct;
mod context;
pub mod finder;
mod provider;

pub use collection::{Factory, Lifetime, ServiceCollection, ServiceDescriptor};
pub use construct::{construct, Arguments, Constructible, Constructor};
pub use context::EngineContext;
pub use finder::{
    configure_engine, Configurator, ConfiguratorEntry, LinkedTypeFinder, StaticTypeFinder,
    TypeFinder, CONFIGURATORS,
};
pub use provider::ServiceEngine;

/// Type-erased resolved component.
pub type Instance = Box<dyn Any>;

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Registry key: the `TypeId` of the service type plus its name for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug)]
pub enum ResolveError {
    NotRegistered(&'static str),
    /// No constructor of the service could be satisfied. `source` holds the
    /// failure of the last constructor attempted.
    Construction {
        service: &'static str,
        source: Option<Box<ResolveError>>,
    },
    /// The service is already being resolved further up the stack.
    Cycle(&'static str),
    TypeMismatch {
        expected: &'static str,
    },
    AlreadyInitialized,
    Factory {
        service: &'static str,
        message: String,
    },
}

impl ResolveError {
    /// Wraps a failure raised inside a registration factory.
    pub fn factory(service: &'static str, err: impl Display) -> Self {
        Self::Factory {
            service,
            message: err.to_string(),
        }
    }
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegistered(service) => write!(f, "no registration for `{service}`"),
            Self::Construction { service, source } => match source {
                Some(source) => write!(f, "cannot construct `{service}`: {source}"),
                None => write!(f, "cannot construct `{service}`: no constructors"),
            },
            Self::Cycle(service) => write!(f, "dependency cycle while resolving `{service}`"),
            Self::TypeMismatch { expected } => {
                write!(f, "resolved component is not a `{expected}`")
            }
            Self::AlreadyInitialized => write!(f, "engine is already initialized"),
            Self::Factory { service, message } => {
                write!(f, "factory for `{service}` failed: {message}")
            }
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Construction {
                source: Some(source),
                ..
            } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Process-wide component resolver.
pub trait Engine: Send + Sync {
    /// Builds the provider from `services`. Fails if already initialized.
    fn initialize(&self, services: ServiceCollection, environment: &str) -> ResolveResult<()>;

    fn is_initialized(&self) -> bool;

    /// Environment name given to `initialize`.
    fn environment(&self) -> Option<&str>;

    /// Last registration for `key`.
    fn resolve_key(&self, key: ServiceKey) -> ResolveResult<Instance>;

    /// Every registration for `key`, in registration order.
    fn resolve_all_keys(&self, key: ServiceKey) -> ResolveResult<Vec<Instance>>;

    fn is_registered(&self, key: ServiceKey) -> bool;
}

impl<'e> dyn Engine + 'e {
    pub fn resolve<T: 'static>(&self) -> ResolveResult<T> {
        downcast(self.resolve_key(ServiceKey::of::<T>())?)
    }

    pub fn resolve_all<T: 'static>(&self) -> ResolveResult<Vec<T>> {
        self.resolve_all_keys(ServiceKey::of::<T>())?
            .into_iter()
            .map(downcast)
            .collect()
    }

    /// Builds `T` from its constructor table, ignoring any registration for `T`.
    pub fn resolve_unregistered<T: Constructible>(&self) -> ResolveResult<T> {
        construct::<T>(self)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.is_registered(ServiceKey::of::<T>())
    }
}

pub(crate) fn downcast<T: 'static>(instance: Instance) -> ResolveResult<T> {
    instance
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| ResolveError::TypeMismatch {
            expected: type_name::<T>(),
        })
}
