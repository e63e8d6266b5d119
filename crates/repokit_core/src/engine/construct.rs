//! Constructor-table fallback for unregistered types.
//!
//! # Responsibility
//! - Describe how a type can be built from other resolvable services.
//! - Pick the richest constructor whose parameters all resolve.
//!
//! # Invariants
//! - Constructors are tried by descending parameter count; ties keep
//!   declaration order.
//! - Every parameter is resolved through the engine, never constructed
//!   recursively from its own table.

use super::{downcast, Engine, Instance, ResolveError, ResolveResult, ServiceKey};
use log::{debug, warn};
use std::any::type_name;
use std::collections::VecDeque;

/// Resolved constructor arguments, consumed in declaration order.
pub struct Arguments {
    values: VecDeque<Instance>,
}

impl Arguments {
    /// Takes the next argument.
    ///
    /// # Errors
    /// - `TypeMismatch` when the arguments are exhausted or the next one has
    ///   another type.
    pub fn next<T: 'static>(&mut self) -> ResolveResult<T> {
        let value = self.values.pop_front().ok_or(ResolveError::TypeMismatch {
            expected: type_name::<T>(),
        })?;
        downcast(value)
    }
}

/// One way to build `T`.
pub struct Constructor<T> {
    name: &'static str,
    params: Vec<ServiceKey>,
    build: fn(&mut Arguments) -> ResolveResult<T>,
}

impl<T> Constructor<T> {
    pub fn new(name: &'static str, build: fn(&mut Arguments) -> ResolveResult<T>) -> Self {
        Self {
            name,
            params: Vec::new(),
            build,
        }
    }

    /// Appends a parameter resolved as service `A`.
    pub fn param<A: ?Sized + 'static>(mut self) -> Self {
        self.params.push(ServiceKey::of::<A>());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    fn invoke(&self, engine: &dyn Engine) -> ResolveResult<T> {
        let mut values = VecDeque::with_capacity(self.params.len());
        for key in &self.params {
            values.push_back(engine.resolve_key(*key)?);
        }
        (self.build)(&mut Arguments { values })
    }
}

/// Types the engine can build without a registration.
pub trait Constructible: Sized + 'static {
    fn constructors() -> Vec<Constructor<Self>>;
}

/// Builds `T` with the first satisfiable constructor, richest first.
///
/// # Errors
/// - `Construction` carrying the last constructor failure when none succeeds.
pub fn construct<T: Constructible>(engine: &dyn Engine) -> ResolveResult<T> {
    let service = type_name::<T>();
    let mut constructors = T::constructors();
    constructors.sort_by(|left, right| right.arity().cmp(&left.arity()));

    let mut last_error = None;
    for constructor in &constructors {
        match constructor.invoke(engine) {
            Ok(value) => {
                debug!(
                    "event=resolve_unregistered module=engine status=ok service={} constructor={}",
                    service,
                    constructor.name()
                );
                return Ok(value);
            }
            Err(err) => {
                debug!(
                    "event=resolve_unregistered module=engine status=retry service={} constructor={} error={}",
                    service,
                    constructor.name(),
                    err
                );
                last_error = Some(err);
            }
        }
    }

    warn!(
        "event=resolve_unregistered module=engine status=error service={} attempted={}",
        service,
        constructors.len()
    );
    Err(ResolveError::Construction {
        service,
        source: last_error.map(Box::new),
    })
}
