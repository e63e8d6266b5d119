//! Configurator discovery.
//!
//! Components contribute registrations by submitting a `ConfiguratorEntry`
//! to the `CONFIGURATORS` distributed slice:
//!
//! ```ignore
//! #[linkme::distributed_slice(CONFIGURATORS)]
//! static STORAGE: ConfiguratorEntry = ConfiguratorEntry {
//!     name: "storage",
//!     create: || Box::new(StorageConfigurator),
//! };
//! ```
//!
//! # Invariants
//! - Configurators run in ascending `order()`; equal orders keep discovery order.
//! - Every configurator runs before the engine provider is built.

use super::collection::ServiceCollection;
use super::{Engine, ResolveResult};
use crate::config::normalize_environment;
use log::{debug, info};

/// Contributes registrations to a service collection.
pub trait Configurator: Send + Sync {
    /// Lower values run first.
    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn register(&self, services: &mut ServiceCollection, environment: &str);
}

/// Link-time registration record for a configurator.
pub struct ConfiguratorEntry {
    pub name: &'static str,
    pub create: fn() -> Box<dyn Configurator>,
}

// Filled at link time by `#[linkme::distributed_slice(CONFIGURATORS)]` statics.
#[linkme::distributed_slice]
pub static CONFIGURATORS: [ConfiguratorEntry] = [..];

/// Source of configurators for `configure_engine`.
pub trait TypeFinder {
    fn find_configurators(&self) -> Vec<Box<dyn Configurator>>;
}

/// Finds configurators submitted to `CONFIGURATORS`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkedTypeFinder;

impl TypeFinder for LinkedTypeFinder {
    fn find_configurators(&self) -> Vec<Box<dyn Configurator>> {
        CONFIGURATORS
            .iter()
            .map(|entry| {
                debug!(
                    "event=type_finder module=engine status=found configurator={}",
                    entry.name
                );
                (entry.create)()
            })
            .collect()
    }
}

/// Finder over an explicit factory list.
#[derive(Default)]
pub struct StaticTypeFinder {
    factories: Vec<fn() -> Box<dyn Configurator>>,
}

impl StaticTypeFinder {
    pub fn new(factories: Vec<fn() -> Box<dyn Configurator>>) -> Self {
        Self { factories }
    }
}

impl TypeFinder for StaticTypeFinder {
    fn find_configurators(&self) -> Vec<Box<dyn Configurator>> {
        self.factories.iter().map(|create| create()).collect()
    }
}

/// Runs every discovered configurator against `services`, then initializes
/// `engine` with the result.
pub fn configure_engine(
    engine: &dyn Engine,
    mut services: ServiceCollection,
    finder: &dyn TypeFinder,
    environment: &str,
) -> ResolveResult<()> {
    let environment = normalize_environment(environment);
    let mut configurators = finder.find_configurators();
    configurators.sort_by_key(|configurator| configurator.order());

    for configurator in &configurators {
        let before = services.len();
        configurator.register(&mut services, &environment);
        info!(
            "event=configure_engine module=engine status=ok configurator={} order={} added={}",
            configurator.name(),
            configurator.order(),
            services.len() - before
        );
    }

    engine.initialize(services, &environment)
}

#[cfg(test)]
mod tests {
    use super::{configure_engine, Configurator, StaticTypeFinder};
    use crate::engine::{Engine, ServiceCollection, ServiceEngine};
    use std::sync::Arc;

    struct Base;
    struct Override;

    impl Configurator for Base {
        fn register(&self, services: &mut ServiceCollection, _environment: &str) {
            services.add_singleton(String::from("base"));
        }
    }

    impl Configurator for Override {
        fn order(&self) -> i32 {
            10
        }

        fn register(&self, services: &mut ServiceCollection, environment: &str) {
            services.add_singleton(format!("override:{environment}"));
        }
    }

    fn base() -> Box<dyn Configurator> {
        Box::new(Base)
    }

    fn overriding() -> Box<dyn Configurator> {
        Box::new(Override)
    }

    #[test]
    fn configurators_run_in_order_before_initialize() {
        let factories: Vec<fn() -> Box<dyn Configurator>> = vec![overriding, base];
        let finder = StaticTypeFinder::new(factories);
        let engine: Arc<dyn Engine> = Arc::new(ServiceEngine::new());

        configure_engine(engine.as_ref(), ServiceCollection::new(), &finder, "Staging").unwrap();

        assert_eq!(engine.environment(), Some("Staging"));
        assert_eq!(engine.resolve::<String>().unwrap(), "override:Staging");
        assert_eq!(
            engine.resolve_all::<String>().unwrap(),
            vec!["base".to_string(), "override:Staging".to_string()]
        );
    }
}
