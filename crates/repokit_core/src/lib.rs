//! Generic persistence access: typed repositories, units of work and a
//! component resolver, over a pluggable data context.

pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod logging;
pub mod model;
pub mod repo;
pub mod uow;

pub use config::{normalize_environment, ContextOptions, DEFAULT_ENVIRONMENT};
pub use context::{
    share, ChangeTracker, DataContext, EntityState, IsolationLevel, SharedContext,
    SqliteDataContext, TransactionHandle,
};
pub use db::{DbError, DbResult, Migration};
pub use engine::{
    configure_engine, Configurator, ConfiguratorEntry, Constructible, Constructor, Engine,
    EngineContext, LinkedTypeFinder, ResolveError, ResolveResult, ServiceCollection,
    ServiceEngine, ServiceKey, StaticTypeFinder, TypeFinder, CONFIGURATORS,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{Entity, EntityDescriptor, EntityKey, KeyPart, Record};
pub use repo::{
    register_sql_repository, Include, RepoError, RepoResult, Repository, RepositoryBase,
    SqlRepository,
};
pub use rusqlite::types::Value;
pub use tokio_util::sync::CancellationToken;
pub use uow::{RepositoryHandle, RepositoryView, UnitOfWork, UowError, UowResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
