//! Repository layer abstractions and the SQLite-backed implementation.
//!
//! # Responsibility
//! - Define the typed repository contract (`Repository<E>`) used by callers.
//! - Keep change tracking and flushing behind the data context boundary.
//!
//! # Invariants
//! - Writes validate entities before they reach the tracker.
//! - Mutating calls auto-flush unless the repository is inside a transaction.
//! - Repositories never own their data context.

use crate::db::DbError;
use crate::model::entity::EntityKey;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod repository;
mod sql_repository;

pub use repository::{Include, Repository, RepositoryBase};
pub use sql_repository::{register_sql_repository, SqlRepository};

pub type RepoResult<T> = Result<T, RepoError>;

/// Error for repository and data context operations.
#[derive(Debug)]
pub enum RepoError {
    /// `Entity::validate` rejected a write.
    Validation {
        entity: &'static str,
        message: String,
    },
    Db(DbError),
    /// A single-result read matched more than one entity.
    AmbiguousResult {
        entity: &'static str,
        matches: usize,
    },
    KeyArity {
        entity: &'static str,
        expected: usize,
        actual: usize,
    },
    DuplicateKey {
        entity: &'static str,
        key: EntityKey,
    },
    /// An update or delete found no stored row.
    StaleEntity {
        entity: &'static str,
        key: EntityKey,
    },
    InvalidData(String),
    UnsupportedOperation(&'static str),
    /// The repository's data context has been released.
    Unbound(&'static str),
    Cancelled,
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { entity, message } => {
                write!(f, "invalid {entity} entity: {message}")
            }
            Self::Db(err) => write!(f, "{err}"),
            Self::AmbiguousResult { entity, matches } => {
                write!(f, "expected at most one {entity} entity, found {matches}")
            }
            Self::KeyArity {
                entity,
                expected,
                actual,
            } => write!(
                f,
                "{entity} key expects {expected} component(s), got {actual}"
            ),
            Self::DuplicateKey { entity, key } => {
                write!(f, "{entity} entity with key {key} is already tracked")
            }
            Self::StaleEntity { entity, key } => {
                write!(f, "{entity} entity with key {key} no longer exists in storage")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::UnsupportedOperation(operation) => {
                write!(f, "unsupported operation: {operation}")
            }
            Self::Unbound(repository) => {
                write!(f, "{repository} is not bound to a live data context")
            }
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}
