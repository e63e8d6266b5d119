//! Data context options and environment naming.
//!
//! # Responsibility
//! - Carry connection-level settings consumed by `SqliteDataContext`.
//! - Normalize the environment name handed to engine configurators.
//!
//! # Invariants
//! - Every option has a default, so partial documents deserialize.
//! - Environment names are never empty after normalization.

use crate::context::IsolationLevel;
use serde::{Deserialize, Serialize};

/// Environment used when the host does not name one.
pub const DEFAULT_ENVIRONMENT: &str = "Production";
/// SQLite busy handler timeout.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Connection settings for a SQLite-backed data context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Enables `PRAGMA foreign_keys`.
    pub foreign_keys: bool,
    /// Isolation used when `begin_transaction` is called without one.
    pub default_isolation: IsolationLevel,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            foreign_keys: true,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

/// Trims `name`; blank input maps to `DEFAULT_ENVIRONMENT`.
pub fn normalize_environment(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_ENVIRONMENT.to_string()
    } else {
        trimmed.to_string()
    }
}
