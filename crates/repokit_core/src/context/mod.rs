//! Data context contract and transaction scope.
//!
//! # Responsibility
//! - Define the storage session every repository talks to.
//! - Own the transaction handle lifecycle used by units of work.
//!
//! # Invariants
//! - A context is single-owner: shared through `Rc<RefCell<_>>`, never `Send`.
//! - At most one transaction is open per context.
//! - An open `TransactionHandle` rolls back when dropped.

use crate::model::entity::{EntityDescriptor, EntityKey, Record};
use crate::repo::RepoResult;
use log::{info, warn};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

mod sqlite;
pub mod tracker;

pub use sqlite::SqliteDataContext;
pub use tracker::{ChangeTracker, EntityState, EntrySnapshot, PendingChange};

/// Shared handle to a data context session.
pub type SharedContext = Rc<RefCell<dyn DataContext>>;
/// Non-owning handle held by repositories.
pub type WeakContext = Weak<RefCell<dyn DataContext>>;

/// Wraps a concrete context into a `SharedContext`.
pub fn share<C: DataContext + 'static>(context: C) -> SharedContext {
    Rc::new(RefCell::new(context))
}

/// Transaction isolation requested by a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Defer to the context's configured default.
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Replaces `Unspecified` with `fallback`.
    pub fn or(self, fallback: IsolationLevel) -> IsolationLevel {
        match self {
            Self::Unspecified => fallback,
            other => other,
        }
    }

    /// SQLite statement opening a transaction at this level.
    ///
    /// SQLite serializes writers, so weaker levels share `DEFERRED`;
    /// `RepeatableRead` takes the write lock up front and `Serializable`
    /// excludes readers too.
    pub fn begin_statement(self) -> &'static str {
        match self {
            Self::Unspecified | Self::ReadUncommitted | Self::ReadCommitted => "BEGIN DEFERRED;",
            Self::RepeatableRead => "BEGIN IMMEDIATE;",
            Self::Serializable => "BEGIN EXCLUSIVE;",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::ReadUncommitted => "read_uncommitted",
            Self::ReadCommitted => "read_committed",
            Self::RepeatableRead => "repeatable_read",
            Self::Serializable => "serializable",
        }
    }
}

/// Storage session: entity loading, change tracking and transactions.
pub trait DataContext {
    /// Loads rows of one entity type, optionally filtered by key.
    fn load(&self, descriptor: &EntityDescriptor, key: Option<&EntityKey>)
        -> RepoResult<Vec<Record>>;

    /// Runs a raw read statement.
    fn query_raw(&self, sql: &str, params: &[Value]) -> RepoResult<Vec<Record>>;

    fn tracker(&self) -> &ChangeTracker;

    fn tracker_mut(&mut self) -> &mut ChangeTracker;

    /// Persists pending tracker changes and returns the affected row count.
    /// On failure nothing is persisted and tracker state is left untouched.
    fn flush(&mut self) -> RepoResult<usize>;

    fn begin_transaction(&mut self, isolation: IsolationLevel) -> RepoResult<()>;

    fn commit_transaction(&mut self) -> RepoResult<()>;

    /// Discards the open transaction and every tracked change.
    fn rollback_transaction(&mut self) -> RepoResult<()>;

    fn in_transaction(&self) -> bool;
}

/// Live transaction on a shared context.
///
/// Released by `commit` or `rollback`; dropping an open handle rolls back.
pub struct TransactionHandle {
    context: SharedContext,
    isolation: IsolationLevel,
    open: bool,
}

impl TransactionHandle {
    pub fn begin(context: &SharedContext, isolation: IsolationLevel) -> RepoResult<Self> {
        context.borrow_mut().begin_transaction(isolation)?;
        info!(
            "event=ctx_tx_begin module=context status=ok isolation={}",
            isolation.as_str()
        );
        Ok(Self {
            context: Rc::clone(context),
            isolation,
            open: true,
        })
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Commits. The handle stays open when the commit fails.
    pub fn commit(&mut self) -> RepoResult<()> {
        if !self.open {
            return Ok(());
        }
        self.context.borrow_mut().commit_transaction()?;
        self.open = false;
        info!("event=ctx_tx_commit module=context status=ok");
        Ok(())
    }

    pub fn rollback(&mut self) -> RepoResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let result = self.context.borrow_mut().rollback_transaction();
        match &result {
            Ok(()) => info!("event=ctx_tx_rollback module=context status=ok"),
            Err(err) => warn!(
                "event=ctx_tx_rollback module=context status=error error={}",
                err
            ),
        }
        result
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        match self.context.try_borrow_mut() {
            Ok(mut context) => match context.rollback_transaction() {
                Ok(()) => info!("event=ctx_tx_rollback module=context status=ok reason=drop"),
                Err(err) => warn!(
                    "event=ctx_tx_rollback module=context status=error reason=drop error={}",
                    err
                ),
            },
            Err(_) => warn!(
                "event=ctx_tx_rollback module=context status=skipped reason=context_borrowed"
            ),
        }
    }
}
