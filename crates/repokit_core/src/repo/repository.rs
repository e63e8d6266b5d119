//! Typed repository contract.
//!
//! # Responsibility
//! - Declare the CRUD and query surface every repository offers.
//! - Provide cancellable async variants on top of the sync operations.
//!
//! # Invariants
//! - Async variants observe cancellation before and after their suspension
//!   point and never hold a context borrow across it.
//! - `execute_sql_command` always fails with `UnsupportedOperation`.

use super::{RepoError, RepoResult};
use crate::context::{DataContext, SharedContext};
use crate::model::entity::{Entity, EntityKey};
use async_trait::async_trait;
use rusqlite::types::Value;
use tokio_util::sync::CancellationToken;

/// Eager loader applied to each materialized entity.
pub type Include<E> = fn(&mut E, &dyn DataContext) -> RepoResult<()>;

/// Entity-agnostic part of a repository, used by units of work.
pub trait RepositoryBase {
    /// Display name used in diagnostics.
    fn name(&self) -> &'static str;

    /// When true, mutating calls leave flushing to the unit of work.
    fn has_transaction(&self) -> bool;

    fn set_has_transaction(&self, value: bool);

    /// The bound context, if it is still alive.
    fn context(&self) -> Option<SharedContext>;

    fn set_context(&self, context: &SharedContext);
}

/// Typed access to one entity collection.
#[async_trait(?Send)]
pub trait Repository<E: Entity>: RepositoryBase {
    /// Blank, untracked instance.
    fn create(&self) -> E {
        E::default()
    }

    /// Runs a raw read statement and materializes untracked entities.
    fn sql_query(&self, sql: &str, params: &[Value]) -> RepoResult<Vec<E>>;

    /// Raw write statements are not supported.
    fn execute_sql_command(&self, _sql: &str, _params: &[Value]) -> RepoResult<usize> {
        Err(RepoError::UnsupportedOperation("execute_sql_command"))
    }

    fn get_all(&self, includes: &[Include<E>]) -> RepoResult<Vec<E>>;

    fn get_list(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
    ) -> RepoResult<Vec<E>>;

    fn get_all_read_only(&self, includes: &[Include<E>]) -> RepoResult<Vec<E>>;

    fn get_list_read_only(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
    ) -> RepoResult<Vec<E>>;

    /// Looks up one entity by key. Pending inserts are not visible.
    fn get_by_id(&self, key: &EntityKey) -> RepoResult<Option<E>>;

    /// Single match or `None`; more than one match is an error.
    fn get(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
    ) -> RepoResult<Option<E>> {
        let mut matches = self.get_list(predicate, includes)?;
        match matches.len() {
            0 | 1 => Ok(matches.pop()),
            count => Err(RepoError::AmbiguousResult {
                entity: E::descriptor().table,
                matches: count,
            }),
        }
    }

    fn add(&self, entity: E) -> RepoResult<E>;

    fn add_range(&self, entities: Vec<E>) -> RepoResult<Vec<E>>;

    fn update(&self, entity: E) -> RepoResult<E>;

    fn update_range(&self, entities: Vec<E>) -> RepoResult<Vec<E>>;

    /// Schedules removal. Returns `None` when the entity was only pending
    /// insertion and has simply been detached.
    fn delete(&self, entity: E) -> RepoResult<Option<E>>;

    /// Returns the entities scheduled for removal from storage.
    fn delete_range(&self, entities: Vec<E>) -> RepoResult<Vec<E>>;

    async fn sql_query_async(
        &self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.sql_query(sql, params)
    }

    async fn execute_sql_command_async(
        &self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> RepoResult<usize> {
        suspend_point(cancel).await?;
        self.execute_sql_command(sql, params)
    }

    async fn get_all_async(
        &self,
        includes: &[Include<E>],
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.get_all(includes)
    }

    async fn get_list_async(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.get_list(predicate, includes)
    }

    async fn get_all_read_only_async(
        &self,
        includes: &[Include<E>],
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.get_all_read_only(includes)
    }

    async fn get_list_read_only_async(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.get_list_read_only(predicate, includes)
    }

    async fn get_by_id_async(
        &self,
        key: &EntityKey,
        cancel: &CancellationToken,
    ) -> RepoResult<Option<E>> {
        suspend_point(cancel).await?;
        self.get_by_id(key)
    }

    async fn get_async(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
        cancel: &CancellationToken,
    ) -> RepoResult<Option<E>> {
        suspend_point(cancel).await?;
        self.get(predicate, includes)
    }

    async fn add_async(&self, entity: E, cancel: &CancellationToken) -> RepoResult<E> {
        suspend_point(cancel).await?;
        self.add(entity)
    }

    async fn add_range_async(
        &self,
        entities: Vec<E>,
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.add_range(entities)
    }

    async fn update_async(&self, entity: E, cancel: &CancellationToken) -> RepoResult<E> {
        suspend_point(cancel).await?;
        self.update(entity)
    }

    async fn update_range_async(
        &self,
        entities: Vec<E>,
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.update_range(entities)
    }

    async fn delete_async(&self, entity: E, cancel: &CancellationToken) -> RepoResult<Option<E>> {
        suspend_point(cancel).await?;
        self.delete(entity)
    }

    async fn delete_range_async(
        &self,
        entities: Vec<E>,
        cancel: &CancellationToken,
    ) -> RepoResult<Vec<E>> {
        suspend_point(cancel).await?;
        self.delete_range(entities)
    }
}

/// Yields once to the executor, failing if `cancel` fires on either side.
pub(crate) async fn suspend_point(cancel: &CancellationToken) -> RepoResult<()> {
    if cancel.is_cancelled() {
        return Err(RepoError::Cancelled);
    }
    tokio::task::yield_now().await;
    if cancel.is_cancelled() {
        return Err(RepoError::Cancelled);
    }
    Ok(())
}
