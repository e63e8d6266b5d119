//! Unit of work: one data context, one transaction scope, many repositories.
//!
//! # Responsibility
//! - Hand out repositories bound to a shared data context, cached per type.
//! - Coordinate the transaction flag of every repository it owns.
//! - Persist staged changes atomically on `commit`.
//!
//! # Invariants
//! - Every cached repository carries the unit of work's transaction flag.
//! - At most one transaction handle is live; it is released by `commit`,
//!   `rollback` or drop.
//! - The flag is `false` after `commit` and `rollback`, whatever the outcome.

use crate::context::{IsolationLevel, SharedContext, TransactionHandle};
use crate::engine::{Engine, EngineContext, ResolveError};
use crate::model::entity::Entity;
use crate::repo::{RepoError, RepoResult, Repository, RepositoryBase, SqlRepository};
use log::{error, info, warn};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

pub type UowResult<T> = Result<T, UowError>;

#[derive(Debug)]
pub enum UowError {
    /// The engine could not supply a repository.
    Resolve(ResolveError),
    /// Commit failed; the transaction was rolled back.
    Transaction(RepoError),
    /// The data context refused a transaction operation.
    Context(RepoError),
}

impl Display for UowError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve(err) => write!(f, "repository resolution failed: {err}"),
            Self::Transaction(err) => write!(f, "transaction failed and was rolled back: {err}"),
            Self::Context(err) => write!(f, "data context error: {err}"),
        }
    }
}

impl Error for UowError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Resolve(err) => Some(err),
            Self::Transaction(err) | Self::Context(err) => Some(err),
        }
    }
}

impl From<ResolveError> for UowError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

/// Cloneable handle to a repository, cached by the unit of work under its
/// own type.
pub trait RepositoryHandle: Clone + 'static {
    fn repository_name(&self) -> &'static str;
    fn has_transaction(&self) -> bool;
    fn set_has_transaction(&self, value: bool);
    fn repository_context(&self) -> Option<SharedContext>;
    fn set_context(&self, context: &SharedContext);
}

impl<R: RepositoryBase + ?Sized + 'static> RepositoryHandle for Rc<R> {
    fn repository_name(&self) -> &'static str {
        (**self).name()
    }

    fn has_transaction(&self) -> bool {
        (**self).has_transaction()
    }

    fn set_has_transaction(&self, value: bool) {
        (**self).set_has_transaction(value);
    }

    fn repository_context(&self) -> Option<SharedContext> {
        (**self).context()
    }

    fn set_context(&self, context: &SharedContext) {
        (**self).set_context(context);
    }
}

/// Read-only view of a repository cached by a unit of work.
pub trait RepositoryView {
    fn name(&self) -> &'static str;
    fn has_transaction(&self) -> bool;
    /// The bound context, if it is still alive.
    fn context(&self) -> Option<SharedContext>;
}

trait CachedHandle: RepositoryView {
    fn as_any(&self) -> &dyn Any;
    fn view(&self) -> &dyn RepositoryView;
    fn stamp(&self, has_transaction: bool);
}

struct Cached<H>(H);

impl<H: RepositoryHandle> RepositoryView for Cached<H> {
    fn name(&self) -> &'static str {
        self.0.repository_name()
    }

    fn has_transaction(&self) -> bool {
        self.0.has_transaction()
    }

    fn context(&self) -> Option<SharedContext> {
        self.0.repository_context()
    }
}

impl<H: RepositoryHandle> CachedHandle for Cached<H> {
    fn as_any(&self) -> &dyn Any {
        &self.0
    }

    fn view(&self) -> &dyn RepositoryView {
        self
    }

    fn stamp(&self, has_transaction: bool) {
        self.0.set_has_transaction(has_transaction);
    }
}

pub struct UnitOfWork {
    id: Uuid,
    context: SharedContext,
    engine: Arc<dyn Engine>,
    repositories: HashMap<TypeId, Box<dyn CachedHandle>>,
    transaction: Option<TransactionHandle>,
    has_transaction: bool,
}

impl UnitOfWork {
    /// Unit of work resolving repositories through `EngineContext::current()`.
    pub fn new(context: SharedContext) -> Self {
        Self::with_engine(context, EngineContext::current())
    }

    pub fn with_engine(context: SharedContext, engine: Arc<dyn Engine>) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            engine,
            repositories: HashMap::new(),
            transaction: None,
            has_transaction: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> SharedContext {
        Rc::clone(&self.context)
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn has_transaction(&self) -> bool {
        self.has_transaction
    }

    pub fn repository_count(&self) -> usize {
        self.repositories.len()
    }

    /// Names of cached repositories, sorted.
    pub fn repository_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .repositories
            .values()
            .map(|handle| handle.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Every cached repository, sorted by name.
    pub fn repositories(&self) -> Vec<&dyn RepositoryView> {
        let mut views: Vec<&dyn RepositoryView> = self
            .repositories
            .values()
            .map(|handle| handle.view())
            .collect();
        views.sort_by_key(|view| view.name());
        views
    }

    /// Cached repository of type `R`, resolving and registering it on first use.
    ///
    /// # Errors
    /// - `Resolve` when the engine has no way to build `R`.
    pub fn get_repository<R: RepositoryHandle>(&mut self) -> UowResult<R> {
        if let Some(handle) = self.cached::<R>() {
            return Ok(handle);
        }
        let handle = self.engine.resolve::<R>()?;
        Ok(self.register(handle))
    }

    /// Repository for entity `E`, falling back to a `SqlRepository<E>` built
    /// from its constructor table when the engine has no registration.
    pub fn repository_for<E: Entity>(&mut self) -> UowResult<Rc<dyn Repository<E>>> {
        if let Some(handle) = self.cached::<Rc<dyn Repository<E>>>() {
            return Ok(handle);
        }
        let handle = match self.engine.resolve::<Rc<dyn Repository<E>>>() {
            Ok(handle) => handle,
            Err(ResolveError::NotRegistered(_)) => {
                let repository = self.engine.resolve_unregistered::<SqlRepository<E>>()?;
                Rc::new(repository) as Rc<dyn Repository<E>>
            }
            Err(err) => return Err(err.into()),
        };
        Ok(self.register(handle))
    }

    /// Caches `handle` under its type, replacing any previous entry, after
    /// stamping it with this unit of work's flag and context.
    pub fn register<R: RepositoryHandle>(&mut self, handle: R) -> R {
        handle.set_has_transaction(self.has_transaction);
        handle.set_context(&self.context);
        self.repositories
            .insert(TypeId::of::<R>(), Box::new(Cached(handle.clone())));
        handle
    }

    pub fn begin_transaction(&mut self) -> UowResult<()> {
        self.begin_transaction_with(IsolationLevel::Unspecified)
    }

    /// Opens a transaction unless one is already open, then flags every
    /// repository as transactional.
    pub fn begin_transaction_with(&mut self, isolation: IsolationLevel) -> UowResult<()> {
        if self.transaction.is_none() {
            let handle =
                TransactionHandle::begin(&self.context, isolation).map_err(UowError::Context)?;
            self.transaction = Some(handle);
            info!(
                "event=uow_begin module=uow status=ok uow_id={} isolation={}",
                self.id,
                isolation.as_str()
            );
        }
        self.set_flag(true);
        Ok(())
    }

    /// Flushes staged changes and commits the open transaction, if any.
    ///
    /// # Errors
    /// - `Transaction` with the original failure; the transaction is rolled
    ///   back and staged changes are discarded.
    pub fn commit(&mut self) -> UowResult<usize> {
        let outcome = self.flush_and_commit();
        self.set_flag(false);
        match outcome {
            Ok(affected) => {
                self.transaction = None;
                info!(
                    "event=uow_commit module=uow status=ok uow_id={} affected={}",
                    self.id, affected
                );
                Ok(affected)
            }
            Err(err) => {
                error!(
                    "event=uow_commit module=uow status=error uow_id={} error={}",
                    self.id, err
                );
                self.discard();
                Err(UowError::Transaction(err))
            }
        }
    }

    /// Abandons the open transaction and every staged change.
    pub fn rollback(&mut self) -> UowResult<()> {
        let result = match self.transaction.take() {
            Some(mut handle) => handle.rollback(),
            None => {
                self.context.borrow_mut().tracker_mut().reject_changes();
                Ok(())
            }
        };
        self.set_flag(false);
        info!(
            "event=uow_rollback module=uow status={} uow_id={}",
            if result.is_ok() { "ok" } else { "error" },
            self.id
        );
        result.map_err(UowError::Context)
    }

    fn flush_and_commit(&mut self) -> RepoResult<usize> {
        let affected = self.context.borrow_mut().flush()?;
        if let Some(handle) = self.transaction.as_mut() {
            handle.commit()?;
        }
        Ok(affected)
    }

    fn discard(&mut self) {
        if let Some(mut handle) = self.transaction.take() {
            if let Err(err) = handle.rollback() {
                warn!(
                    "event=uow_rollback module=uow status=error uow_id={} error={}",
                    self.id, err
                );
            }
        }
        self.context.borrow_mut().tracker_mut().reject_changes();
    }

    fn set_flag(&mut self, value: bool) {
        self.has_transaction = value;
        for handle in self.repositories.values() {
            handle.stamp(value);
        }
    }

    fn cached<R: RepositoryHandle>(&self) -> Option<R> {
        self.repositories
            .get(&TypeId::of::<R>())
            .and_then(|handle| handle.as_any().downcast_ref::<R>())
            .cloned()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let rolled_back = match self.transaction.take() {
            Some(mut handle) => {
                if let Err(err) = handle.rollback() {
                    warn!(
                        "event=uow_dispose module=uow status=error uow_id={} error={}",
                        self.id, err
                    );
                }
                true
            }
            None => false,
        };
        info!(
            "event=uow_dispose module=uow status=ok uow_id={} rolled_back={} repositories={}",
            self.id,
            rolled_back,
            self.repositories.len()
        );
    }
}
