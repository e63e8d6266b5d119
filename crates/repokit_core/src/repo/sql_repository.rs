//! Tracker-backed repository over any `DataContext`.
//!
//! # Responsibility
//! - Materialize entities, resolving identity against the change tracker.
//! - Stage writes in the tracker and flush them when no transaction is open.
//!
//! # Invariants
//! - Tracking reads return the tracked copy of an entity when one exists.
//! - Read-only reads never touch the tracker.
//! - A write call either stages all of its entities or none of them.
//! - A failed call, including its auto-flush, restores every tracker entry it
//!   touched to its state before the call.

use super::{Include, RepoError, RepoResult, Repository, RepositoryBase};
use crate::context::{ChangeTracker, EntityState, EntrySnapshot, SharedContext, WeakContext};
use crate::engine::{construct, Constructible, Constructor, ServiceCollection};
use crate::model::entity::{check_key_arity, Entity, EntityDescriptor, EntityKey, Record};
use async_trait::async_trait;
use rusqlite::types::Value;
use std::any::type_name;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

/// Generic repository for entity type `E`.
pub struct SqlRepository<E: Entity> {
    context: RefCell<Option<WeakContext>>,
    has_transaction: Cell<bool>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Default for SqlRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> fmt::Debug for SqlRepository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlRepository")
            .field("entity", &E::descriptor().table)
            .field("has_transaction", &self.has_transaction.get())
            .field("bound", &self.context().is_some())
            .finish()
    }
}

impl<E: Entity> SqlRepository<E> {
    /// Unbound repository; calls fail with `Unbound` until `set_context`.
    pub fn new() -> Self {
        Self {
            context: RefCell::new(None),
            has_transaction: Cell::new(false),
            _entity: PhantomData,
        }
    }

    pub fn with_context(context: &SharedContext) -> Self {
        let repository = Self::new();
        repository.set_context(context);
        repository
    }

    fn bound(&self) -> RepoResult<SharedContext> {
        self.context().ok_or(RepoError::Unbound(self.name()))
    }

    fn read(
        &self,
        predicate: Option<&dyn for<'a> Fn(&'a E) -> bool>,
        includes: &[Include<E>],
        track: bool,
    ) -> RepoResult<Vec<E>> {
        let descriptor = E::descriptor();
        let context = self.bound()?;
        let records = context.borrow().load(descriptor, None)?;

        // (entity, stored values to attach if the row is not tracked yet)
        let mut rows: Vec<(E, Option<Vec<Value>>)> = Vec::with_capacity(records.len());
        {
            let ctx = context.borrow();
            for record in records {
                if !track {
                    rows.push((E::from_record(&record)?, None));
                    continue;
                }
                let entity = E::from_record(&record)?;
                let key = entity.key();
                match ctx.tracker().state(descriptor, &key) {
                    EntityState::Detached | EntityState::Added => {
                        rows.push((entity, Some(record.into_values())));
                    }
                    EntityState::Deleted => {}
                    EntityState::Unchanged | EntityState::Modified => {
                        rows.push((tracked_copy::<E>(ctx.tracker(), &key)?, None));
                    }
                }
            }

            for (entity, _) in rows.iter_mut() {
                for include in includes {
                    include(entity, &*ctx)?;
                }
            }
        }

        if let Some(predicate) = predicate {
            rows.retain(|(entity, _)| predicate(entity));
        }

        if track {
            let mut ctx = context.borrow_mut();
            for (entity, stored) in rows.iter_mut() {
                if let Some(values) = stored.take() {
                    ctx.tracker_mut().attach(descriptor, entity.key(), values);
                }
            }
        }

        Ok(rows.into_iter().map(|(entity, _)| entity).collect())
    }

    /// Stages `entities` through `op`, then flushes unless a transaction is open.
    fn stage<F>(&self, entities: &[E], validate: bool, mut op: F) -> RepoResult<()>
    where
        F: FnMut(&mut ChangeTracker, &'static EntityDescriptor, EntityKey, &E) -> RepoResult<()>,
    {
        let descriptor = E::descriptor();
        for entity in entities {
            check_key_arity(descriptor, &entity.key())?;
            if validate {
                entity
                    .validate()
                    .map_err(|message| RepoError::Validation {
                        entity: descriptor.table,
                        message,
                    })?;
            }
        }

        let context = self.bound()?;
        let mut ctx = context.borrow_mut();
        let mut snapshots: Vec<EntrySnapshot> = Vec::with_capacity(entities.len());
        for entity in entities {
            let key = entity.key();
            snapshots.push(ctx.tracker().snapshot(descriptor, &key));
            if let Err(err) = op(ctx.tracker_mut(), descriptor, key, entity) {
                revert(ctx.tracker_mut(), snapshots);
                return Err(err);
            }
        }

        if self.has_transaction() {
            return Ok(());
        }
        if let Err(err) = ctx.flush() {
            revert(ctx.tracker_mut(), snapshots);
            return Err(err);
        }
        Ok(())
    }
}

/// Undoes a partially applied call; later snapshots of a repeated key are
/// restored first so the earliest one wins.
fn revert(tracker: &mut ChangeTracker, snapshots: Vec<EntrySnapshot>) {
    for snapshot in snapshots.into_iter().rev() {
        tracker.restore(snapshot);
    }
}

fn tracked_copy<E: Entity>(tracker: &ChangeTracker, key: &EntityKey) -> RepoResult<E> {
    let descriptor = E::descriptor();
    let values = tracker.current_values(descriptor, key).ok_or_else(|| {
        RepoError::InvalidData(format!("{} entity {key} is not tracked", descriptor.table))
    })?;
    E::from_record(&Record::from_descriptor(descriptor, values.to_vec()))
}

impl<E: Entity> RepositoryBase for SqlRepository<E> {
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }

    fn has_transaction(&self) -> bool {
        self.has_transaction.get()
    }

    fn set_has_transaction(&self, value: bool) {
        self.has_transaction.set(value);
    }

    fn context(&self) -> Option<SharedContext> {
        self.context.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn set_context(&self, context: &SharedContext) {
        *self.context.borrow_mut() = Some(Rc::downgrade(context));
    }
}

#[async_trait(?Send)]
impl<E: Entity> Repository<E> for SqlRepository<E> {
    fn sql_query(&self, sql: &str, params: &[Value]) -> RepoResult<Vec<E>> {
        let context = self.bound()?;
        let records = context.borrow().query_raw(sql, params)?;
        records.iter().map(E::from_record).collect()
    }

    fn get_all(&self, includes: &[Include<E>]) -> RepoResult<Vec<E>> {
        self.read(None, includes, true)
    }

    fn get_list(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
    ) -> RepoResult<Vec<E>> {
        self.read(Some(predicate), includes, true)
    }

    fn get_all_read_only(&self, includes: &[Include<E>]) -> RepoResult<Vec<E>> {
        self.read(None, includes, false)
    }

    fn get_list_read_only(
        &self,
        predicate: &dyn for<'a> Fn(&'a E) -> bool,
        includes: &[Include<E>],
    ) -> RepoResult<Vec<E>> {
        self.read(Some(predicate), includes, false)
    }

    fn get_by_id(&self, key: &EntityKey) -> RepoResult<Option<E>> {
        let descriptor = E::descriptor();
        check_key_arity(descriptor, key)?;
        let context = self.bound()?;

        let records = {
            let ctx = context.borrow();
            match ctx.tracker().state(descriptor, key) {
                EntityState::Unchanged | EntityState::Modified => {
                    return tracked_copy::<E>(ctx.tracker(), key).map(Some);
                }
                EntityState::Deleted => return Ok(None),
                EntityState::Added | EntityState::Detached => ctx.load(descriptor, Some(key))?,
            }
        };

        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let entity = E::from_record(&record)?;
        context
            .borrow_mut()
            .tracker_mut()
            .attach(descriptor, key.clone(), record.into_values());
        Ok(Some(entity))
    }

    fn add(&self, entity: E) -> RepoResult<E> {
        self.stage(std::slice::from_ref(&entity), true, |tracker, descriptor, key, entity| {
            tracker.add(descriptor, key, entity.to_values())
        })?;
        Ok(entity)
    }

    fn add_range(&self, entities: Vec<E>) -> RepoResult<Vec<E>> {
        self.stage(&entities, true, |tracker, descriptor, key, entity| {
            tracker.add(descriptor, key, entity.to_values())
        })?;
        Ok(entities)
    }

    fn update(&self, entity: E) -> RepoResult<E> {
        self.stage(std::slice::from_ref(&entity), true, |tracker, descriptor, key, entity| {
            tracker.update(descriptor, key, entity.to_values());
            Ok(())
        })?;
        Ok(entity)
    }

    fn update_range(&self, entities: Vec<E>) -> RepoResult<Vec<E>> {
        self.stage(&entities, true, |tracker, descriptor, key, entity| {
            tracker.update(descriptor, key, entity.to_values());
            Ok(())
        })?;
        Ok(entities)
    }

    fn delete(&self, entity: E) -> RepoResult<Option<E>> {
        let mut scheduled = self.delete_range(vec![entity])?;
        Ok(scheduled.pop())
    }

    fn delete_range(&self, entities: Vec<E>) -> RepoResult<Vec<E>> {
        let mut scheduled = Vec::with_capacity(entities.len());
        self.stage(&entities, false, |tracker, descriptor, key, entity| {
            let removes_row = if tracker.state(descriptor, &key) == EntityState::Deleted {
                tracker.remove(descriptor, key, entity.to_values());
                true
            } else {
                tracker.mark_deleted(descriptor, key, entity.to_values()) != EntityState::Added
            };
            scheduled.push(removes_row);
            Ok(())
        })?;
        Ok(entities
            .into_iter()
            .zip(scheduled)
            .filter_map(|(entity, removes_row)| removes_row.then_some(entity))
            .collect())
    }
}

impl<E: Entity> Constructible for SqlRepository<E> {
    fn constructors() -> Vec<Constructor<Self>> {
        vec![
            Constructor::new("with_context", |args| {
                let context = args.next::<SharedContext>()?;
                Ok(Self::with_context(&context))
            })
            .param::<SharedContext>(),
            Constructor::new("new", |_| Ok(Self::new())),
        ]
    }
}

/// Registers `SqlRepository<E>` under both its concrete handle and
/// `Rc<dyn Repository<E>>`, built on every resolve.
pub fn register_sql_repository<E: Entity>(
    services: &mut ServiceCollection,
) -> &mut ServiceCollection {
    services
        .add_transient(|engine| Ok(Rc::new(construct::<SqlRepository<E>>(engine)?)))
        .add_transient(|engine| {
            let repository: Rc<dyn Repository<E>> =
                Rc::new(construct::<SqlRepository<E>>(engine)?);
            Ok(repository)
        })
}
