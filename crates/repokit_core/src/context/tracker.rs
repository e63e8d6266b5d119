//! Change tracking for one data context session.
//!
//! # Responsibility
//! - Record entity state transitions requested by repositories.
//! - Produce the ordered list of pending writes for `flush`.
//!
//! # Invariants
//! - At most one entry per `(table, key)`.
//! - Pending writes are emitted in the order their state last changed.
//! - `Unchanged` entries always carry the values last seen in storage.

use crate::model::entity::{EntityDescriptor, EntityKey};
use crate::repo::{RepoError, RepoResult};
use rusqlite::types::Value;
use std::collections::HashMap;

/// Tracking state of one entity inside a data context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Not tracked.
    Detached,
    /// Tracked and equal to storage.
    Unchanged,
    /// Pending insert.
    Added,
    /// Pending update.
    Modified,
    /// Pending delete.
    Deleted,
}

/// Pending write produced by `ChangeTracker::pending`.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub descriptor: &'static EntityDescriptor,
    pub key: EntityKey,
    pub values: Vec<Value>,
    pub state: EntityState,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TrackerKey {
    table: &'static str,
    key: EntityKey,
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    descriptor: &'static EntityDescriptor,
    values: Vec<Value>,
    original: Option<Vec<Value>>,
    state: EntityState,
    sequence: u64,
}

/// Tracking entry of one key as it was when captured, used to undo a
/// partially applied write.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    key: TrackerKey,
    entry: Option<TrackedEntry>,
}

/// Identity map plus pending-change log.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: HashMap<TrackerKey, TrackedEntry>,
    next_sequence: u64,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, descriptor: &'static EntityDescriptor, key: &EntityKey) -> EntityState {
        self.entries
            .get(&tracker_key(descriptor, key))
            .map_or(EntityState::Detached, |entry| entry.state)
    }

    /// Current tracked values, if the entity is tracked.
    pub fn current_values(
        &self,
        descriptor: &'static EntityDescriptor,
        key: &EntityKey,
    ) -> Option<&[Value]> {
        self.entries
            .get(&tracker_key(descriptor, key))
            .map(|entry| entry.values.as_slice())
    }

    /// Starts tracking a stored row as `Unchanged`. Already tracked rows keep
    /// their state; the returned value is the resulting state.
    pub fn attach(
        &mut self,
        descriptor: &'static EntityDescriptor,
        key: EntityKey,
        values: Vec<Value>,
    ) -> EntityState {
        let tracker_key = tracker_key(descriptor, &key);
        if let Some(entry) = self.entries.get(&tracker_key) {
            return entry.state;
        }
        let sequence = self.bump();
        self.entries.insert(
            tracker_key,
            TrackedEntry {
                descriptor,
                original: Some(values.clone()),
                values,
                state: EntityState::Unchanged,
                sequence,
            },
        );
        EntityState::Unchanged
    }

    /// Schedules an insert.
    ///
    /// # Errors
    /// - `DuplicateKey` when the key is already tracked and not pending delete.
    pub fn add(
        &mut self,
        descriptor: &'static EntityDescriptor,
        key: EntityKey,
        values: Vec<Value>,
    ) -> RepoResult<()> {
        let tracker_key = tracker_key(descriptor, &key);
        let sequence = self.bump();
        match self.entries.get_mut(&tracker_key) {
            None => {
                self.entries.insert(
                    tracker_key,
                    TrackedEntry {
                        descriptor,
                        values,
                        original: None,
                        state: EntityState::Added,
                        sequence,
                    },
                );
                Ok(())
            }
            // Re-adding a row pending delete turns into an overwrite.
            Some(entry) if entry.state == EntityState::Deleted => {
                entry.values = values;
                entry.state = EntityState::Modified;
                entry.sequence = sequence;
                Ok(())
            }
            Some(_) => Err(RepoError::DuplicateKey {
                entity: descriptor.table,
                key,
            }),
        }
    }

    /// Schedules an update. Untracked entities are attached as `Modified`.
    pub fn update(
        &mut self,
        descriptor: &'static EntityDescriptor,
        key: EntityKey,
        values: Vec<Value>,
    ) {
        let tracker_key = tracker_key(descriptor, &key);
        let sequence = self.bump();
        match self.entries.get_mut(&tracker_key) {
            None => {
                self.entries.insert(
                    tracker_key,
                    TrackedEntry {
                        descriptor,
                        values,
                        original: None,
                        state: EntityState::Modified,
                        sequence,
                    },
                );
            }
            Some(entry) => {
                entry.values = values;
                if !matches!(entry.state, EntityState::Added | EntityState::Modified) {
                    entry.state = EntityState::Modified;
                    entry.sequence = sequence;
                }
            }
        }
    }

    /// Marks an entity deleted and returns its previous state.
    ///
    /// A pending insert is simply detached; an entity already pending delete
    /// is left untouched.
    pub fn mark_deleted(
        &mut self,
        descriptor: &'static EntityDescriptor,
        key: EntityKey,
        values: Vec<Value>,
    ) -> EntityState {
        let tracker_key = tracker_key(descriptor, &key);
        let sequence = self.bump();
        match self.entries.get_mut(&tracker_key) {
            None => {
                self.entries.insert(
                    tracker_key,
                    TrackedEntry {
                        descriptor,
                        values,
                        original: None,
                        state: EntityState::Deleted,
                        sequence,
                    },
                );
                EntityState::Detached
            }
            Some(entry) => {
                let previous = entry.state;
                match previous {
                    EntityState::Added => {
                        self.entries.remove(&tracker_key);
                    }
                    EntityState::Unchanged | EntityState::Modified | EntityState::Detached => {
                        entry.state = EntityState::Deleted;
                        entry.sequence = sequence;
                    }
                    EntityState::Deleted => {}
                }
                previous
            }
        }
    }

    /// Re-attaches `values` for an entity and schedules it for removal.
    pub fn remove(
        &mut self,
        descriptor: &'static EntityDescriptor,
        key: EntityKey,
        values: Vec<Value>,
    ) {
        let tracker_key = tracker_key(descriptor, &key);
        let sequence = self.bump();
        let entry = self
            .entries
            .entry(tracker_key)
            .or_insert_with(|| TrackedEntry {
                descriptor,
                values: Vec::new(),
                original: None,
                state: EntityState::Deleted,
                sequence,
            });
        entry.values = values;
        if entry.state != EntityState::Deleted {
            entry.state = EntityState::Deleted;
            entry.sequence = sequence;
        }
    }

    pub fn detach(&mut self, descriptor: &'static EntityDescriptor, key: &EntityKey) {
        self.entries.remove(&tracker_key(descriptor, key));
    }

    pub fn has_changes(&self) -> bool {
        self.entries.values().any(|entry| {
            matches!(
                entry.state,
                EntityState::Added | EntityState::Modified | EntityState::Deleted
            )
        })
    }

    /// Pending writes ordered by their last state change.
    pub fn pending(&self) -> Vec<PendingChange> {
        let mut pending: Vec<(u64, PendingChange)> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.state,
                    EntityState::Added | EntityState::Modified | EntityState::Deleted
                )
            })
            .map(|(tracker_key, entry)| {
                (
                    entry.sequence,
                    PendingChange {
                        descriptor: entry.descriptor,
                        key: tracker_key.key.clone(),
                        values: entry.values.clone(),
                        state: entry.state,
                    },
                )
            })
            .collect();
        pending.sort_by_key(|(sequence, _)| *sequence);
        pending.into_iter().map(|(_, change)| change).collect()
    }

    /// Marks every pending write as persisted.
    pub fn accept_changes(&mut self) {
        self.entries
            .retain(|_, entry| entry.state != EntityState::Deleted);
        for entry in self.entries.values_mut() {
            if matches!(entry.state, EntityState::Added | EntityState::Modified) {
                entry.state = EntityState::Unchanged;
                entry.original = Some(entry.values.clone());
            }
        }
    }

    /// Reverts every pending write.
    pub fn reject_changes(&mut self) {
        self.entries.retain(|_, entry| revert_entry(entry));
    }

    /// Captures the current entry for `key`, including its absence.
    pub fn snapshot(
        &self,
        descriptor: &'static EntityDescriptor,
        key: &EntityKey,
    ) -> EntrySnapshot {
        let key = tracker_key(descriptor, key);
        EntrySnapshot {
            entry: self.entries.get(&key).cloned(),
            key,
        }
    }

    /// Puts the captured entry back exactly, or untracks the key if it was
    /// absent.
    pub fn restore(&mut self, snapshot: EntrySnapshot) {
        match snapshot.entry {
            Some(entry) => {
                self.entries.insert(snapshot.key, entry);
            }
            None => {
                self.entries.remove(&snapshot.key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn bump(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// Returns `false` when the entry must be dropped instead of reverted.
fn revert_entry(entry: &mut TrackedEntry) -> bool {
    match entry.state {
        EntityState::Unchanged => true,
        EntityState::Added | EntityState::Detached => false,
        EntityState::Modified | EntityState::Deleted => match entry.original.clone() {
            Some(original) => {
                entry.values = original;
                entry.state = EntityState::Unchanged;
                true
            }
            None => false,
        },
    }
}

fn tracker_key(descriptor: &'static EntityDescriptor, key: &EntityKey) -> TrackerKey {
    TrackerKey {
        table: descriptor.table,
        key: key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeTracker, EntityState};
    use crate::model::entity::{EntityDescriptor, EntityKey};
    use crate::repo::RepoError;
    use rusqlite::types::Value;

    static ITEMS: EntityDescriptor = EntityDescriptor {
        table: "items",
        key_columns: &["id"],
        columns: &["id", "label"],
    };

    fn row(id: i64, label: &str) -> Vec<Value> {
        vec![Value::Integer(id), Value::Text(label.to_string())]
    }

    #[test]
    fn add_then_accept_becomes_unchanged() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&ITEMS, 1.into(), row(1, "a")).unwrap();
        assert_eq!(tracker.state(&ITEMS, &1.into()), EntityState::Added);
        assert!(tracker.has_changes());

        tracker.accept_changes();
        assert_eq!(tracker.state(&ITEMS, &1.into()), EntityState::Unchanged);
        assert!(!tracker.has_changes());
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&ITEMS, 1.into(), row(1, "a")).unwrap();
        let err = tracker.add(&ITEMS, 1.into(), row(1, "b")).unwrap_err();
        assert!(matches!(err, RepoError::DuplicateKey { entity: "items", .. }));
    }

    #[test]
    fn deleting_a_pending_insert_detaches_it() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&ITEMS, 1.into(), row(1, "a")).unwrap();
        let previous = tracker.mark_deleted(&ITEMS, 1.into(), row(1, "a"));
        assert_eq!(previous, EntityState::Added);
        assert_eq!(tracker.state(&ITEMS, &1.into()), EntityState::Detached);
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn remove_reattaches_values_of_deleted_entity() {
        let mut tracker = ChangeTracker::new();
        tracker.attach(&ITEMS, 1.into(), row(1, "stored"));
        tracker.mark_deleted(&ITEMS, 1.into(), row(1, "stored"));
        tracker.remove(&ITEMS, 1.into(), row(1, "outside"));

        let pending = tracker.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, EntityState::Deleted);
        assert_eq!(pending[0].values, row(1, "outside"));
    }

    #[test]
    fn pending_follows_last_state_change() {
        let mut tracker = ChangeTracker::new();
        tracker.attach(&ITEMS, 1.into(), row(1, "a"));
        tracker.add(&ITEMS, 2.into(), row(2, "b")).unwrap();
        tracker.update(&ITEMS, 1.into(), row(1, "a2"));

        let keys: Vec<EntityKey> = tracker.pending().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![EntityKey::from(2), EntityKey::from(1)]);
    }

    #[test]
    fn reject_changes_restores_stored_values() {
        let mut tracker = ChangeTracker::new();
        tracker.attach(&ITEMS, 1.into(), row(1, "a"));
        tracker.update(&ITEMS, 1.into(), row(1, "changed"));
        tracker.add(&ITEMS, 2.into(), row(2, "new")).unwrap();
        tracker.update(&ITEMS, 3.into(), row(3, "unknown"));

        tracker.reject_changes();

        assert_eq!(tracker.state(&ITEMS, &1.into()), EntityState::Unchanged);
        assert_eq!(
            tracker.current_values(&ITEMS, &1.into()).unwrap(),
            row(1, "a").as_slice()
        );
        assert_eq!(tracker.state(&ITEMS, &2.into()), EntityState::Detached);
        assert_eq!(tracker.state(&ITEMS, &3.into()), EntityState::Detached);
    }

    #[test]
    fn re_adding_deleted_entity_becomes_modified() {
        let mut tracker = ChangeTracker::new();
        tracker.attach(&ITEMS, 1.into(), row(1, "a"));
        tracker.mark_deleted(&ITEMS, 1.into(), row(1, "a"));
        tracker.add(&ITEMS, 1.into(), row(1, "again")).unwrap();
        assert_eq!(tracker.state(&ITEMS, &1.into()), EntityState::Modified);
    }

    #[test]
    fn restore_returns_pending_entry_to_captured_state() {
        let mut tracker = ChangeTracker::new();
        tracker.attach(&ITEMS, 1.into(), row(1, "stored"));
        tracker.mark_deleted(&ITEMS, 1.into(), row(1, "stored"));

        let deleted = tracker.snapshot(&ITEMS, &1.into());
        let absent = tracker.snapshot(&ITEMS, &2.into());
        tracker.add(&ITEMS, 1.into(), row(1, "again")).unwrap();
        tracker.add(&ITEMS, 2.into(), row(2, "new")).unwrap();

        tracker.restore(absent);
        tracker.restore(deleted);
        assert_eq!(tracker.state(&ITEMS, &1.into()), EntityState::Deleted);
        assert_eq!(tracker.state(&ITEMS, &2.into()), EntityState::Detached);
        assert_eq!(
            tracker.current_values(&ITEMS, &1.into()),
            Some(row(1, "stored").as_slice())
        );
    }
}
