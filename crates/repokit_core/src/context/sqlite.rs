//! SQLite-backed data context.
//!
//! # Responsibility
//! - Materialize entity rows and raw read statements from one connection.
//! - Translate tracked changes into INSERT/UPDATE/DELETE statements.
//!
//! # Invariants
//! - `flush` is atomic: all pending writes land or none do.
//! - Raw statements must be reads; writes go through the tracker.
//! - Rolling back a transaction clears the tracker.

use super::tracker::{ChangeTracker, EntityState, PendingChange};
use super::{share, DataContext, IsolationLevel, SharedContext};
use crate::config::ContextOptions;
use crate::db::{open_db, open_db_in_memory, DbResult, Migration};
use crate::model::entity::{check_key_arity, EntityDescriptor, EntityKey, Record};
use crate::repo::{RepoError, RepoResult};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Rows};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const FLUSH_SAVEPOINT: &str = "repokit_flush";

static READ_STATEMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*(SELECT|WITH|VALUES)\b").expect("read statement regex must compile")
});

/// Data context over a single SQLite connection.
pub struct SqliteDataContext {
    conn: Connection,
    options: ContextOptions,
    tracker: ChangeTracker,
    transaction: Option<IsolationLevel>,
}

impl SqliteDataContext {
    /// Wraps an already bootstrapped connection.
    pub fn new(conn: Connection, options: ContextOptions) -> Self {
        Self {
            conn,
            options,
            tracker: ChangeTracker::new(),
            transaction: None,
        }
    }

    pub fn open(
        path: impl AsRef<Path>,
        options: &ContextOptions,
        migrations: &[Migration],
    ) -> DbResult<Self> {
        let conn = open_db(path, options, migrations)?;
        Ok(Self::new(conn, options.clone()))
    }

    pub fn open_in_memory(options: &ContextOptions, migrations: &[Migration]) -> DbResult<Self> {
        let conn = open_db_in_memory(options, migrations)?;
        Ok(Self::new(conn, options.clone()))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn into_shared(self) -> SharedContext {
        share(self)
    }
}

impl DataContext for SqliteDataContext {
    fn load(
        &self,
        descriptor: &EntityDescriptor,
        key: Option<&EntityKey>,
    ) -> RepoResult<Vec<Record>> {
        let mut sql = format!(
            "SELECT {} FROM {}",
            column_list(descriptor.columns),
            quote(descriptor.table)
        );
        let mut params = Vec::new();
        if let Some(key) = key {
            check_key_arity(descriptor, key)?;
            sql.push_str(" WHERE ");
            sql.push_str(&key_predicate(descriptor, 1));
            params = key.to_values();
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&column_list(descriptor.key_columns));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query(params_from_iter(params.iter()))?;
        collect_rows(rows, descriptor.columns.len(), |values| {
            Record::from_descriptor(descriptor, values)
        })
    }

    fn query_raw(&self, sql: &str, params: &[Value]) -> RepoResult<Vec<Record>> {
        if !READ_STATEMENT_RE.is_match(sql) {
            return Err(reject_raw_statement("not_a_query"));
        }
        let mut stmt = self.conn.prepare(sql)?;
        // SQLite's verdict on the compiled statement; catches writes inside CTEs.
        if !stmt.readonly() {
            return Err(reject_raw_statement("writes_database"));
        }
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = columns.len();
        let rows = stmt.query(params_from_iter(params.iter()))?;
        collect_rows(rows, width, |values| {
            Record::with_columns(Arc::clone(&columns), values)
        })
    }

    fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    fn flush(&mut self) -> RepoResult<usize> {
        let changes = self.tracker.pending();
        if changes.is_empty() {
            return Ok(0);
        }

        let started_at = Instant::now();
        self.conn
            .execute_batch(&format!("SAVEPOINT {FLUSH_SAVEPOINT};"))?;

        match apply_changes(&self.conn, &changes) {
            Ok(affected) => {
                self.conn
                    .execute_batch(&format!("RELEASE {FLUSH_SAVEPOINT};"))?;
                self.tracker.accept_changes();
                info!(
                    "event=ctx_flush module=context status=ok changes={} affected={} duration_ms={}",
                    changes.len(),
                    affected,
                    started_at.elapsed().as_millis()
                );
                Ok(affected)
            }
            Err(err) => {
                if let Err(undo_err) = self.conn.execute_batch(&format!(
                    "ROLLBACK TO {FLUSH_SAVEPOINT}; RELEASE {FLUSH_SAVEPOINT};"
                )) {
                    warn!(
                        "event=ctx_flush module=context status=error error_code=savepoint_undo_failed error={}",
                        undo_err
                    );
                }
                error!(
                    "event=ctx_flush module=context status=error changes={} duration_ms={} error={}",
                    changes.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn begin_transaction(&mut self, isolation: IsolationLevel) -> RepoResult<()> {
        if self.transaction.is_some() {
            return Err(RepoError::UnsupportedOperation(
                "nested transactions are not supported",
            ));
        }
        let effective = isolation.or(self.options.default_isolation);
        self.conn.execute_batch(effective.begin_statement())?;
        self.transaction = Some(effective);
        Ok(())
    }

    fn commit_transaction(&mut self) -> RepoResult<()> {
        if self.transaction.is_none() {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT;")?;
        self.transaction = None;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> RepoResult<()> {
        self.transaction = None;
        // Tracked rows may reflect writes that are about to vanish.
        self.tracker.clear();
        // SQLite may already have rolled back on its own after certain errors.
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

fn reject_raw_statement(reason: &str) -> RepoError {
    warn!("event=ctx_query module=context status=rejected reason={reason}");
    RepoError::UnsupportedOperation("raw statements must be read-only queries")
}

fn collect_rows<F>(mut rows: Rows<'_>, width: usize, make: F) -> RepoResult<Vec<Record>>
where
    F: Fn(Vec<Value>) -> Record,
{
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            values.push(row.get::<_, Value>(index)?);
        }
        records.push(make(values));
    }
    Ok(records)
}

fn apply_changes(conn: &Connection, changes: &[PendingChange]) -> RepoResult<usize> {
    let mut affected = 0;
    for change in changes {
        affected += match change.state {
            EntityState::Added => insert_row(conn, change)?,
            EntityState::Modified => update_row(conn, change)?,
            EntityState::Deleted => delete_row(conn, change)?,
            EntityState::Unchanged | EntityState::Detached => 0,
        };
    }
    Ok(affected)
}

fn insert_row(conn: &Connection, change: &PendingChange) -> RepoResult<usize> {
    let descriptor = change.descriptor;
    let placeholders = (1..=descriptor.columns.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(descriptor.table),
        column_list(descriptor.columns),
        placeholders
    );
    let changed = conn
        .prepare_cached(&sql)?
        .execute(params_from_iter(change.values.iter()))?;
    Ok(changed)
}

fn update_row(conn: &Connection, change: &PendingChange) -> RepoResult<usize> {
    let descriptor = change.descriptor;
    let key_values = change.key.to_values();
    let mut params: Vec<&Value> = Vec::with_capacity(descriptor.columns.len());
    let mut assignments = Vec::new();
    for (index, name) in descriptor.non_key_columns() {
        let value = change.values.get(index).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "{} row is missing a value for `{name}`",
                descriptor.table
            ))
        })?;
        params.push(value);
        assignments.push(format!("{} = ?{}", quote(name), params.len()));
    }
    if assignments.is_empty() {
        return Ok(0);
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote(descriptor.table),
        assignments.join(", "),
        key_predicate(descriptor, params.len() + 1)
    );
    params.extend(key_values.iter());

    let changed = conn
        .prepare_cached(&sql)?
        .execute(params_from_iter(params.into_iter()))?;
    if changed == 0 {
        return Err(stale(change));
    }
    Ok(changed)
}

fn delete_row(conn: &Connection, change: &PendingChange) -> RepoResult<usize> {
    let descriptor = change.descriptor;
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote(descriptor.table),
        key_predicate(descriptor, 1)
    );
    let changed = conn
        .prepare_cached(&sql)?
        .execute(params_from_iter(change.key.to_values().iter()))?;
    if changed == 0 {
        return Err(stale(change));
    }
    Ok(changed)
}

fn stale(change: &PendingChange) -> RepoError {
    RepoError::StaleEntity {
        entity: change.descriptor.table,
        key: change.key.clone(),
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|name| quote(name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `"a" = ?n AND "b" = ?n+1 ...` over the key columns, numbering from `first`.
fn key_predicate(descriptor: &EntityDescriptor, first: usize) -> String {
    descriptor
        .key_columns
        .iter()
        .enumerate()
        .map(|(offset, name)| format!("{} = ?{}", quote(name), first + offset))
        .collect::<Vec<_>>()
        .join(" AND ")
}
