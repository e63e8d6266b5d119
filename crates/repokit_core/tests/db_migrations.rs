mod common;

use common::SCHEMA;
use repokit_core::db::migrations::latest_version;
use repokit_core::db::{open_db, open_db_in_memory, DbError, Migration};
use repokit_core::ContextOptions;
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory(&ContextOptions::default(), SCHEMA).unwrap();

    assert_eq!(schema_version(&conn), latest_version(SCHEMA));
    assert_table_exists(&conn, "users");
    assert_table_exists(&conn, "user_roles");
    assert_table_exists(&conn, "order_lines");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repokit.db");

    let conn_first = open_db(&path, &ContextOptions::default(), SCHEMA).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version(SCHEMA));
    drop(conn_first);

    let conn_second = open_db(&path, &ContextOptions::default(), SCHEMA).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version(SCHEMA));
    assert_table_exists(&conn_second, "order_lines");
}

#[test]
fn later_migrations_apply_on_top_of_existing_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upgrade.db");

    drop(open_db(&path, &ContextOptions::default(), &SCHEMA[..1]).unwrap());
    let conn = open_db(&path, &ContextOptions::default(), SCHEMA).unwrap();

    assert_eq!(schema_version(&conn), 2);
    assert_table_exists(&conn, "order_lines");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path, &ContextOptions::default(), SCHEMA).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version(SCHEMA));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn out_of_order_migrations_are_rejected() {
    let migrations = [
        Migration::new(2, "CREATE TABLE b (id INTEGER PRIMARY KEY);"),
        Migration::new(1, "CREATE TABLE a (id INTEGER PRIMARY KEY);"),
    ];
    let err = open_db_in_memory(&ContextOptions::default(), &migrations).unwrap_err();
    assert!(matches!(
        err,
        DbError::InvalidMigrationOrder {
            previous: 2,
            next: 1
        }
    ));
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
