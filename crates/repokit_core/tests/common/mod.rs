#![allow(dead_code)]

use repokit_core::{
    register_sql_repository, ContextOptions, DataContext, Engine, Entity, EntityDescriptor,
    EntityKey, Migration, Record, RepoError, RepoResult, ServiceCollection, ServiceEngine,
    SharedContext, SqliteDataContext, Value,
};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub const SCHEMA: &[Migration] = &[
    Migration::new(
        1,
        "CREATE TABLE users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE
        );
        CREATE TABLE user_roles (
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY (user_id, role)
        );",
    ),
    Migration::new(
        2,
        "CREATE TABLE order_lines (
            order_id INTEGER NOT NULL,
            line_no INTEGER NOT NULL,
            sku TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            PRIMARY KEY (order_id, line_no)
        );",
    ),
];

static USERS: EntityDescriptor = EntityDescriptor {
    table: "users",
    key_columns: &["id"],
    columns: &["id", "name", "email"],
};

static ORDER_LINES: EntityDescriptor = EntityDescriptor {
    table: "order_lines",
    key_columns: &["order_id", "line_no"],
    columns: &["order_id", "line_no", "sku", "quantity"],
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Filled by `load_roles`.
    pub roles: Vec<String>,
}

impl Entity for User {
    fn descriptor() -> &'static EntityDescriptor {
        &USERS
    }

    fn key(&self) -> EntityKey {
        self.id.into()
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.id.to_string()),
            Value::Text(self.name.clone()),
            Value::Text(self.email.clone()),
        ]
    }

    fn from_record(record: &Record) -> RepoResult<Self> {
        let id: String = record.get("id")?;
        Ok(Self {
            id: Uuid::parse_str(&id).map_err(|err| RepoError::InvalidData(err.to_string()))?,
            name: record.get("name")?,
            email: record.get("email")?,
            roles: Vec::new(),
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderLine {
    pub order_id: i64,
    pub line_no: i64,
    pub sku: String,
    pub quantity: i64,
}

impl Entity for OrderLine {
    fn descriptor() -> &'static EntityDescriptor {
        &ORDER_LINES
    }

    fn key(&self) -> EntityKey {
        EntityKey::from((self.order_id, self.line_no))
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.order_id),
            Value::Integer(self.line_no),
            Value::Text(self.sku.clone()),
            Value::Integer(self.quantity),
        ]
    }

    fn from_record(record: &Record) -> RepoResult<Self> {
        Ok(Self {
            order_id: record.get("order_id")?,
            line_no: record.get("line_no")?,
            sku: record.get("sku")?,
            quantity: record.get("quantity")?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.quantity <= 0 {
            return Err("quantity must be positive".to_string());
        }
        Ok(())
    }
}

pub fn user(name: &str, email: &str) -> User {
    User {
        id: Uuid::new_v4(),
        name: name.to_string(),
        email: email.to_string(),
        roles: Vec::new(),
    }
}

pub fn line(order_id: i64, line_no: i64, sku: &str, quantity: i64) -> OrderLine {
    OrderLine {
        order_id,
        line_no,
        sku: sku.to_string(),
        quantity,
    }
}

/// Include loader for `User::roles`.
pub fn load_roles(user: &mut User, context: &dyn DataContext) -> RepoResult<()> {
    let records = context.query_raw(
        "SELECT role FROM user_roles WHERE user_id = ?1 ORDER BY role",
        &[Value::Text(user.id.to_string())],
    )?;
    user.roles = records
        .iter()
        .map(|record| record.get::<String>("role"))
        .collect::<RepoResult<_>>()?;
    Ok(())
}

pub fn open_context() -> SharedContext {
    SqliteDataContext::open_in_memory(&ContextOptions::default(), SCHEMA)
        .unwrap()
        .into_shared()
}

/// In-memory context with `roles` pre-seeded for `user_id`.
pub fn open_context_with_roles(user_id: Uuid, roles: &[&str]) -> SharedContext {
    let context = SqliteDataContext::open_in_memory(&ContextOptions::default(), SCHEMA).unwrap();
    for role in roles {
        context
            .connection()
            .execute(
                "INSERT INTO user_roles (user_id, role) VALUES (?1, ?2)",
                rusqlite::params![user_id.to_string(), *role],
            )
            .unwrap();
    }
    context.into_shared()
}

pub fn open_file_context(path: &Path) -> SharedContext {
    SqliteDataContext::open(path, &ContextOptions::default(), SCHEMA)
        .unwrap()
        .into_shared()
}

/// Engine with SQL repositories registered for both fixture entities.
pub fn test_engine() -> Arc<dyn Engine> {
    let mut services = ServiceCollection::new();
    register_sql_repository::<User>(&mut services);
    register_sql_repository::<OrderLine>(&mut services);
    Arc::new(ServiceEngine::with_services(services, "Test"))
}

/// Counts rows of `table` through a separate connection.
pub fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .unwrap()
}
