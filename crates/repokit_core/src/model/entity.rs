//! Entity contract, identity keys and row views.
//!
//! # Responsibility
//! - Define the `Entity` trait implemented by every persisted record type.
//! - Provide `EntityKey` (ordered key components) and `Record` (named row).
//!
//! # Invariants
//! - `Entity::to_values()` is aligned with `EntityDescriptor::columns`.
//! - `EntityDescriptor::key_columns` is a subset of `columns`.
//! - Key arity must match `key_columns` before any lookup reaches storage.

use crate::repo::{RepoError, RepoResult};
use rusqlite::types::{FromSql, Value, ValueRef};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Static storage description of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Backing table name.
    pub table: &'static str,
    /// Ordered key columns. Composite keys list more than one column.
    pub key_columns: &'static [&'static str],
    /// All persisted columns, key columns included.
    pub columns: &'static [&'static str],
}

impl EntityDescriptor {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| *name == column)
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.key_columns.contains(&column)
    }

    /// Returns `(index, name)` pairs for columns outside the key.
    pub fn non_key_columns(&self) -> impl Iterator<Item = (usize, &'static str)> + '_ {
        self.columns
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, name)| !self.is_key_column(name))
    }

    pub fn key_arity(&self) -> usize {
        self.key_columns.len()
    }
}

/// One component of an entity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Integer(i64),
    Text(String),
}

impl KeyPart {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Integer(value) => Value::Integer(*value),
            Self::Text(value) => Value::Text(value.clone()),
        }
    }
}

impl Display for KeyPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for KeyPart {
    fn from(value: Uuid) -> Self {
        Self::Text(value.to_string())
    }
}

/// Ordered identity of an entity.
///
/// Single-column keys hold one part; composite keys hold the parts in
/// `EntityDescriptor::key_columns` order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(Vec<KeyPart>);

impl EntityKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Builds a composite key from ordered components.
    pub fn composite<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns key components as bindable SQL values.
    pub fn to_values(&self) -> Vec<Value> {
        self.0.iter().map(KeyPart::to_value).collect()
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{single}");
        }
        write!(f, "(")?;
        for (index, part) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

impl From<KeyPart> for EntityKey {
    fn from(value: KeyPart) -> Self {
        Self(vec![value])
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        Self(vec![value.into()])
    }
}

impl From<i32> for EntityKey {
    fn from(value: i32) -> Self {
        Self(vec![value.into()])
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(vec![value.into()])
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        Self(vec![value.into()])
    }
}

impl From<Uuid> for EntityKey {
    fn from(value: Uuid) -> Self {
        Self(vec![value.into()])
    }
}

impl<A, B> From<(A, B)> for EntityKey
where
    A: Into<KeyPart>,
    B: Into<KeyPart>,
{
    fn from((first, second): (A, B)) -> Self {
        Self(vec![first.into(), second.into()])
    }
}

/// Rejects keys whose component count differs from the descriptor.
pub fn check_key_arity(descriptor: &EntityDescriptor, key: &EntityKey) -> RepoResult<()> {
    if key.len() != descriptor.key_arity() {
        return Err(RepoError::KeyArity {
            entity: descriptor.table,
            expected: descriptor.key_arity(),
            actual: key.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum Columns {
    Static(&'static [&'static str]),
    Owned(Arc<[String]>),
}

/// Named row returned by a data context.
#[derive(Debug, Clone)]
pub struct Record {
    columns: Columns,
    values: Vec<Value>,
}

impl Record {
    /// Row shaped by an entity descriptor; `values` follow `descriptor.columns`.
    pub fn from_descriptor(descriptor: &EntityDescriptor, values: Vec<Value>) -> Self {
        Self {
            columns: Columns::Static(descriptor.columns),
            values,
        }
    }

    /// Row shaped by ad hoc statement columns.
    pub fn with_columns(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self {
            columns: Columns::Owned(columns),
            values,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        match &self.columns {
            Columns::Static(names) => names.to_vec(),
            Columns::Owned(names) => names.iter().map(String::as_str).collect(),
        }
    }

    fn position(&self, column: &str) -> Option<usize> {
        match &self.columns {
            Columns::Static(names) => names.iter().position(|name| *name == column),
            Columns::Owned(names) => names.iter().position(|name| name == column),
        }
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.position(column).and_then(|index| self.values.get(index))
    }

    /// Reads one column converted through `FromSql`.
    ///
    /// # Errors
    /// - `InvalidData` when the column is missing or has an incompatible type.
    pub fn get<T: FromSql>(&self, column: &str) -> RepoResult<T> {
        let value = self
            .value(column)
            .ok_or_else(|| RepoError::InvalidData(format!("missing column `{column}`")))?;
        T::column_result(ValueRef::from(value)).map_err(|err| {
            RepoError::InvalidData(format!("invalid value in column `{column}`: {err}"))
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Contract for persisted record types.
///
/// Implementors are default-constructible so generic code can create blank
/// instances, and are compared for identity by `key()` only.
pub trait Entity: Clone + Default + 'static {
    /// Static storage description shared by all instances.
    fn descriptor() -> &'static EntityDescriptor;

    /// Identity of this instance.
    fn key(&self) -> EntityKey;

    /// Column values in `descriptor().columns` order.
    fn to_values(&self) -> Vec<Value>;

    /// Materializes one entity from a stored row.
    fn from_record(record: &Record) -> RepoResult<Self>;

    /// Write-time validation hook. Rejections surface as `RepoError::Validation`.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Identity equality: two instances are the same entity when keys match.
    fn same_identity(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

#[cfg(test)]
mod tests {
    use super::{check_key_arity, Entity, EntityDescriptor, EntityKey, KeyPart, Record};
    use crate::repo::{RepoError, RepoResult};
    use rusqlite::types::Value;
    use std::sync::Arc;
    use uuid::Uuid;

    static LINES: EntityDescriptor = EntityDescriptor {
        table: "order_lines",
        key_columns: &["order_id", "line_no"],
        columns: &["order_id", "line_no", "sku"],
    };

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Line {
        order_id: i64,
        line_no: i64,
        sku: String,
    }

    impl Entity for Line {
        fn descriptor() -> &'static EntityDescriptor {
            &LINES
        }

        fn key(&self) -> EntityKey {
            EntityKey::from((self.order_id, self.line_no))
        }

        fn to_values(&self) -> Vec<Value> {
            vec![
                Value::Integer(self.order_id),
                Value::Integer(self.line_no),
                Value::Text(self.sku.clone()),
            ]
        }

        fn from_record(record: &Record) -> RepoResult<Self> {
            Ok(Self {
                order_id: record.get("order_id")?,
                line_no: record.get("line_no")?,
                sku: record.get("sku")?,
            })
        }
    }

    #[test]
    fn non_key_columns_skip_key_parts() {
        let names: Vec<_> = LINES.non_key_columns().map(|(_, name)| name).collect();
        assert_eq!(names, vec!["sku"]);
        assert_eq!(LINES.column_index("sku"), Some(2));
    }

    #[test]
    fn composite_key_keeps_component_order() {
        let key = EntityKey::composite([7_i64, 2]);
        assert_eq!(key.parts(), &[KeyPart::Integer(7), KeyPart::Integer(2)]);
        assert_eq!(key, EntityKey::from((7_i64, 2_i64)));
        assert_ne!(key, EntityKey::composite([2_i64, 7]));
        assert_eq!(key.to_string(), "(7, 2)");
    }

    #[test]
    fn uuid_key_is_stored_as_text() {
        let id = Uuid::new_v4();
        let key = EntityKey::from(id);
        assert_eq!(key.to_values(), vec![Value::Text(id.to_string())]);
        assert_eq!(key.to_string(), id.to_string());
    }

    #[test]
    fn key_arity_mismatch_is_rejected() {
        let err = check_key_arity(&LINES, &EntityKey::from(1_i64)).unwrap_err();
        assert!(matches!(
            err,
            RepoError::KeyArity {
                expected: 2,
                actual: 1,
                ..
            }
        ));
        check_key_arity(&LINES, &EntityKey::from((1_i64, 1_i64))).unwrap();
    }

    #[test]
    fn record_reads_typed_columns_and_reports_missing_ones() {
        let record = Record::from_descriptor(
            &LINES,
            vec![
                Value::Integer(1),
                Value::Integer(3),
                Value::Text("sku-1".into()),
            ],
        );
        let line = Line::from_record(&record).unwrap();
        assert_eq!(line.sku, "sku-1");
        assert_eq!(line.key(), EntityKey::from((1_i64, 3_i64)));

        let err = record.get::<String>("missing").unwrap_err();
        assert!(matches!(err, RepoError::InvalidData(message) if message.contains("missing")));

        let err = record.get::<i64>("sku").unwrap_err();
        assert!(matches!(err, RepoError::InvalidData(_)));
    }

    #[test]
    fn owned_columns_resolve_by_name() {
        let columns: Arc<[String]> = vec!["total".to_string()].into();
        let record = Record::with_columns(columns, vec![Value::Integer(42)]);
        assert_eq!(record.get::<i64>("total").unwrap(), 42);
        assert_eq!(record.column_names(), vec!["total"]);
    }

    #[test]
    fn identity_equality_ignores_non_key_fields() {
        let a = Line {
            order_id: 1,
            line_no: 1,
            sku: "a".into(),
        };
        let mut b = a.clone();
        b.sku = "b".into();
        assert!(a.same_identity(&b));
        assert_ne!(a, b);
    }
}
