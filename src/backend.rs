use crate::builder::Statement;
use crate::connection::ConnectionConfig;
use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use crate::snapshot::Schemas;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One record, keyed by column name
///
/// Backends return rows keyed by storage name; adapters hand records to
/// callers keyed by logical column path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub columns: HashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            columns: HashMap::new(),
        }
    }

    /// Build from a JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self {
                columns: map.into_iter().collect(),
            }),
            other => Err(QueryError::Serialization(format!(
                "record must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.columns.clone().into_iter().collect::<Map<String, Value>>())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.columns.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.columns.contains_key(key)
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.columns.get(key)
    }

    /// Value at a dotted path through nested objects
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.columns.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Set a value at a dotted path, creating intermediate objects
    pub fn set_path(&mut self, path: &str, value: Value) {
        match path.split_once('.') {
            None => self.insert(path.to_string(), value),
            Some((head, rest)) => {
                let entry = self
                    .columns
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                set_in(entry, rest, value);
            }
        }
    }

    pub fn id(&self) -> Option<&Value> {
        self.columns.get("id").filter(|v| !v.is_null())
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.columns.get(key).and_then(|v| v.as_bool())
    }
}

fn set_in(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            set_in(entry, rest, value);
        }
    }
}

impl From<Value> for Record {
    /// Non-object values yield an empty record
    fn from(value: Value) -> Self {
        Record::from_value(value).unwrap_or_default()
    }
}

/// Outcome of a statement that returns no rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Handle of a connection pinned out of the pool for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// SQL executor behind [`SqlAdapter`](crate::sql_adapter::SqlAdapter)
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    async fn connect(config: &ConnectionConfig) -> Result<Self>
    where
        Self: Sized;

    fn dialect(&self) -> &dyn Dialect;

    /// Execute a statement, on a pinned connection if one is given
    async fn execute(&self, statement: &Statement, connection: Option<ConnectionId>) -> Result<ExecResult>;

    async fn query(&self, statement: &Statement, connection: Option<ConnectionId>) -> Result<Vec<Record>>;

    /// Introspect tables, indexes and foreign keys from the catalog
    async fn get_schemas(&self) -> Result<Schemas>;

    /// Stream rows one at a time from a pooled connection
    fn fetch(&self, statement: Statement) -> BoxStream<'static, Result<Record>>;

    /// Take a connection out of the pool until [`release`](Self::release)
    async fn acquire(&self) -> Result<ConnectionId>;

    async fn release(&self, connection: ConnectionId) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Connections taken out of a pool, addressed by [`ConnectionId`]
///
/// Each slot has its own lock so statements on different transactions do
/// not wait on each other.
pub struct PinnedConnections<C> {
    next: AtomicU64,
    slots: Mutex<HashMap<ConnectionId, Arc<Mutex<C>>>>,
}

impl<C> Default for PinnedConnections<C> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> PinnedConnections<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, connection: C) -> ConnectionId {
        let id = ConnectionId(self.next.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().await.insert(id, Arc::new(Mutex::new(connection)));
        id
    }

    /// The pinned connection; lock it for the duration of one statement
    pub async fn get(&self, id: ConnectionId) -> Result<Arc<Mutex<C>>> {
        self.slots.lock().await.get(&id).cloned().ok_or_else(|| missing(id))
    }

    pub async fn remove(&self, id: ConnectionId) -> Result<C> {
        let slot = self.slots.lock().await.remove(&id).ok_or_else(|| missing(id))?;
        Arc::try_unwrap(slot)
            .map(Mutex::into_inner)
            .map_err(|_| QueryError::Transaction(format!("Connection {:?} is still in use", id)))
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

pub fn missing(id: ConnectionId) -> QueryError {
    QueryError::Transaction(format!("Connection {:?} is not pinned", id))
}

/// Snapshot of the live catalog from rows of the catalog queries
#[cfg(any(feature = "postgres", feature = "mysql"))]
pub(crate) fn schemas_from_catalog(
    dialect: &dyn Dialect,
    tables: &[Record],
    columns: &[Record],
    indexes: &[Record],
    foreign_keys: &[Record],
) -> Schemas {
    use crate::snapshot::{ColumnSnapshot, SchemasTable};
    use std::collections::BTreeMap;

    let mut built: BTreeMap<String, SchemasTable> = BTreeMap::new();
    for table in tables {
        if let Some(name) = table.get_string("table_name") {
            let mut snapshot = SchemasTable::new();
            snapshot.description = table.get_string("description").filter(|d| !d.is_empty());
            built.insert(name, snapshot);
        }
    }

    for column in columns {
        let (Some(table), Some(name)) = (column.get_string("table_name"), column.get_string("column_name")) else {
            continue;
        };
        let Some(snapshot) = built.get_mut(&table) else {
            continue;
        };
        let raw_type = match column.get_string("data_type").as_deref() {
            Some("USER-DEFINED") | None => column.get_string("udt_name").unwrap_or_default(),
            Some(data_type) => data_type.to_string(),
        };
        let required = column.get_string("is_nullable").as_deref() == Some("NO");
        let mut entry = ColumnSnapshot::new(dialect.normalize_type_string(&raw_type), required);
        entry.description = column.get_string("description").filter(|d| !d.is_empty());
        snapshot.columns.insert(name, entry);
    }

    let mut schemas = Schemas::new();
    for (name, table) in built {
        schemas = schemas.with_table(name, table);
    }

    let mut grouped: BTreeMap<(String, String), (Vec<String>, bool)> = BTreeMap::new();
    for index in indexes {
        let (Some(table), Some(name), Some(column)) = (
            index.get_string("table_name"),
            index.get_string("index_name"),
            index.get_string("column_name"),
        ) else {
            continue;
        };
        let unique = index
            .get_bool("is_unique")
            .or_else(|| index.get_i64("non_unique").map(|n| n == 0))
            .unwrap_or(false);
        let entry = grouped.entry((table, name)).or_insert_with(|| (Vec::new(), unique));
        entry.0.push(column);
    }
    for ((table, name), (columns, unique)) in grouped {
        schemas = schemas.with_index(table, name, columns, unique);
    }

    for fk in foreign_keys {
        if let (Some(table), Some(column), Some(referenced)) = (
            fk.get_string("table_name"),
            fk.get_string("column_name"),
            fk.get_string("referenced_table"),
        ) {
            schemas = schemas.with_foreign_key(table, column, referenced);
        }
    }

    schemas
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_getters() {
        let record = Record::from_value(json!({ "id": 1, "name": "Alice", "price": 2.5, "paid": true })).unwrap();
        assert_eq!(record.id(), Some(&json!(1)));
        assert_eq!(record.get_string("name"), Some("Alice".to_string()));
        assert_eq!(record.get_f64("price"), Some(2.5));
        assert_eq!(record.get_bool("paid"), Some(true));
        assert_eq!(record.get_i64("missing"), None);
    }

    #[test]
    fn test_record_paths() {
        let mut record = Record::new();
        record.set_path("address.city", json!("Oslo"));
        record.set_path("address.zip", json!("0150"));
        record.set_path("name", json!("Ann"));
        assert_eq!(record.get_value("address"), Some(&json!({ "city": "Oslo", "zip": "0150" })));
        assert_eq!(record.get_path("address.zip"), Some(&json!("0150")));
        assert_eq!(record.get_path("name.first"), None);
    }

    #[test]
    fn test_record_from_non_object() {
        assert!(Record::from_value(json!([1, 2])).is_err());
        assert!(Record::from(json!(null)).columns.is_empty());
    }

    #[tokio::test]
    async fn test_pinned_connections() {
        let pinned = PinnedConnections::new();
        let a = pinned.insert("a").await;
        let b = pinned.insert("b").await;
        assert_ne!(a, b);
        assert_eq!(pinned.len().await, 2);
        assert_eq!(*pinned.get(b).await.unwrap().lock().await, "b");
        assert_eq!(pinned.remove(a).await.unwrap(), "a");
        assert!(pinned.remove(a).await.is_err());
        assert!(pinned.get(a).await.is_err());
    }

    #[test]
    #[cfg(any(feature = "postgres", feature = "mysql"))]
    fn test_schemas_from_catalog() {
        let record = |v: Value| Record::from(v);
        let schemas = schemas_from_catalog(
            &crate::dialect::PostgresDialect,
            &[record(json!({ "table_name": "orders", "description": "All orders" }))],
            &[
                record(json!({ "table_name": "orders", "column_name": "id", "data_type": "integer", "udt_name": "int4", "is_nullable": "NO" })),
                record(json!({ "table_name": "orders", "column_name": "customer", "data_type": "character varying", "udt_name": "varchar", "is_nullable": "YES", "description": "Who" })),
                record(json!({ "table_name": "orders", "column_name": "embedding", "data_type": "USER-DEFINED", "udt_name": "vector", "is_nullable": "YES" })),
            ],
            &[
                record(json!({ "table_name": "orders", "index_name": "orders_customer_id", "column_name": "customer", "is_unique": false })),
                record(json!({ "table_name": "orders", "index_name": "orders_customer_id", "column_name": "id", "is_unique": false })),
            ],
            &[record(json!({ "table_name": "orders", "column_name": "user_id", "referenced_table": "users" }))],
        );

        let crate::snapshot::TableSnapshot::Columns(table) = schemas.table("orders").unwrap() else {
            panic!("expected columns");
        };
        assert_eq!(table.description.as_deref(), Some("All orders"));
        assert!(table.columns["id"].required);
        assert_eq!(table.columns["customer"].adapter_type_string, "CHARACTER VARYING");
        assert_eq!(table.columns["customer"].description.as_deref(), Some("Who"));
        assert_eq!(table.columns["embedding"].adapter_type_string, "VECTOR");
        assert_eq!(
            schemas.index("orders", "orders_customer_id").unwrap().columns,
            vec!["customer", "id"]
        );
        assert_eq!(schemas.foreign_key("orders", "user_id").map(String::as_str), Some("users"));
    }
}
