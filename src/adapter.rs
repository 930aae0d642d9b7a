//! The backend-neutral adapter contract.
//!
//! An [`Adapter`] owns one storage engine: it introspects the live schema,
//! executes DDL, and runs compiled queries. Everything above this trait
//! (queries, schema application, integrity emulation) is engine-agnostic.

use crate::backend::{ConnectionId, Record};
use crate::condition::Condition;
use crate::connection::ConnectionConfig;
use crate::diff::SchemaOperation;
use crate::error::Result;
use crate::query::QueryOptions;
use crate::schema::{ColumnProperty, IndexDef, Integrity, ModelSchema};
use crate::snapshot::Schemas;
use crate::transaction::{IsolationLevel, Transaction};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    GenericSql,
    MySql,
    Postgres,
    Sqlite,
    DocumentStore,
    KeyValueStore,
}

impl AdapterKind {
    pub fn is_sql(&self) -> bool {
        matches!(
            self,
            AdapterKind::GenericSql | AdapterKind::MySql | AdapterKind::Postgres | AdapterKind::Sqlite
        )
    }
}

/// What an adapter can do natively
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Foreign keys are enforced by the engine
    pub native_integrity: bool,
    pub geo: bool,
    pub vector: bool,
    pub regex: bool,
    /// Table and column comments are stored and introspectable
    pub descriptions: bool,
    pub group_by: bool,
    pub joins: bool,
}

pub type RecordStream = BoxStream<'static, Result<Record>>;

#[async_trait]
pub trait Adapter: Send + Sync {
    async fn connect(config: &ConnectionConfig) -> Result<Self>
    where
        Self: Sized;

    fn kind(&self) -> AdapterKind;

    fn capabilities(&self) -> Capabilities;

    /// Type string the catalog will report for a declared column
    fn type_string(&self, column: &ColumnProperty) -> Result<String>;

    /// Rendered statement for a planned schema change, if the engine has one
    fn render_change_query(&self, operation: &SchemaOperation) -> Option<String>;

    async fn get_schemas(&self) -> Result<Schemas>;

    async fn create_table(&self, model: &ModelSchema) -> Result<()>;

    async fn add_column(&self, model: &ModelSchema, column: &ColumnProperty) -> Result<()>;

    async fn create_index(&self, model: &ModelSchema, index: &IndexDef) -> Result<()>;

    async fn create_foreign_key(
        &self,
        model: &ModelSchema,
        column: &str,
        target: &ModelSchema,
        integrity: Integrity,
    ) -> Result<()>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    async fn drop_index(&self, table: &str, index: &str) -> Result<()>;

    /// Run a schema statement produced by [`render_change_query`](Self::render_change_query)
    async fn run_schema_statement(&self, statement: &str) -> Result<()>;

    /// Insert one record, returning its id
    async fn create(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<Value>;

    async fn create_bulk(
        &self,
        model: &ModelSchema,
        data: &[Record],
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Value>>;

    /// Overwrite the record identified by `data["id"]`
    async fn update(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<()>;

    /// Apply `data` to every matching record, returning the count changed
    async fn update_partial(
        &self,
        model: &ModelSchema,
        data: &Record,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64>;

    async fn upsert(
        &self,
        model: &ModelSchema,
        data: &Record,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<()>;

    async fn find(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Record>>;

    async fn find_by_id(
        &self,
        model: &ModelSchema,
        id: &Value,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<Record>;

    async fn count(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64>;

    async fn delete(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64>;

    /// Lazily stream matching records
    async fn stream(
        &self,
        model: Arc<ModelSchema>,
        condition: Condition,
        options: QueryOptions,
    ) -> Result<RecordStream>;

    async fn get_connection(&self) -> Result<ConnectionId>;

    async fn release_connection(&self, connection: ConnectionId) -> Result<()>;

    async fn start_transaction(&self, connection: ConnectionId, isolation_level: Option<IsolationLevel>) -> Result<()>;

    async fn commit_transaction(&self, connection: ConnectionId) -> Result<()>;

    async fn rollback_transaction(&self, connection: ConnectionId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Pinned connection of an optional transaction
pub(crate) fn pinned(transaction: Option<&Transaction>) -> Result<Option<ConnectionId>> {
    transaction.map(Transaction::check_active).transpose()
}

/// Record inserted by an upsert that matched nothing: the data, with
/// increments taken as literal values, plus the condition's equalities
pub(crate) fn upsert_record(condition: &Condition, data: &Record) -> Record {
    let mut record = Record::new();
    for (key, value) in &data.columns {
        record.insert(key.clone(), increment_literal(value));
    }
    for (path, value) in condition.equalities() {
        if record.get_path(path).is_none() && !record.contains(path) {
            record.set_path(path, value.clone());
        }
    }
    record
}

fn increment_literal(value: &Value) -> Value {
    match value {
        Value::Object(map) => match map.get("$inc") {
            Some(amount) if map.len() == 1 => amount.clone(),
            _ => Value::Object(map.iter().map(|(k, v)| (k.clone(), increment_literal(v))).collect()),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_record_merges_condition() {
        let condition = Condition::and(vec![
            Condition::eq("sku", "A-1"),
            Condition::eq("stock.warehouse", "north"),
            Condition::eq("price", 3),
        ]);
        let data = Record::from_value(json!({ "price": 5, "stock": { "count": { "$inc": 2 } }, "hits": { "$inc": 1 } })).unwrap();

        let record = upsert_record(&condition, &data);
        assert_eq!(record.get_value("sku"), Some(&json!("A-1")));
        assert_eq!(record.get_value("price"), Some(&json!(5)));
        assert_eq!(record.get_value("hits"), Some(&json!(1)));
        assert_eq!(record.get_path("stock.warehouse"), Some(&json!("north")));
        assert_eq!(record.get_path("stock.count"), Some(&json!(2)));
    }

    #[test]
    fn test_adapter_kind_is_sql() {
        assert!(AdapterKind::Postgres.is_sql());
        assert!(!AdapterKind::DocumentStore.is_sql());
    }
}
