//! Redis adapter.
//!
//! Each record is one JSON string under `{table}:{id}`. A set per table
//! tracks stored ids, a counter per table generates them, and `_tables`
//! lists every table. Records are addressed by id only.

use crate::adapter::{upsert_record, Adapter, AdapterKind, Capabilities, RecordStream};
use crate::backend::{ConnectionId, Record};
use crate::condition::Condition;
use crate::connection::ConnectionConfig;
use crate::diff::SchemaOperation;
use crate::error::{QueryError, Result};
use crate::keyvalue::{
    apply_options, check_options, compile_selection, id_string, ids_key, record_key, sequence_key, KeySelection,
    TABLES_KEY,
};
use crate::query::QueryOptions;
use crate::schema::{ColumnProperty, IndexDef, Integrity, ModelSchema, TypeClass};
use crate::snapshot::Schemas;
use crate::transaction::{IsolationLevel, Transaction};
use crate::value::{decode_blob, encode_blob};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RedisAdapter {
    connection: ConnectionManager,
}

impl RedisAdapter {
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis at {}", config.url);
        Ok(Self { connection })
    }

    async fn load(&self, model: &ModelSchema, selection: KeySelection) -> Result<Vec<Record>> {
        let mut connection = self.connection.clone();
        let mut ids: Vec<String> = match selection {
            KeySelection::All => connection.smembers(ids_key(&model.table_name)).await?,
            KeySelection::Ids(ids) => ids.into_iter().collect(),
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort_by(|a, b| compare_ids(a, b));

        let keys: Vec<String> = ids.iter().map(|id| record_key(&model.table_name, id)).collect();
        let stored: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut connection).await?;
        stored
            .into_iter()
            .flatten()
            .map(|json| Record::from_value(serde_json::from_str(&json)?))
            .collect()
    }

    async fn matching(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
    ) -> Result<Vec<Record>> {
        check_options(options)?;
        let selection = compile_selection(condition)?;
        let records = self.load(model, selection).await?;
        apply_options(records, options)
    }

    async fn store(&self, model: &ModelSchema, record: &Record) -> Result<()> {
        let id = record
            .id()
            .map(id_string)
            .ok_or_else(|| QueryError::Query(format!("{} record has no id", model.name)))?;
        let json = serde_json::to_string(&record.to_value())?;
        let mut connection = self.connection.clone();
        redis::pipe()
            .atomic()
            .set(record_key(&model.table_name, &id), json)
            .ignore()
            .sadd(ids_key(&model.table_name), &id)
            .ignore()
            .sadd(TABLES_KEY, &model.table_name)
            .ignore()
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn next_id(&self, model: &ModelSchema) -> Result<Value> {
        let mut connection = self.connection.clone();
        let id: i64 = connection.incr(sequence_key(&model.table_name), 1).await?;
        Ok(Value::from(id))
    }

    async fn remove(&self, table: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = ids.iter().map(|id| record_key(table, id)).collect();
        let mut connection = self.connection.clone();
        redis::pipe()
            .atomic()
            .del(keys)
            .ignore()
            .srem(ids_key(table), ids)
            .ignore()
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }
}

/// Numeric ids sort numerically, others lexically after them
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Declared columns of `data` placed at their logical paths
fn build_record(model: &ModelSchema, data: &Record, id: Value) -> Result<Record> {
    let mut record = Record::new();
    for (column, value) in model.flatten(&data.columns)? {
        if !column.primary_key {
            record.set_path(&column.name, stored_value(column, value)?);
        }
    }
    record.insert("id".to_string(), id);
    Ok(record)
}

/// Blobs are kept as base64 text, the same form every adapter reads back
fn stored_value(column: &ColumnProperty, value: &Value) -> Result<Value> {
    match column.type_class {
        TypeClass::Blob if !value.is_null() && !column.array => {
            Ok(Value::String(encode_blob(&decode_blob(value)?)))
        }
        _ => Ok(value.clone()),
    }
}

/// Merge partial data into a stored record; `{ "$inc": n }` adds to the current value
fn merge_partial(model: &ModelSchema, record: &mut Record, data: &Record) -> Result<()> {
    for (column, value) in model.flatten(&data.columns)? {
        if column.primary_key {
            continue;
        }
        let next = match value {
            Value::Object(map) if map.len() == 1 && map.contains_key("$inc") => {
                let amount = map.get("$inc").unwrap_or(&Value::Null);
                increment(record.get_path(&column.name), amount)?
            }
            other => stored_value(column, other)?,
        };
        record.set_path(&column.name, next);
    }
    Ok(())
}

fn increment(current: Option<&Value>, amount: &Value) -> Result<Value> {
    let current = current.filter(|v| !v.is_null()).cloned().unwrap_or(Value::from(0));
    match (current.as_i64(), amount.as_i64()) {
        (Some(a), Some(b)) => Ok(Value::from(a.saturating_add(b))),
        _ => match (current.as_f64(), amount.as_f64()) {
            (Some(a), Some(b)) => Ok(Number::from_f64(a + b).map(Value::Number).unwrap_or(Value::Null)),
            _ => Err(QueryError::InvalidExpression(format!(
                "cannot increment {} by {}",
                current, amount
            ))),
        },
    }
}

#[async_trait]
impl Adapter for RedisAdapter {
    async fn connect(config: &ConnectionConfig) -> Result<Self> {
        Self::new(config).await
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::KeyValueStore
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn type_string(&self, column: &ColumnProperty) -> Result<String> {
        Ok(column.type_class.to_string().to_uppercase())
    }

    fn render_change_query(&self, _operation: &SchemaOperation) -> Option<String> {
        None
    }

    async fn get_schemas(&self) -> Result<Schemas> {
        let mut connection = self.connection.clone();
        let tables: Vec<String> = connection.smembers(TABLES_KEY).await?;
        Ok(tables
            .into_iter()
            .fold(Schemas::new(), |schemas, table| schemas.with_schemaless_table(table)))
    }

    async fn create_table(&self, model: &ModelSchema) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = connection.sadd(TABLES_KEY, &model.table_name).await?;
        Ok(())
    }

    async fn add_column(&self, _model: &ModelSchema, _column: &ColumnProperty) -> Result<()> {
        Ok(())
    }

    async fn create_index(&self, model: &ModelSchema, index: &IndexDef) -> Result<()> {
        debug!("Key-value store keeps no index {} on {}", index.name, model.table_name);
        Ok(())
    }

    async fn create_foreign_key(
        &self,
        _model: &ModelSchema,
        _column: &str,
        _target: &ModelSchema,
        _integrity: Integrity,
    ) -> Result<()> {
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let ids: Vec<String> = connection.smembers(ids_key(table)).await?;
        self.remove(table, &ids).await?;
        redis::pipe()
            .atomic()
            .del(ids_key(table))
            .ignore()
            .del(sequence_key(table))
            .ignore()
            .srem(TABLES_KEY, table)
            .ignore()
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn drop_index(&self, _table: &str, _index: &str) -> Result<()> {
        Ok(())
    }

    async fn run_schema_statement(&self, statement: &str) -> Result<()> {
        Err(QueryError::UnsupportedFeature(format!(
            "schema statement on a key-value store: {}",
            statement
        )))
    }

    async fn create(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<Value> {
        if transaction.is_some() {
            return Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()));
        }
        let id = match data.id() {
            Some(id) => id.clone(),
            None => self.next_id(model).await?,
        };
        let record = build_record(model, data, id.clone())?;
        self.store(model, &record).await?;
        Ok(id)
    }

    async fn create_bulk(
        &self,
        model: &ModelSchema,
        data: &[Record],
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Value>> {
        let mut ids = Vec::with_capacity(data.len());
        for record in data {
            ids.push(self.create(model, record, transaction).await?);
        }
        Ok(ids)
    }

    async fn update(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<()> {
        if transaction.is_some() {
            return Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()));
        }
        let id = data
            .id()
            .cloned()
            .ok_or_else(|| QueryError::Query(format!("Updating {} requires an id", model.name)))?;
        let mut connection = self.connection.clone();
        let exists: bool = connection.exists(record_key(&model.table_name, &id_string(&id))).await?;
        if !exists {
            debug!("Update of {} {} matched nothing", model.name, id);
            return Ok(());
        }
        let record = build_record(model, data, id)?;
        self.store(model, &record).await
    }

    async fn update_partial(
        &self,
        model: &ModelSchema,
        data: &Record,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64> {
        if transaction.is_some() {
            return Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()));
        }
        let records = self.matching(model, condition, options).await?;
        let count = records.len() as u64;
        for mut record in records {
            merge_partial(model, &mut record, data)?;
            self.store(model, &record).await?;
        }
        Ok(count)
    }

    async fn upsert(
        &self,
        model: &ModelSchema,
        data: &Record,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<()> {
        let updated = self
            .update_partial(model, data, condition, options, transaction)
            .await?;
        if updated == 0 {
            self.create(model, &upsert_record(condition, data), transaction).await?;
        }
        Ok(())
    }

    async fn find(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Record>> {
        if transaction.is_some() {
            return Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()));
        }
        self.matching(model, condition, options).await
    }

    async fn find_by_id(
        &self,
        model: &ModelSchema,
        id: &Value,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<Record> {
        self.find(model, &Condition::eq("id", id.clone()), options, transaction)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::NotFound(format!("{} {}", model.name, id)))
    }

    async fn count(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64> {
        Ok(self.find(model, condition, options, transaction).await?.len() as u64)
    }

    async fn delete(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64> {
        let ids: Vec<String> = self
            .find(model, condition, options, transaction)
            .await?
            .iter()
            .filter_map(|record| record.id().map(id_string))
            .collect();
        self.remove(&model.table_name, &ids).await?;
        Ok(ids.len() as u64)
    }

    async fn stream(
        &self,
        model: Arc<ModelSchema>,
        condition: Condition,
        options: QueryOptions,
    ) -> Result<RecordStream> {
        let records = self.matching(&model, &condition, &options).await?;
        Ok(stream::iter(records.into_iter().map(Ok)).boxed())
    }

    async fn get_connection(&self) -> Result<ConnectionId> {
        Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()))
    }

    async fn release_connection(&self, _connection: ConnectionId) -> Result<()> {
        Ok(())
    }

    async fn start_transaction(&self, _connection: ConnectionId, _isolation_level: Option<IsolationLevel>) -> Result<()> {
        Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()))
    }

    async fn commit_transaction(&self, _connection: ConnectionId) -> Result<()> {
        Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()))
    }

    async fn rollback_transaction(&self, _connection: ConnectionId) -> Result<()> {
        Err(QueryError::UnsupportedFeature("transactions on a key-value store".to_string()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::schema::ModelRegistry;
    use serde_json::json;

    fn product() -> Arc<ModelSchema> {
        ModelRegistry::new()
            .register(
                ModelSchema::new("Product")
                    .column(ColumnProperty::new("name", TypeClass::String))
                    .column(ColumnProperty::new("stock.count", TypeClass::Integer))
                    .column(ColumnProperty::new("thumbnail", TypeClass::Blob)),
            )
            .unwrap()
    }

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_build_record_rejects_unknown_columns() {
        let model = product();
        let built = build_record(&model, &record(json!({ "name": "lamp", "stock": { "count": 2 } })), json!(4)).unwrap();
        assert_eq!(built.get_i64("id"), Some(4));
        assert_eq!(built.get_path("stock.count"), Some(&json!(2)));

        let err = build_record(&model, &record(json!({ "colour": "red" })), json!(5));
        assert!(matches!(err, Err(QueryError::UnknownColumn(_))));
    }

    #[test]
    fn test_blob_stored_as_base64() {
        let model = product();
        let built = build_record(&model, &record(json!({ "thumbnail": [104, 105] })), json!(1)).unwrap();
        assert_eq!(built.get_path("thumbnail"), Some(&json!("aGk=")));

        let mut stored = built.clone();
        merge_partial(&model, &mut stored, &record(json!({ "thumbnail": "aGk=" }))).unwrap();
        assert_eq!(stored.get_path("thumbnail"), Some(&json!("aGk=")));

        let err = build_record(&model, &record(json!({ "thumbnail": [104, 361] })), json!(2));
        assert!(matches!(err, Err(QueryError::Serialization(_))));
    }

    #[test]
    fn test_merge_partial_increments() {
        let model = product();
        let mut stored = record(json!({ "id": 1, "name": "lamp", "stock": { "count": 2 } }));
        merge_partial(
            &model,
            &mut stored,
            &record(json!({ "name": "desk lamp", "stock": { "count": { "$inc": 3 } } })),
        )
        .unwrap();
        assert_eq!(stored.get_string("name"), Some("desk lamp".to_string()));
        assert_eq!(stored.get_path("stock.count"), Some(&json!(5)));

        assert!(increment(Some(&json!("x")), &json!(1)).is_err());
        assert_eq!(increment(None, &json!(1.5)).unwrap(), json!(1.5));
    }

    #[test]
    fn test_id_order() {
        let mut ids = vec!["10".to_string(), "b".to_string(), "2".to_string(), "a".to_string()];
        ids.sort_by(|a, b| compare_ids(a, b));
        assert_eq!(ids, ["2", "10", "a", "b"]);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_crud_by_id() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let connection = Connection::<RedisAdapter>::connect(ConnectionConfig::new(url)).await.unwrap();
        connection
            .register(ModelSchema::new("Product").column(ColumnProperty::new("name", TypeClass::String)))
            .unwrap();
        connection.adapter().drop_table("products").await.unwrap();
        connection.apply_schemas().await.unwrap();

        let id = connection
            .create("Product", record(json!({ "name": "lamp" })), None)
            .await
            .unwrap();
        assert_eq!(connection.find("Product", id.clone()).await.unwrap().get_string("name"), Some("lamp".to_string()));

        let filtered = connection
            .query("Product")
            .unwrap()
            .where_json(json!({ "name": "lamp" }))
            .unwrap()
            .exec()
            .await;
        assert!(matches!(filtered, Err(QueryError::UnsupportedFeature(_))));

        assert_eq!(connection.query("Product").unwrap().find(id).delete().await.unwrap(), 1);
        assert_eq!(connection.query("Product").unwrap().count().await.unwrap(), 0);
    }
}
