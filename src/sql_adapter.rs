//! [`Adapter`] implementation shared by every SQL backend.
//!
//! Statements come from [`SqlPlanner`] and the backend's dialect; this module
//! only sequences them, recovers generated ids and maps storage rows back to
//! logical records.

use crate::adapter::{pinned, upsert_record, Adapter, AdapterKind, Capabilities, RecordStream};
use crate::backend::{ConnectionId, DatabaseBackend, Record};
use crate::builder::{RowShape, SqlPlanner, Statement};
use crate::condition::Condition;
use crate::connection::ConnectionConfig;
use crate::dialect::{Dialect, InsertIdPosition};
use crate::diff::SchemaOperation;
use crate::error::{QueryError, Result};
use crate::query::QueryOptions;
use crate::schema::{ColumnProperty, IndexDef, Integrity, ModelSchema, TypeClass};
use crate::snapshot::Schemas;
use crate::transaction::{IsolationLevel, Transaction};
use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct SqlAdapter<B: DatabaseBackend> {
    backend: B,
}

impl<B: DatabaseBackend> SqlAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn dialect(&self) -> &dyn Dialect {
        self.backend.dialect()
    }

    async fn run_ddl(&self, statements: Vec<String>) -> Result<()> {
        for sql in statements {
            debug!("DDL: {}", sql);
            self.backend.execute(&Statement::raw(sql), None).await?;
        }
        Ok(())
    }

    /// Insert rows, returning their ids in input order
    async fn insert(
        &self,
        model: &ModelSchema,
        rows: &[HashMap<String, Value>],
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Value>> {
        let connection = pinned(transaction)?;
        let planner = SqlPlanner::new(self.dialect(), model);
        let statement = match rows {
            [row] => planner.insert(row)?,
            _ => planner.insert_bulk(rows)?,
        };

        let position = self.dialect().insert_id_position();
        if position == InsertIdPosition::Returned {
            let returned = self.backend.query(&statement, connection).await?;
            return Ok(returned
                .iter()
                .map(|r| r.get_value("id").cloned().unwrap_or(Value::Null))
                .collect());
        }

        let result = self.backend.execute(&statement, connection).await?;
        let reported = result.last_insert_id;
        let count = rows.len() as i64;
        // the engine reports either the first or the last generated id of the batch
        let first = reported.map(|id| match position {
            InsertIdPosition::First => id,
            _ => id - (count - 1),
        });

        rows.iter()
            .enumerate()
            .map(|(i, row)| match row.get("id").filter(|v| !v.is_null()) {
                Some(id) => Ok(id.clone()),
                None => first.map(|id| Value::from(id + i as i64)).ok_or_else(|| {
                    QueryError::Database(format!("{} insert reported no generated id", model.name))
                }),
            })
            .collect()
    }
}

/// Rebuild a logical record from a storage row
pub(crate) fn decode_row(model: &ModelSchema, shape: &RowShape, row: Record) -> Record {
    let mut record = Record::new();
    for (key, value) in row.columns {
        let decoded = match shape {
            RowShape::Model => model
                .get_by_storage(&key)
                .map(|column| (column.name.clone(), decode_value(column.type_class, column.array, value.clone()))),
            RowShape::Group(schema) => schema
                .by_alias(&key)
                .map(|field| (field.name.clone(), decode_value(field.type_class, false, value.clone()))),
        };
        match decoded {
            Some((path, value)) => record.set_path(&path, value),
            None => record.insert(key, value),
        }
    }
    record
}

fn decode_value(type_class: TypeClass, array: bool, value: Value) -> Value {
    let structured = array || matches!(type_class, TypeClass::Object | TypeClass::GeoPoint | TypeClass::Vector);
    match (type_class, value) {
        (_, Value::Null) => Value::Null,
        (_, Value::String(text)) if structured => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        (TypeClass::Boolean, Value::Number(n)) => Value::Bool(n.as_f64().is_some_and(|n| n != 0.0)),
        (TypeClass::Date, Value::Number(n)) => n
            .as_f64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis as i64).single())
            .map(|date| Value::String(date.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .unwrap_or(Value::Null),
        (TypeClass::Integer | TypeClass::BigInteger | TypeClass::RecordId, Value::Number(n)) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 => Value::from(f as i64),
            _ => Value::Number(n),
        },
        (_, value) => value,
    }
}

#[async_trait]
impl<B: DatabaseBackend> Adapter for SqlAdapter<B> {
    async fn connect(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(B::connect(config).await?))
    }

    fn kind(&self) -> AdapterKind {
        self.dialect().kind()
    }

    fn capabilities(&self) -> Capabilities {
        self.dialect().capabilities()
    }

    fn type_string(&self, column: &ColumnProperty) -> Result<String> {
        self.dialect().adapter_type_string(column)
    }

    fn render_change_query(&self, operation: &SchemaOperation) -> Option<String> {
        let dialect = self.dialect();
        let rendered = match operation {
            SchemaOperation::AddTable(model) => dialect.create_table_sql(model, &[]).map(|sql| Some(sql.join("; "))),
            SchemaOperation::AddColumn { model, column } => dialect.add_column_sql(&model.table_name, column).map(Some),
            SchemaOperation::AlterColumn { model, column } => dialect.alter_column_sql(&model.table_name, column),
            SchemaOperation::UpdateColumnDescription { model, column } => {
                dialect.column_description_sql(&model.table_name, column)
            }
            SchemaOperation::DropColumn { table, column } => Ok(Some(dialect.drop_column_sql(table, column))),
            SchemaOperation::UpdateTableDescription(model) => Ok(dialect.table_description_sql(model)),
            SchemaOperation::DropTable(table) => Ok(Some(dialect.drop_table_sql(table))),
            SchemaOperation::AddIndex { model, index } => dialect.create_index_sql(model, index).map(Some),
            SchemaOperation::DropIndex { table, index } => Ok(Some(dialect.drop_index_sql(table, index))),
            SchemaOperation::AddForeignKey {
                model,
                column,
                target,
                integrity,
            } => Ok(model
                .get(column)
                .map(|c| dialect.add_foreign_key_sql(&model.table_name, &c.dbname_us, &target.table_name, *integrity))),
        };

        match rendered {
            Ok(sql) => sql,
            Err(e) => {
                debug!("No statement for {:?}: {}", operation, e);
                None
            }
        }
    }

    async fn get_schemas(&self) -> Result<Schemas> {
        self.backend.get_schemas().await
    }

    async fn create_table(&self, model: &ModelSchema) -> Result<()> {
        self.run_ddl(self.dialect().create_table_sql(model, &[])?).await
    }

    async fn add_column(&self, model: &ModelSchema, column: &ColumnProperty) -> Result<()> {
        self.run_ddl(vec![self.dialect().add_column_sql(&model.table_name, column)?])
            .await
    }

    async fn create_index(&self, model: &ModelSchema, index: &IndexDef) -> Result<()> {
        self.run_ddl(vec![self.dialect().create_index_sql(model, index)?]).await
    }

    async fn create_foreign_key(
        &self,
        model: &ModelSchema,
        column: &str,
        target: &ModelSchema,
        integrity: Integrity,
    ) -> Result<()> {
        let column = model
            .get(column)
            .ok_or_else(|| QueryError::UnknownColumn(format!("{}.{}", model.name, column)))?;
        let sql = self
            .dialect()
            .add_foreign_key_sql(&model.table_name, &column.dbname_us, &target.table_name, integrity);
        self.run_ddl(vec![sql]).await
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.run_ddl(vec![self.dialect().drop_table_sql(table)]).await
    }

    async fn drop_index(&self, table: &str, index: &str) -> Result<()> {
        self.run_ddl(vec![self.dialect().drop_index_sql(table, index)]).await
    }

    async fn run_schema_statement(&self, statement: &str) -> Result<()> {
        self.run_ddl(vec![statement.to_string()]).await
    }

    async fn create(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<Value> {
        let ids = self
            .insert(model, std::slice::from_ref(&data.columns), transaction)
            .await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QueryError::Database(format!("{} insert returned no row", model.name)))
    }

    async fn create_bulk(
        &self,
        model: &ModelSchema,
        data: &[Record],
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Value>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<HashMap<String, Value>> = data.iter().map(|r| r.columns.clone()).collect();
        self.insert(model, &rows, transaction).await
    }

    async fn update(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<()> {
        let id = data
            .id()
            .filter(|id| !id.is_null())
            .cloned()
            .ok_or_else(|| QueryError::Query(format!("Updating {} requires an id", model.name)))?;

        let mut values = data.columns.clone();
        values.remove("id");
        let written: HashSet<String> = model
            .flatten(&values)?
            .into_iter()
            .map(|(column, _)| column.name.clone())
            .collect();
        // a full update clears every column the record leaves out
        for column in model.columns().filter(|c| !c.primary_key && !written.contains(&c.name)) {
            values.insert(column.name.clone(), Value::Null);
        }
        if values.is_empty() {
            return Ok(());
        }

        let statement = SqlPlanner::new(self.dialect(), model).update(
            &values,
            &Condition::eq("id", id),
            &QueryOptions::default(),
        )?;
        self.backend.execute(&statement, pinned(transaction)?).await?;
        Ok(())
    }

    async fn update_partial(
        &self,
        model: &ModelSchema,
        data: &Record,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64> {
        let connection = pinned(transaction)?;
        let statement = SqlPlanner::new(self.dialect(), model).update(&data.columns, condition, options)?;
        Ok(self.backend.execute(&statement, connection).await?.rows_affected)
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
            debug!("Upsert on {} matched nothing, inserting", model.name);
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
        let connection = pinned(transaction)?;
        let (statement, shape) = SqlPlanner::new(self.dialect(), model).find(condition, options)?;
        let rows = self.backend.query(&statement, connection).await?;
        Ok(rows.into_iter().map(|row| decode_row(model, &shape, row)).collect())
    }

    async fn find_by_id(
        &self,
        model: &ModelSchema,
        id: &Value,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<Record> {
        let options = QueryOptions {
            limit: Some(1),
            offset: None,
            ..options.clone()
        };
        self.find(model, &Condition::eq("id", id.clone()), &options, transaction)
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
        let connection = pinned(transaction)?;
        let statement = SqlPlanner::new(self.dialect(), model).count(condition, options)?;
        let rows = self.backend.query(&statement, connection).await?;
        let count = rows.first().and_then(|row| row.get_i64("count")).unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64> {
        let connection = pinned(transaction)?;
        let statement = SqlPlanner::new(self.dialect(), model).delete(condition, options)?;
        Ok(self.backend.execute(&statement, connection).await?.rows_affected)
    }

    async fn stream(
        &self,
        model: Arc<ModelSchema>,
        condition: Condition,
        options: QueryOptions,
    ) -> Result<RecordStream> {
        let (statement, shape) = SqlPlanner::new(self.dialect(), &model).find(&condition, &options)?;
        let rows = self.backend.fetch(statement);
        Ok(rows
            .map(move |row| row.map(|row| decode_row(&model, &shape, row)))
            .boxed())
    }

    async fn get_connection(&self) -> Result<ConnectionId> {
        self.backend.acquire().await
    }

    async fn release_connection(&self, connection: ConnectionId) -> Result<()> {
        self.backend.release(connection).await
    }

    async fn start_transaction(&self, connection: ConnectionId, isolation_level: Option<IsolationLevel>) -> Result<()> {
        for sql in self.dialect().begin_statements(isolation_level) {
            self.backend.execute(&Statement::raw(sql), Some(connection)).await?;
        }
        Ok(())
    }

    async fn commit_transaction(&self, connection: ConnectionId) -> Result<()> {
        self.backend.execute(&Statement::raw("COMMIT"), Some(connection)).await?;
        Ok(())
    }

    async fn rollback_transaction(&self, connection: ConnectionId) -> Result<()> {
        self.backend.execute(&Statement::raw("ROLLBACK"), Some(connection)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

#[cfg(feature = "sqlite")]
pub type SqliteAdapter = SqlAdapter<crate::sqlite::SqliteBackend>;

#[cfg(feature = "postgres")]
pub type PostgresAdapter = SqlAdapter<crate::postgres::PostgresBackend>;

#[cfg(feature = "mysql")]
pub type MySqlAdapter = SqlAdapter<crate::mysql::MySqlBackend>;
