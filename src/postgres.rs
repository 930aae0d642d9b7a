use crate::backend::{schemas_from_catalog, ConnectionId, DatabaseBackend, ExecResult, PinnedConnections, Record};
use crate::builder::Statement;
use crate::connection::ConnectionConfig;
use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{QueryError, Result};
use crate::snapshot::Schemas;
use crate::value::{encode_blob, Param};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row};
use tracing::debug;

const TABLES_SQL: &str = "SELECT c.relname::text AS table_name, obj_description(c.oid, 'pg_class') AS description \
     FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = current_schema() AND c.relkind = 'r' ORDER BY c.relname";

const COLUMNS_SQL: &str = "SELECT c.table_name::text AS table_name, c.column_name::text AS column_name, \
     c.data_type::text AS data_type, c.udt_name::text AS udt_name, c.is_nullable::text AS is_nullable, \
     col_description(format('%I.%I', c.table_schema, c.table_name)::regclass, c.ordinal_position::int) AS description \
     FROM information_schema.columns c WHERE c.table_schema = current_schema() \
     ORDER BY c.table_name, c.ordinal_position";

const INDEXES_SQL: &str = "SELECT t.relname::text AS table_name, i.relname::text AS index_name, \
     a.attname::text AS column_name, ix.indisunique AS is_unique \
     FROM pg_class t JOIN pg_index ix ON t.oid = ix.indrelid JOIN pg_class i ON i.oid = ix.indexrelid \
     JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
     JOIN pg_namespace n ON n.oid = t.relnamespace \
     WHERE n.nspname = current_schema() AND t.relkind = 'r' AND NOT ix.indisprimary \
     ORDER BY t.relname, i.relname, array_position(ix.indkey::int2[], a.attnum)";

const FOREIGN_KEYS_SQL: &str = "SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS column_name, \
     ccu.table_name::text AS referenced_table \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     JOIN information_schema.constraint_column_usage ccu \
       ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = current_schema()";

pub struct PostgresBackend {
    pool: PgPool,
    pinned: PinnedConnections<PoolConnection<Postgres>>,
    dialect: PostgresDialect,
}

impl PostgresBackend {
    /// Create a new PostgreSQL backend with connection pool
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        debug!("Connected to PostgreSQL");
        Ok(Self {
            pool,
            pinned: PinnedConnections::new(),
            dialect: PostgresDialect,
        })
    }

    /// Convert PostgreSQL row to Record
    fn convert_row(row: &PgRow) -> Record {
        let mut record = Record::new();

        for column in row.columns() {
            let column_name = column.name();

            let value = if let Ok(Some(value)) = row.try_get::<Option<Value>, _>(column_name) {
                value
            } else if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column_name) {
                Value::String(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(column_name) {
                Value::from(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<i32>, _>(column_name) {
                Value::from(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<i16>, _>(column_name) {
                Value::from(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(column_name) {
                serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
            } else if let Ok(Some(value)) = row.try_get::<Option<f32>, _>(column_name) {
                serde_json::Number::from_f64(value as f64).map(Value::Number).unwrap_or(Value::Null)
            } else if let Ok(Some(value)) = row.try_get::<Option<bool>, _>(column_name) {
                Value::Bool(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<NaiveDateTime>, _>(column_name) {
                Value::String(value.and_utc().to_rfc3339())
            } else if let Ok(Some(value)) = row.try_get::<Option<DateTime<Utc>>, _>(column_name) {
                Value::String(value.to_rfc3339())
            } else if let Ok(Some(value)) = row.try_get::<Option<Vec<u8>>, _>(column_name) {
                Value::String(encode_blob(&value))
            } else {
                Value::Null
            };
            record.insert(column_name.to_string(), value);
        }

        record
    }

    async fn catalog(&self, sql: &str) -> Result<Vec<Record>> {
        self.query(&Statement::raw(sql), None).await
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Param],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Param::Null => query.bind(None::<String>),
            Param::InvalidDate => query.bind(None::<NaiveDateTime>),
            Param::Bool(b) => query.bind(*b),
            Param::Int(i) => query.bind(*i),
            Param::Float(f) => query.bind(*f),
            Param::Text(s) => query.bind(s.clone()),
            Param::Date(d) => query.bind(d.naive_utc()),
            Param::Json(v) => query.bind(sqlx::types::Json(v.clone())),
            Param::Bytes(b) => query.bind(b.clone()),
        };
    }
    query
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn connect(config: &ConnectionConfig) -> Result<Self> {
        Self::new(config).await
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn execute(&self, statement: &Statement, connection: Option<ConnectionId>) -> Result<ExecResult> {
        debug!(sql = %statement.sql, params = statement.params.len(), "execute");
        let query = bind_params(sqlx::query(&statement.sql), &statement.params);
        let result = match connection {
            Some(id) => {
                let slot = self.pinned.get(id).await?;
                let mut conn = slot.lock().await;
                query.execute(&mut **conn).await?
            }
            None => query.execute(&self.pool).await?,
        };

        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    async fn query(&self, statement: &Statement, connection: Option<ConnectionId>) -> Result<Vec<Record>> {
        debug!(sql = %statement.sql, params = statement.params.len(), "query");
        let query = bind_params(sqlx::query(&statement.sql), &statement.params);
        let rows = match connection {
            Some(id) => {
                let slot = self.pinned.get(id).await?;
                let mut conn = slot.lock().await;
                query.fetch_all(&mut **conn).await?
            }
            None => query.fetch_all(&self.pool).await?,
        };

        Ok(rows.iter().map(Self::convert_row).collect())
    }

    async fn get_schemas(&self) -> Result<Schemas> {
        let tables = self.catalog(TABLES_SQL).await?;
        let columns = self.catalog(COLUMNS_SQL).await?;
        let indexes = self.catalog(INDEXES_SQL).await?;
        let foreign_keys = self.catalog(FOREIGN_KEYS_SQL).await?;
        Ok(schemas_from_catalog(&self.dialect, &tables, &columns, &indexes, &foreign_keys))
    }

    fn fetch(&self, statement: Statement) -> BoxStream<'static, Result<Record>> {
        let pool = self.pool.clone();
        Box::pin(try_stream! {
            let query = bind_params(sqlx::query(&statement.sql), &statement.params);
            let mut rows = query.fetch(&pool);
            while let Some(row) = rows.try_next().await.map_err(QueryError::from)? {
                yield Self::convert_row(&row);
            }
        })
    }

    async fn acquire(&self) -> Result<ConnectionId> {
        let connection = self.pool.acquire().await?;
        Ok(self.pinned.insert(connection).await)
    }

    async fn release(&self, connection: ConnectionId) -> Result<()> {
        self.pinned.remove(connection).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("postgresql://localhost/test")
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_connection() {
        let backend = PostgresBackend::connect(&config()).await;
        assert!(backend.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_query() {
        let backend = PostgresBackend::connect(&config()).await.unwrap();
        let connection = backend.acquire().await.unwrap();

        // temporary tables are per session
        backend
            .execute(
                &Statement::raw("CREATE TEMPORARY TABLE test_table (id BIGINT PRIMARY KEY, name TEXT)"),
                Some(connection),
            )
            .await
            .unwrap();
        backend
            .execute(
                &Statement::new(
                    "INSERT INTO test_table (id, name) VALUES ($1, $2)",
                    vec![Param::Int(1), Param::Text("Alice".into())],
                ),
                Some(connection),
            )
            .await
            .unwrap();

        let results = backend
            .query(
                &Statement::new("SELECT * FROM test_table WHERE id = $1", vec![Param::Int(1)]),
                Some(connection),
            )
            .await
            .unwrap();
        backend.release(connection).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get_i64("id"), Some(1));
        assert_eq!(results[0].get_string("name"), Some("Alice".to_string()));
    }
}
