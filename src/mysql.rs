use crate::backend::{schemas_from_catalog, ConnectionId, DatabaseBackend, ExecResult, PinnedConnections, Record};
use crate::builder::Statement;
use crate::connection::ConnectionConfig;
use crate::dialect::{Dialect, MySqlDialect};
use crate::error::{QueryError, Result};
use crate::snapshot::Schemas;
use crate::value::{encode_blob, Param};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, Row};
use tracing::debug;

const TABLES_SQL: &str = "SELECT TABLE_NAME AS table_name, TABLE_COMMENT AS description \
     FROM information_schema.TABLES WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'";

const COLUMNS_SQL: &str = "SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name, COLUMN_TYPE AS data_type, \
     IS_NULLABLE AS is_nullable, COLUMN_COMMENT AS description \
     FROM information_schema.COLUMNS WHERE TABLE_SCHEMA = DATABASE() ORDER BY TABLE_NAME, ORDINAL_POSITION";

const INDEXES_SQL: &str = "SELECT TABLE_NAME AS table_name, INDEX_NAME AS index_name, COLUMN_NAME AS column_name, \
     NON_UNIQUE AS non_unique FROM information_schema.STATISTICS \
     WHERE TABLE_SCHEMA = DATABASE() AND INDEX_NAME <> 'PRIMARY' ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX";

const FOREIGN_KEYS_SQL: &str = "SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name, \
     REFERENCED_TABLE_NAME AS referenced_table FROM information_schema.KEY_COLUMN_USAGE \
     WHERE TABLE_SCHEMA = DATABASE() AND REFERENCED_TABLE_NAME IS NOT NULL";

pub struct MySqlBackend {
    pool: MySqlPool,
    pinned: PinnedConnections<PoolConnection<MySql>>,
    dialect: MySqlDialect,
}

impl MySqlBackend {
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        debug!("Connected to MySQL");
        Ok(Self {
            pool,
            pinned: PinnedConnections::new(),
            dialect: MySqlDialect,
        })
    }

    fn convert_row(row: &MySqlRow) -> Record {
        let mut record = Record::new();

        for column in row.columns() {
            let column_name = column.name();

            let value = if let Ok(Some(value)) = row.try_get::<Option<Value>, _>(column_name) {
                value
            } else if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column_name) {
                Value::String(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(column_name) {
                Value::from(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<u64>, _>(column_name) {
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

fn bind_params<'q>(mut query: Query<'q, MySql, MySqlArguments>, params: &[Param]) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            Param::Null | Param::InvalidDate => query.bind(None::<String>),
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
impl DatabaseBackend for MySqlBackend {
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
            last_insert_id: i64::try_from(result.last_insert_id()).ok(),
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

    #[tokio::test]
    #[ignore] // Requires MySQL running
    async fn test_mysql_insert_id() {
        let backend = MySqlBackend::connect(&ConnectionConfig::new("mysql://root@localhost/test"))
            .await
            .unwrap();
        let connection = backend.acquire().await.unwrap();
        backend
            .execute(
                &Statement::raw("CREATE TEMPORARY TABLE t (id INT NOT NULL AUTO_INCREMENT PRIMARY KEY, n INT)"),
                Some(connection),
            )
            .await
            .unwrap();

        let result = backend
            .execute(
                &Statement::new("INSERT INTO t (n) VALUES (?), (?)", vec![Param::Int(1), Param::Int(2)]),
                Some(connection),
            )
            .await
            .unwrap();
        backend.release(connection).await.unwrap();

        // MySQL reports the first id of a multi-row insert
        assert_eq!(result.rows_affected, 2);
        assert_eq!(result.last_insert_id, Some(1));
    }
}
