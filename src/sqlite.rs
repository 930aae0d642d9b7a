use crate::backend::{ConnectionId, DatabaseBackend, ExecResult, PinnedConnections, Record};
use crate::builder::Statement;
use crate::connection::ConnectionConfig;
use crate::dialect::{Dialect, SqliteDialect};
use crate::error::{QueryError, Result};
use crate::snapshot::{ColumnSnapshot, Schemas, SchemasTable};
use crate::value::{encode_blob, Param};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row};
use std::str::FromStr;
use tracing::debug;

pub struct SqliteBackend {
    pool: SqlitePool,
    pinned: PinnedConnections<PoolConnection<Sqlite>>,
    dialect: SqliteDialect,
}

impl SqliteBackend {
    /// Create a new SQLite backend with connection pool
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool = SqlitePoolOptions::new().max_connections(config.max_connections);
        if in_memory {
            // the database is dropped with its last connection
            pool = pool.min_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = pool.connect_with(options).await?;

        debug!("Connected to SQLite at {}", config.url);
        Ok(Self {
            pool,
            pinned: PinnedConnections::new(),
            dialect: SqliteDialect,
        })
    }

    /// Create an in-memory SQLite database
    pub async fn memory() -> Result<Self> {
        Self::new(&ConnectionConfig::new("sqlite::memory:")).await
    }

    /// Convert SQLite row to Record
    fn convert_row(row: &SqliteRow) -> Record {
        let mut record = Record::new();

        for column in row.columns() {
            let column_name = column.name();

            if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column_name) {
                record.insert(column_name.to_string(), Value::String(value));
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(column_name) {
                record.insert(column_name.to_string(), Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(column_name) {
                let number = serde_json::Number::from_f64(value).map(Value::Number);
                record.insert(column_name.to_string(), number.unwrap_or(Value::Null));
            } else if let Ok(Some(value)) = row.try_get::<Option<Vec<u8>>, _>(column_name) {
                record.insert(column_name.to_string(), Value::String(encode_blob(&value)));
            } else if let Ok(Some(value)) = row.try_get::<Option<bool>, _>(column_name) {
                record.insert(column_name.to_string(), Value::Bool(value));
            } else {
                record.insert(column_name.to_string(), Value::Null);
            }
        }

        record
    }

    /// Get list of all tables
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(QueryError::from))
            .collect()
    }

    /// Get table info
    pub async fn table_info(&self, table_name: &str) -> Result<Vec<ColumnInfo>> {
        let query = format!("PRAGMA table_info({})", table_name);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                cid: row.try_get::<i64, _>("cid")?,
                name: row.try_get::<String, _>("name")?,
                type_name: row.try_get::<String, _>("type")?,
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                default_value: row.try_get::<Option<String>, _>("dflt_value").ok().flatten(),
                primary_key: row.try_get::<i64, _>("pk")? != 0,
            });
        }

        Ok(columns)
    }

    /// Explicitly created indexes of a table, with their columns in order
    pub async fn index_list(&self, table_name: &str) -> Result<Vec<(String, Vec<String>, bool)>> {
        let rows = sqlx::query(&format!("PRAGMA index_list({})", table_name))
            .fetch_all(&self.pool)
            .await?;

        let mut indexes = Vec::new();
        for row in rows {
            // 'u' and 'pk' indexes belong to constraints, not to CREATE INDEX
            if row.try_get::<String, _>("origin")? != "c" {
                continue;
            }
            let name = row.try_get::<String, _>("name")?;
            let unique = row.try_get::<i64, _>("unique")? != 0;

            let info = sqlx::query(&format!("PRAGMA index_info({})", name))
                .fetch_all(&self.pool)
                .await?;
            let mut columns: Vec<(i64, String)> = info
                .iter()
                .map(|r| -> Result<(i64, String)> { Ok((r.try_get("seqno")?, r.try_get("name")?)) })
                .collect::<Result<_>>()?;
            columns.sort();

            indexes.push((name, columns.into_iter().map(|(_, c)| c).collect(), unique));
        }
        Ok(indexes)
    }

    /// `(column, referenced table)` pairs of a table's foreign keys
    pub async fn foreign_key_list(&self, table_name: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(&format!("PRAGMA foreign_key_list({})", table_name))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, String)> { Ok((row.try_get("from")?, row.try_get("table")?)) })
            .collect()
    }
}

/// Column information from PRAGMA table_info
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Dates are stored as epoch milliseconds and JSON as text
fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[Param],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Param::Null | Param::InvalidDate => query.bind(None::<String>),
            Param::Bool(b) => query.bind(*b),
            Param::Int(i) => query.bind(*i),
            Param::Float(f) => query.bind(*f),
            Param::Text(s) => query.bind(s.clone()),
            Param::Date(d) => query.bind(d.timestamp_millis() as f64),
            Param::Json(v) => query.bind(v.to_string()),
            Param::Bytes(b) => query.bind(b.clone()),
        };
    }
    query
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
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
            last_insert_id: Some(result.last_insert_rowid()),
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
        let mut schemas = Schemas::new();

        for table in self.list_tables().await? {
            let mut snapshot = SchemasTable::new();
            for column in self.table_info(&table).await? {
                let type_string = self.dialect.normalize_type_string(&column.type_name);
                snapshot = snapshot.column(column.name, ColumnSnapshot::new(type_string, column.not_null));
            }
            schemas = schemas.with_table(table.clone(), snapshot);

            for (name, columns, unique) in self.index_list(&table).await? {
                schemas = schemas.with_index(table.clone(), name, columns, unique);
            }
            for (column, referenced) in self.foreign_key_list(&table).await? {
                schemas = schemas.with_foreign_key(table.clone(), column, referenced);
            }
        }

        Ok(schemas)
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
        // dropping returns the connection to the pool
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
