//! polyquery - one query layer over SQL, document and key-value stores
//!
//! polyquery compiles backend-neutral conditions, aggregations and schema
//! declarations into whatever the connected store understands: SQL for
//! SQLite, PostgreSQL and MySQL, BSON filters and pipelines for MongoDB,
//! and key lookups for Redis.
//!
//! # Architecture
//!
//! - **Models → Schema**: Declared models are normalized into column paths,
//!   storage names, indexes and associations
//! - **Conditions → Native queries**: A JSON-shaped condition language is
//!   parsed once and compiled per backend
//! - **Schema diff**: The live schema is introspected and compared with the
//!   registered models; required changes are applied in a safe order
//! - **Adapters**: Every store implements one [`Adapter`] contract
//!
//! # Features
//!
//! - **Condition compiler**: `$and`/`$or`, comparisons, membership, pattern
//!   matching, column-to-column comparisons and regular expressions
//! - **Aggregation**: Group keys, `$sum`/`$min`/`$max`/`$avg`/`$any`
//!   reducers and filters over aggregated output
//! - **Integrity**: Restrict, cascade and nullify rules, emulated where the
//!   store cannot enforce them
//! - **Transactions**: Pinned connections with optional isolation levels
//! - **Streaming**: Lazily fetched result sets
//!
//! # Example
//!
//! ```rust,no_run
//! use polyquery::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     #[cfg(feature = "sqlite")]
//!     {
//!         let connection = Connection::<SqliteAdapter>::connect(ConnectionConfig::default()).await?;
//!         connection.register(
//!             ModelSchema::new("Product")
//!                 .column(ColumnProperty::new("name", TypeClass::String).required())
//!                 .column(ColumnProperty::new("price", TypeClass::Number)),
//!         )?;
//!         connection.apply_schemas().await?;
//!
//!         connection
//!             .create("Product", Record::from_value(json!({ "name": "lamp", "price": 12.5 }))?, None)
//!             .await?;
//!
//!         let cheap = connection
//!             .query("Product")?
//!             .where_json(json!({ "price": { "$lt": 20 } }))?
//!             .order("-price")
//!             .exec()
//!             .await?;
//!         println!("Cheap products: {:?}", cheap);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Enable backends via Cargo features:
//!
//! ```toml
//! [dependencies]
//! polyquery = { version = "0.1", features = ["postgres", "mysql", "mongodb", "redis"] }
//! ```

pub mod adapter;
pub mod backend;
pub mod builder;
pub mod compiler;
pub mod condition;
pub mod connection;
pub mod dialect;
pub mod diff;
pub mod document;
pub mod error;
pub mod group;
pub mod keyvalue;
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod sql_adapter;
pub mod transaction;
pub mod value;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "mongodb")]
pub mod mongo;

#[cfg(feature = "redis")]
pub mod redis_store;

#[cfg(test)]
mod mock;

pub use adapter::{Adapter, AdapterKind, Capabilities, RecordStream};
pub use backend::{ConnectionId, DatabaseBackend, ExecResult, Record};
pub use condition::{ColumnTest, CompareOp, Condition};
pub use connection::{Connection, ConnectionConfig};
pub use diff::{ApplyOptions, ApplyReport, SchemaChange, SchemaOperation, SchemaPlan};
pub use error::{QueryError, Result};
pub use group::{GroupBy, GroupExpr, GroupOp};
pub use query::{JoinKind, OrderSpec, Query, QueryOptions, VectorOp};
pub use schema::{ColumnProperty, IndexDef, Integrity, ModelRegistry, ModelSchema, TypeClass};
pub use snapshot::Schemas;
pub use sql_adapter::SqlAdapter;
pub use transaction::{IsolationLevel, Transaction, TransactionState};

#[cfg(feature = "sqlite")]
pub use sql_adapter::SqliteAdapter;

#[cfg(feature = "postgres")]
pub use sql_adapter::PostgresAdapter;

#[cfg(feature = "mysql")]
pub use sql_adapter::MySqlAdapter;

#[cfg(feature = "mongodb")]
pub use mongo::MongoAdapter;

#[cfg(feature = "redis")]
pub use redis_store::RedisAdapter;

/// Prelude for common imports
pub mod prelude {
    pub use crate::adapter::Adapter;
    pub use crate::backend::Record;
    pub use crate::condition::{ColumnTest, Condition};
    pub use crate::connection::{Connection, ConnectionConfig};
    pub use crate::error::{QueryError, Result};
    pub use crate::group::{GroupExpr, GroupOp};
    pub use crate::schema::{ColumnProperty, IndexDef, Integrity, ModelSchema, TypeClass};
    pub use crate::transaction::IsolationLevel;

    #[cfg(feature = "sqlite")]
    pub use crate::sql_adapter::SqliteAdapter;

    #[cfg(feature = "postgres")]
    pub use crate::sql_adapter::PostgresAdapter;

    #[cfg(feature = "mysql")]
    pub use crate::sql_adapter::MySqlAdapter;

    #[cfg(feature = "mongodb")]
    pub use crate::mongo::MongoAdapter;

    #[cfg(feature = "redis")]
    pub use crate::redis_store::RedisAdapter;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _config = ConnectionConfig::default();
        let _condition = Condition::empty();
        let _op = CompareOp::Gte;
        let _registry = ModelRegistry::new();
        assert!(AdapterKind::Sqlite.is_sql());
    }
}
