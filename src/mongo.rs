//! MongoDB adapter.
//!
//! Collections are schemaless, so the live schema only reports collection
//! names and indexes. Filters and pipelines come from [`crate::document`];
//! transactions run on a client session pinned for their lifetime.

use crate::adapter::{pinned, upsert_record, Adapter, AdapterKind, Capabilities, RecordStream};
use crate::backend::{ConnectionId, PinnedConnections, Record};
use crate::condition::Condition;
use crate::connection::ConnectionConfig;
use crate::diff::SchemaOperation;
use crate::document::{
    build_count, build_find, compile_filter, decode_bson, decode_document, decode_group, encode_document,
    group_schema, update_document, DocumentPlan,
};
use crate::error::{QueryError, Result};
use crate::query::QueryOptions;
use crate::schema::{ColumnProperty, IndexDef, Integrity, ModelSchema, TypeClass};
use crate::snapshot::Schemas;
use crate::transaction::{IsolationLevel, Transaction};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::{StreamExt, TryStreamExt};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub struct MongoAdapter {
    client: Client,
    database: Database,
    sessions: PinnedConnections<ClientSession>,
}

impl MongoAdapter {
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.url).await?;
        options.max_pool_size = Some(config.max_connections);
        let name = config
            .database
            .clone()
            .or_else(|| options.default_database.clone())
            .ok_or_else(|| QueryError::Connection(format!("No database name in {}", config.url)))?;

        let client = Client::with_options(options)?;
        let database = client.database(&name);
        database.run_command(doc! { "ping": 1 }).await?;
        info!("Connected to MongoDB database {}", name);

        Ok(Self {
            client,
            database,
            sessions: PinnedConnections::new(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }

    async fn session(&self, transaction: Option<&Transaction>) -> Result<Option<Arc<tokio::sync::Mutex<ClientSession>>>> {
        match pinned(transaction)? {
            Some(id) => Ok(Some(self.sessions.get(id).await?)),
            None => Ok(None),
        }
    }

    async fn read(
        &self,
        collection: &str,
        plan: DocumentPlan,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Document>> {
        let collection = self.collection(collection);
        let session = self.session(transaction).await?;
        match plan {
            DocumentPlan::Find {
                filter,
                projection,
                sort,
                skip,
                limit,
            } => {
                let mut find = collection.find(filter);
                if let Some(projection) = projection {
                    find = find.projection(projection);
                }
                if let Some(sort) = sort {
                    find = find.sort(sort);
                }
                if let Some(skip) = skip {
                    find = find.skip(skip);
                }
                if let Some(limit) = limit {
                    find = find.limit(limit);
                }
                match session {
                    Some(session) => {
                        let mut session = session.lock().await;
                        let mut cursor = find.session(&mut *session).await?;
                        Ok(cursor.stream(&mut *session).try_collect().await?)
                    }
                    None => Ok(find.await?.try_collect().await?),
                }
            }
            DocumentPlan::Aggregate(pipeline) => {
                let aggregate = collection.aggregate(pipeline);
                match session {
                    Some(session) => {
                        let mut session = session.lock().await;
                        let mut cursor = aggregate.session(&mut *session).await?;
                        Ok(cursor.stream(&mut *session).try_collect().await?)
                    }
                    None => Ok(aggregate.await?.try_collect().await?),
                }
            }
        }
    }

    /// Filter for writes; windowed or geo-scoped conditions resolve to ids first
    async fn write_filter(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<Document> {
        if !options.restricts_rows() && options.near.is_none() {
            return compile_filter(model, condition);
        }
        let options = QueryOptions {
            select: Some(Vec::new()),
            ..options.clone()
        };
        let plan = build_find(model, condition, &options)?;
        let ids: Vec<Bson> = self
            .read(&model.table_name, plan, transaction)
            .await?
            .into_iter()
            .filter_map(|document| document.get("_id").cloned())
            .collect();
        Ok(doc! { "_id": { "$in": ids } })
    }
}

#[async_trait]
impl Adapter for MongoAdapter {
    async fn connect(config: &ConnectionConfig) -> Result<Self> {
        Self::new(config).await
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::DocumentStore
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            geo: true,
            regex: true,
            group_by: true,
            ..Capabilities::default()
        }
    }

    fn type_string(&self, column: &ColumnProperty) -> Result<String> {
        Ok(column.type_class.to_string().to_uppercase())
    }

    fn render_change_query(&self, _operation: &SchemaOperation) -> Option<String> {
        None
    }

    async fn get_schemas(&self) -> Result<Schemas> {
        let mut schemas = Schemas::new();
        for name in self.database.list_collection_names().await? {
            if name.starts_with("system.") {
                continue;
            }
            let indexes: Vec<IndexModel> = self.collection(&name).list_indexes().await?.try_collect().await?;
            for index in indexes {
                let options = index.options.unwrap_or_default();
                let Some(index_name) = options.name.filter(|n| n != "_id_") else {
                    continue;
                };
                let columns: Vec<String> = index.keys.keys().map(|k| k.replace('.', "_")).collect();
                schemas = schemas.with_index(name.clone(), index_name, columns, options.unique.unwrap_or(false));
            }
            schemas = schemas.with_schemaless_table(name);
        }
        Ok(schemas)
    }

    async fn create_table(&self, model: &ModelSchema) -> Result<()> {
        self.database.create_collection(&model.table_name).await?;
        Ok(())
    }

    async fn add_column(&self, _model: &ModelSchema, _column: &ColumnProperty) -> Result<()> {
        Ok(())
    }

    async fn create_index(&self, model: &ModelSchema, index: &IndexDef) -> Result<()> {
        let mut keys = Document::new();
        for path in &index.columns {
            let column = model
                .get(path)
                .ok_or_else(|| QueryError::UnknownColumn(format!("{}.{}", model.name, path)))?;
            match column.type_class {
                TypeClass::GeoPoint => keys.insert(column.dbname_dot.clone(), "2dsphere"),
                _ => keys.insert(column.dbname_dot.clone(), 1),
            };
        }
        let options = IndexOptions::builder()
            .name(index.name.clone())
            .unique(index.unique)
            .build();
        let index = IndexModel::builder().keys(keys).options(options).build();
        self.collection(&model.table_name).create_index(index).await?;
        Ok(())
    }

    async fn create_foreign_key(
        &self,
        model: &ModelSchema,
        column: &str,
        _target: &ModelSchema,
        _integrity: Integrity,
    ) -> Result<()> {
        debug!("Foreign key {}.{} is enforced by the connection", model.name, column);
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.collection(table).drop().await?;
        Ok(())
    }

    async fn drop_index(&self, table: &str, index: &str) -> Result<()> {
        self.collection(table).drop_index(index).await?;
        Ok(())
    }

    async fn run_schema_statement(&self, statement: &str) -> Result<()> {
        Err(QueryError::UnsupportedFeature(format!(
            "schema statement on a document store: {}",
            statement
        )))
    }

    async fn create(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<Value> {
        let document = encode_document(model, data)?;
        let collection = self.collection(&model.table_name);
        let inserted = match self.session(transaction).await? {
            Some(session) => {
                let mut session = session.lock().await;
                collection.insert_one(document).session(&mut *session).await?
            }
            None => collection.insert_one(document).await?,
        };
        Ok(decode_bson(&inserted.inserted_id))
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
        let documents = data
            .iter()
            .map(|record| encode_document(model, record))
            .collect::<Result<Vec<_>>>()?;
        let count = documents.len();
        let collection = self.collection(&model.table_name);
        let inserted = match self.session(transaction).await? {
            Some(session) => {
                let mut session = session.lock().await;
                collection.insert_many(documents).session(&mut *session).await?
            }
            None => collection.insert_many(documents).await?,
        };
        (0..count)
            .map(|i| {
                inserted
                    .inserted_ids
                    .get(&i)
                    .map(decode_bson)
                    .ok_or_else(|| QueryError::Database(format!("{} insert returned no id", model.name)))
            })
            .collect()
    }

    async fn update(&self, model: &ModelSchema, data: &Record, transaction: Option<&Transaction>) -> Result<()> {
        let id = data
            .id()
            .filter(|id| !id.is_null())
            .cloned()
            .ok_or_else(|| QueryError::Query(format!("Updating {} requires an id", model.name)))?;
        let filter = compile_filter(model, &Condition::eq("id", id))?;
        let mut replacement = encode_document(model, data)?;
        replacement.remove("_id");

        let collection = self.collection(&model.table_name);
        match self.session(transaction).await? {
            Some(session) => {
                let mut session = session.lock().await;
                collection.replace_one(filter, replacement).session(&mut *session).await?;
            }
            None => {
                collection.replace_one(filter, replacement).await?;
            }
        }
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
        let update = update_document(model, data)?;
        let filter = self.write_filter(model, condition, options, transaction).await?;
        let collection = self.collection(&model.table_name);
        let result = match self.session(transaction).await? {
            Some(session) => {
                let mut session = session.lock().await;
                collection.update_many(filter, update).session(&mut *session).await?
            }
            None => collection.update_many(filter, update).await?,
        };
        Ok(result.matched_count)
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
        let plan = build_find(model, condition, options)?;
        let documents = self.read(&model.table_name, plan, transaction).await?;
        match group_schema(model, options)? {
            Some(schema) => Ok(documents.iter().map(|d| decode_group(&schema, d)).collect()),
            None => Ok(documents.iter().map(|d| decode_document(model, d)).collect()),
        }
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
        let collection = self.collection(&model.table_name);
        match build_count(model, condition, options)? {
            DocumentPlan::Find {
                filter, skip, limit, ..
            } => {
                let mut count = collection.count_documents(filter);
                if let Some(skip) = skip {
                    count = count.skip(skip);
                }
                if let Some(limit) = limit {
                    count = count.limit(limit.unsigned_abs());
                }
                match self.session(transaction).await? {
                    Some(session) => {
                        let mut session = session.lock().await;
                        Ok(count.session(&mut *session).await?)
                    }
                    None => Ok(count.await?),
                }
            }
            plan @ DocumentPlan::Aggregate(_) => {
                let documents = self.read(&model.table_name, plan, transaction).await?;
                let count = documents
                    .first()
                    .and_then(|d| d.get("count"))
                    .and_then(|c| match c {
                        Bson::Int32(n) => Some(i64::from(*n)),
                        Bson::Int64(n) => Some(*n),
                        _ => None,
                    })
                    .unwrap_or(0);
                Ok(u64::try_from(count).unwrap_or(0))
            }
        }
    }

    async fn delete(
        &self,
        model: &ModelSchema,
        condition: &Condition,
        options: &QueryOptions,
        transaction: Option<&Transaction>,
    ) -> Result<u64> {
        let filter = self.write_filter(model, condition, options, transaction).await?;
        let collection = self.collection(&model.table_name);
        let result = match self.session(transaction).await? {
            Some(session) => {
                let mut session = session.lock().await;
                collection.delete_many(filter).session(&mut *session).await?
            }
            None => collection.delete_many(filter).await?,
        };
        Ok(result.deleted_count)
    }

    async fn stream(
        &self,
        model: Arc<ModelSchema>,
        condition: Condition,
        options: QueryOptions,
    ) -> Result<RecordStream> {
        let collection = self.collection(&model.table_name);
        match build_find(&model, &condition, &options)? {
            DocumentPlan::Find {
                filter,
                projection,
                sort,
                skip,
                limit,
            } => {
                let mut find = collection.find(filter);
                if let Some(projection) = projection {
                    find = find.projection(projection);
                }
                if let Some(sort) = sort {
                    find = find.sort(sort);
                }
                if let Some(skip) = skip {
                    find = find.skip(skip);
                }
                if let Some(limit) = limit {
                    find = find.limit(limit);
                }
                let cursor = find.await?;
                Ok(cursor
                    .map(move |document| {
                        document
                            .map(|d| decode_document(&model, &d))
                            .map_err(QueryError::from)
                    })
                    .boxed())
            }
            DocumentPlan::Aggregate(pipeline) => {
                let schema = group_schema(&model, &options)?.unwrap_or_default();
                let cursor = collection.aggregate(pipeline).await?;
                Ok(cursor
                    .map(move |document| {
                        document
                            .map(|d| decode_group(&schema, &d))
                            .map_err(QueryError::from)
                    })
                    .boxed())
            }
        }
    }

    async fn get_connection(&self) -> Result<ConnectionId> {
        let session = self.client.start_session().await?;
        Ok(self.sessions.insert(session).await)
    }

    async fn release_connection(&self, connection: ConnectionId) -> Result<()> {
        self.sessions.remove(connection).await?;
        Ok(())
    }

    async fn start_transaction(&self, connection: ConnectionId, isolation_level: Option<IsolationLevel>) -> Result<()> {
        if let Some(level) = isolation_level {
            debug!("MongoDB transactions use snapshot isolation, ignoring {}", level);
        }
        let session = self.sessions.get(connection).await?;
        let mut session = session.lock().await;
        session.start_transaction().await?;
        Ok(())
    }

    async fn commit_transaction(&self, connection: ConnectionId) -> Result<()> {
        let session = self.sessions.get(connection).await?;
        let mut session = session.lock().await;
        session.commit_transaction().await?;
        Ok(())
    }

    async fn rollback_transaction(&self, connection: ConnectionId) -> Result<()> {
        let session = self.sessions.get(connection).await?;
        let mut session = session.lock().await;
        session.abort_transaction().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use serde_json::json;

    async fn connection() -> Connection<MongoAdapter> {
        let url = std::env::var("MONGODB_URL").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let config = ConnectionConfig::new(url).with_database("polyquery_test");
        let connection = Connection::<MongoAdapter>::connect(config).await.unwrap();
        connection
            .register(
                ModelSchema::new("Product")
                    .column(ColumnProperty::new("name", TypeClass::String))
                    .column(ColumnProperty::new("price", TypeClass::Number))
                    .column(ColumnProperty::new("stock.count", TypeClass::Integer)),
            )
            .unwrap();
        connection.adapter().drop_table("products").await.ok();
        connection.apply_schemas().await.unwrap();
        connection
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_crud_round_trip() {
        let connection = connection().await;
        let id = connection
            .create(
                "Product",
                Record::from_value(json!({ "name": "lamp", "price": 12.5, "stock": { "count": 3 } })).unwrap(),
                None,
            )
            .await
            .unwrap();

        let found = connection.find("Product", id.clone()).await.unwrap();
        assert_eq!(found.get_path("stock.count"), Some(&json!(3)));

        let updated = connection
            .query("Product")
            .unwrap()
            .where_json(json!({ "name": { "$contains": "LAM" } }))
            .unwrap()
            .update(Record::from_value(json!({ "stock": { "count": { "$inc": 2 } } })).unwrap())
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(connection.query("Product").unwrap().find(id).count().await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_group_by_name() {
        let connection = connection().await;
        for (name, price) in [("a", 1.0), ("a", 2.0), ("b", 5.0)] {
            connection
                .create("Product", Record::from_value(json!({ "name": name, "price": price })).unwrap(), None)
                .await
                .unwrap();
        }
        let rows = connection
            .query("Product")
            .unwrap()
            .group_json("name", &json!({ "total": { "$sum": "$price" } }))
            .unwrap()
            .order("name")
            .exec()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_f64("total"), Some(3.0));
    }
}
