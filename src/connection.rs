//! Connections: one adapter plus the models registered against it.
//!
//! A [`Connection`] is the explicit context every query is built from. It
//! owns the adapter, the model registry and the schema-application state,
//! and emulates referential integrity on adapters that cannot enforce it.

use crate::adapter::Adapter;
use crate::backend::Record;
use crate::condition::{ColumnTest, Condition};
use crate::diff::{plan, ApplyOptions, ApplyReport, SchemaPlan};
use crate::error::{QueryError, Result};
use crate::query::{Query, QueryOptions};
use crate::schema::{Integrity, ModelRegistry, ModelSchema};
use crate::transaction::{IsolationLevel, Transaction};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Backend URL, e.g. `sqlite::memory:` or `mongodb://localhost`
    pub url: String,
    /// Connect attempts after the first failure
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub max_connections: u32,
    /// Default for [`Connection::apply_schemas`]
    pub apply_ignorable_changes: bool,
    /// Database name, for stores that select one per connection
    pub database: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_retries: 3,
            retry_base_delay_ms: 100,
            max_connections: 5,
            apply_ignorable_changes: false,
            database: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay_ms(mut self, delay: u64) -> Self {
        self.retry_base_delay_ms = delay;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_ignorable_changes(mut self, apply: bool) -> Self {
        self.apply_ignorable_changes = apply;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32) as u32);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }
}

#[derive(Default)]
struct ApplyState {
    /// Highest ticket whose caller is answered by `last`
    served_through: u64,
    last: Option<std::result::Result<ApplyReport, String>>,
}

pub struct Connection<A: Adapter> {
    adapter: A,
    config: ConnectionConfig,
    models: RwLock<ModelRegistry>,
    apply_tickets: AtomicU64,
    apply_state: Mutex<ApplyState>,
}

impl<A: Adapter> Connection<A> {
    /// Connect, retrying transport failures with exponential backoff
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match A::connect(&config).await {
                Ok(adapter) => {
                    info!("Connected to {:?} backend", adapter.kind());
                    return Ok(Self::with_adapter(adapter, config));
                }
                Err(e) if e.is_retryable() && attempt < config.max_retries => {
                    let delay = config.retry_delay(attempt);
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Connection failed: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Connection failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    pub fn with_adapter(adapter: A, config: ConnectionConfig) -> Self {
        Self {
            adapter,
            config,
            models: RwLock::new(ModelRegistry::new()),
            apply_tickets: AtomicU64::new(0),
            apply_state: Mutex::new(ApplyState::default()),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn registry(&self) -> RwLockReadGuard<'_, ModelRegistry> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a model; its `id` primary key is added here
    pub fn register(&self, model: ModelSchema) -> Result<Arc<ModelSchema>> {
        let mut registry = self.models.write().unwrap_or_else(PoisonError::into_inner);
        let model = registry.register(model)?;
        debug!("Registered model {} as {}", model.name, model.table_name);
        Ok(model)
    }

    pub fn model(&self, name: &str) -> Result<Arc<ModelSchema>> {
        self.registry().get(name)
    }

    pub fn models(&self) -> Vec<Arc<ModelSchema>> {
        self.registry().iter().cloned().collect()
    }

    pub fn query(&self, model: &str) -> Result<Query<'_, A>> {
        Ok(Query::new(self, self.model(model)?))
    }

    pub async fn create(&self, model: &str, data: Record, transaction: Option<&Transaction>) -> Result<Value> {
        let model = self.model(model)?;
        self.adapter.create(&model, &data, transaction).await
    }

    pub async fn create_bulk(
        &self,
        model: &str,
        data: Vec<Record>,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Value>> {
        let model = self.model(model)?;
        self.adapter.create_bulk(&model, &data, transaction).await
    }

    /// Overwrite a whole record; columns absent from `data` are cleared
    pub async fn update(&self, model: &str, data: Record, transaction: Option<&Transaction>) -> Result<()> {
        let model = self.model(model)?;
        self.adapter.update(&model, &data, transaction).await
    }

    pub async fn find(&self, model: &str, id: impl Into<Value>) -> Result<Record> {
        let records = self.query(model)?.find(id).exec().await?;
        records
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::NotFound(model.to_string()))
    }

    /// Diff registered models against the live schema without changing anything
    pub async fn get_schema_changes(&self) -> Result<SchemaPlan> {
        let live = self.adapter.get_schemas().await?;
        let registry = self.registry().clone();
        let plan = plan(&registry, &live, &self.adapter)?;
        info!(
            changes = plan.len(),
            required = plan.required().count(),
            "Planned schema changes"
        );
        Ok(plan)
    }

    /// Apply schema changes, honoring `apply_ignorable_changes` from the config
    pub async fn apply_schemas(&self) -> Result<ApplyReport> {
        self.apply_schemas_with(ApplyOptions {
            include_ignorable: self.config.apply_ignorable_changes,
        })
        .await
    }

    /// Apply schema changes; callers arriving while an application is in
    /// flight receive that application's outcome instead of starting another
    pub async fn apply_schemas_with(&self, options: ApplyOptions) -> Result<ApplyReport> {
        let ticket = self.apply_tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.apply_state.lock().await;

        if ticket <= state.served_through {
            debug!("Reusing schema application result for ticket {}", ticket);
            return match &state.last {
                Some(Ok(report)) => Ok(report.clone()),
                Some(Err(message)) => Err(QueryError::Schema(message.clone())),
                None => Err(QueryError::Schema("schema application produced no result".to_string())),
            };
        }

        let result = match self.get_schema_changes().await {
            Ok(plan) => plan.apply(&self.adapter, options).await,
            Err(e) => Err(e),
        };
        state.served_through = self.apply_tickets.load(Ordering::SeqCst);
        state.last = Some(match &result {
            Ok(report) => Ok(report.clone()),
            Err(e) => Err(e.to_string()),
        });

        match &result {
            Ok(report) => info!(
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                "Schema application finished"
            ),
            Err(e) => error!("Schema application failed: {}", e),
        }
        result
    }

    /// Start a transaction pinned to a dedicated connection
    pub async fn transaction(&self, isolation_level: Option<IsolationLevel>) -> Result<Transaction> {
        let mut transaction = Transaction::new();
        transaction.setup(&self.adapter, isolation_level).await?;
        Ok(transaction)
    }

    pub async fn commit(&self, transaction: &mut Transaction) -> Result<()> {
        transaction.commit(&self.adapter).await
    }

    pub async fn rollback(&self, transaction: &mut Transaction) -> Result<()> {
        transaction.rollback(&self.adapter).await
    }

    pub async fn close(&self) -> Result<()> {
        info!("Closing {:?} connection", self.adapter.kind());
        self.adapter.close().await
    }

    fn children_of(&self, model: &str) -> Vec<(Arc<ModelSchema>, String, Integrity)> {
        self.registry()
            .children_of(model)
            .into_iter()
            .filter(|(_, _, integrity)| *integrity != Integrity::Ignore)
            .collect()
    }

    /// Delete matching records; without native integrity, child rules are
    /// enforced here: restrict fails, cascade deletes, nullify clears the key
    pub(crate) fn delete_with_integrity<'a>(
        &'a self,
        model: Arc<ModelSchema>,
        condition: Condition,
        options: QueryOptions,
        transaction: Option<&'a Transaction>,
    ) -> BoxFuture<'a, Result<u64>> {
        async move {
            let children = self.children_of(&model.name);
            if children.is_empty() || self.adapter.capabilities().native_integrity {
                return self.adapter.delete(&model, &condition, &options, transaction).await;
            }

            let id_options = QueryOptions {
                select: Some(Vec::new()),
                ..options
            };
            let ids: Vec<Value> = self
                .adapter
                .find(&model, &condition, &id_options, transaction)
                .await?
                .iter()
                .filter_map(|record| record.id().cloned())
                .collect();
            if ids.is_empty() {
                return Ok(0);
            }
            let referencing = |column: &str| Condition::test(column, ColumnTest::In(ids.clone()));

            for (child, foreign_key, _) in children.iter().filter(|(_, _, i)| *i == Integrity::Restrict) {
                let count = self
                    .adapter
                    .count(child, &referencing(foreign_key), &QueryOptions::default(), transaction)
                    .await?;
                if count > 0 {
                    return Err(QueryError::IntegrityViolation(format!(
                        "{} {} record(s) still reference {}",
                        count, child.name, model.name
                    )));
                }
            }

            for (child, foreign_key, integrity) in &children {
                match integrity {
                    Integrity::Cascade => {
                        let deleted = self
                            .delete_with_integrity(
                                child.clone(),
                                referencing(foreign_key),
                                QueryOptions::default(),
                                transaction,
                            )
                            .await?;
                        debug!("Cascaded delete to {} {} record(s)", deleted, child.name);
                    }
                    Integrity::Nullify => {
                        let mut data = Record::new();
                        data.insert(foreign_key.clone(), Value::Null);
                        self.adapter
                            .update_partial(
                                child,
                                &data,
                                &referencing(foreign_key),
                                &QueryOptions::default(),
                                transaction,
                            )
                            .await?;
                    }
                    Integrity::Restrict | Integrity::Ignore => {}
                }
            }

            self.adapter
                .delete(&model, &referencing("id"), &QueryOptions::default(), transaction)
                .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::schema::{ColumnProperty, TypeClass};
    use crate::sql_adapter::SqlAdapter;
    use serde_json::json;

    fn connection(backend: &MockBackend) -> Connection<SqlAdapter<MockBackend>> {
        Connection::with_adapter(SqlAdapter::new(backend.clone()), ConnectionConfig::default())
    }

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_config_defaults_and_backoff() {
        let config: ConnectionConfig = serde_json::from_value(json!({ "url": "postgres://db/app" })).unwrap();
        assert_eq!(config.url, "postgres://db/app");
        assert_eq!(config.max_retries, 3);
        assert!(!config.apply_ignorable_changes);

        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(400));
        assert_eq!(config.retry_delay(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_register_and_lookup() {
        let backend = MockBackend::sqlite();
        let connection = connection(&backend);
        connection
            .register(ModelSchema::new("User").column(ColumnProperty::new("name", TypeClass::String)))
            .unwrap();

        assert!(connection.model("User").unwrap().primary_key().is_some());
        assert!(matches!(connection.model("Post"), Err(QueryError::ModelNotRegistered(_))));
        assert!(connection.register(ModelSchema::new("User")).is_err());
        assert_eq!(connection.models().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_apply_shares_result() {
        let backend = MockBackend::sqlite();
        let connection = connection(&backend);
        connection
            .register(ModelSchema::new("User").column(ColumnProperty::new("name", TypeClass::String)))
            .unwrap();

        let held = connection.apply_state.lock().await;
        let release = async move {
            tokio::task::yield_now().await;
            drop(held);
        };
        let (first, second, ()) = tokio::join!(connection.apply_schemas(), connection.apply_schemas(), release);

        assert_eq!(first.unwrap().applied.len(), second.unwrap().applied.len());
        let creates = backend
            .statements()
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count();
        assert_eq!(creates, 1);

        // a later call runs a fresh application
        connection.apply_schemas().await.unwrap();
        let creates = backend
            .statements()
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count();
        assert_eq!(creates, 2);
    }

    fn family(backend: &MockBackend, posts: Integrity, likes: Integrity) -> Connection<SqlAdapter<MockBackend>> {
        let connection = connection(backend);
        connection
            .register(ModelSchema::new("User").column(ColumnProperty::new("name", TypeClass::String)))
            .unwrap();
        connection.register(ModelSchema::new("Post").belongs_to("User", posts)).unwrap();
        connection.register(ModelSchema::new("Like").belongs_to("User", likes)).unwrap();
        connection
    }

    #[tokio::test]
    async fn test_restrict_blocks_delete() {
        let backend = MockBackend::sqlite();
        let connection = family(&backend, Integrity::Restrict, Integrity::Ignore);
        backend.push_rows(vec![record(json!({ "id": 1 }))]);
        backend.push_rows(vec![record(json!({ "count": 2 }))]);

        let result = connection.query("User").unwrap().find(1).delete().await;
        assert!(matches!(result, Err(QueryError::IntegrityViolation(_))));
        assert!(!backend.statements().iter().any(|s| s.starts_with("DELETE")));
    }

    #[tokio::test]
    async fn test_cascade_and_nullify() {
        let backend = MockBackend::sqlite();
        let connection = family(&backend, Integrity::Cascade, Integrity::Nullify);
        backend.push_rows(vec![record(json!({ "id": 1 })), record(json!({ "id": 2 }))]);

        connection.query("User").unwrap().where_json(json!({ "name": "x" })).unwrap().delete().await.unwrap();

        let statements = backend.statements();
        assert_eq!(statements.len(), 4);
        assert!(statements[0].starts_with("SELECT"));
        assert!(statements[1].starts_with("DELETE FROM posts"));
        assert!(statements[2].starts_with("UPDATE likes SET user_id = NULL"));
        assert!(statements[3].starts_with("DELETE FROM users"));
    }

    #[tokio::test]
    async fn test_delete_without_matches_touches_nothing() {
        let backend = MockBackend::sqlite();
        let connection = family(&backend, Integrity::Cascade, Integrity::Ignore);

        let deleted = connection.query("User").unwrap().delete().await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(backend.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let backend = MockBackend::sqlite();
        let connection = family(&backend, Integrity::Ignore, Integrity::Ignore);

        let mut transaction = connection.transaction(None).await.unwrap();
        connection
            .create("User", record(json!({ "name": "Ann" })), Some(&transaction))
            .await
            .unwrap();
        connection.rollback(&mut transaction).await.unwrap();

        assert_eq!(backend.statements().last().map(String::as_str), Some("ROLLBACK"));
        let again = connection.commit(&mut transaction).await;
        assert!(matches!(again, Err(QueryError::TransactionFinished)));
        assert_eq!(backend.pinned_count(), 0);
    }
}
