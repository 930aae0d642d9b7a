//! In-process [`DatabaseBackend`] for unit tests.

use crate::backend::{missing, ConnectionId, DatabaseBackend, ExecResult, Record};
use crate::builder::Statement;
use crate::connection::ConnectionConfig;
use crate::dialect::{Dialect, MySqlDialect, PostgresDialect, SqliteDialect};
use crate::error::{QueryError, Result};
use crate::snapshot::Schemas;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    executed: Vec<(Option<ConnectionId>, Statement)>,
    rows: VecDeque<Vec<Record>>,
    schemas: Schemas,
    pinned: HashSet<ConnectionId>,
    fail_on: Option<String>,
    last_insert_id: i64,
    rows_affected: Option<u64>,
}

/// Records every statement and answers queries from a queue of canned rows
#[derive(Clone)]
pub struct MockBackend {
    dialect: Arc<dyn Dialect>,
    state: Arc<Mutex<State>>,
    next_connection: Arc<AtomicU64>,
}

impl MockBackend {
    pub fn with_dialect(dialect: Arc<dyn Dialect>) -> Self {
        Self {
            dialect,
            state: Arc::new(Mutex::new(State::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn sqlite() -> Self {
        Self::with_dialect(Arc::new(SqliteDialect))
    }

    pub fn postgres() -> Self {
        Self::with_dialect(Arc::new(PostgresDialect))
    }

    pub fn mysql() -> Self {
        Self::with_dialect(Arc::new(MySqlDialect))
    }

    /// Rows returned by the next `query` or `fetch`
    pub fn push_rows(&self, rows: Vec<Record>) {
        self.state.lock().unwrap().rows.push_back(rows);
    }

    pub fn set_schemas(&self, schemas: Schemas) {
        self.state.lock().unwrap().schemas = schemas;
    }

    /// Fail any statement containing `fragment`
    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().unwrap().fail_on = Some(fragment.to_string());
    }

    /// The next insert reports `id + 1`
    pub fn set_last_insert_id(&self, id: i64) {
        self.state.lock().unwrap().last_insert_id = id;
    }

    /// Rows affected reported by `execute`; one when unset
    pub fn set_rows_affected(&self, rows: u64) {
        self.state.lock().unwrap().rows_affected = Some(rows);
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.iter().map(|(_, s)| s.sql.clone()).collect()
    }

    pub fn executed(&self) -> Vec<(Option<ConnectionId>, Statement)> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn pinned_count(&self) -> usize {
        self.state.lock().unwrap().pinned.len()
    }

    fn record(&self, statement: &Statement, connection: Option<ConnectionId>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = connection {
            if !state.pinned.contains(&id) {
                return Err(missing(id));
            }
        }
        if let Some(fragment) = &state.fail_on {
            if statement.sql.contains(fragment.as_str()) {
                return Err(QueryError::Database(format!("mock failure on {}", statement.sql)));
            }
        }
        state.executed.push((connection, statement.clone()));
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for MockBackend {
    async fn connect(_config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::sqlite())
    }

    fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    async fn execute(&self, statement: &Statement, connection: Option<ConnectionId>) -> Result<ExecResult> {
        self.record(statement, connection)?;
        let mut state = self.state.lock().unwrap();
        state.last_insert_id += 1;
        Ok(ExecResult {
            rows_affected: state.rows_affected.unwrap_or(1),
            last_insert_id: Some(state.last_insert_id),
        })
    }

    async fn query(&self, statement: &Statement, connection: Option<ConnectionId>) -> Result<Vec<Record>> {
        self.record(statement, connection)?;
        Ok(self.state.lock().unwrap().rows.pop_front().unwrap_or_default())
    }

    async fn get_schemas(&self) -> Result<Schemas> {
        Ok(self.state.lock().unwrap().schemas.clone())
    }

    fn fetch(&self, statement: Statement) -> BoxStream<'static, Result<Record>> {
        match self.record(&statement, None) {
            Ok(()) => {
                let rows = self.state.lock().unwrap().rows.pop_front().unwrap_or_default();
                stream::iter(rows.into_iter().map(Ok)).boxed()
            }
            Err(e) => stream::iter(vec![Err(e)]).boxed(),
        }
    }

    async fn acquire(&self) -> Result<ConnectionId> {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        self.state.lock().unwrap().pinned.insert(id);
        Ok(id)
    }

    async fn release(&self, connection: ConnectionId) -> Result<()> {
        if self.state.lock().unwrap().pinned.remove(&connection) {
            Ok(())
        } else {
            Err(missing(connection))
        }
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
