//! Transactions pinned to one backend connection.
//!
//! A [`Transaction`] is plain data: its state and the connection it holds.
//! Queries carry a reference to it and route their statements to that
//! connection; once committed or rolled back, any further use fails with
//! [`QueryError::TransactionFinished`].

use crate::adapter::Adapter;
use crate::backend::ConnectionId;
use crate::error::{QueryError, Result};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Initial,
    Started,
    Committed,
    Rollbacked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    state: TransactionState,
    connection: Option<ConnectionId>,
    isolation_level: Option<IsolationLevel>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Initial,
            connection: None,
            isolation_level: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    /// Acquire a dedicated connection and open the transaction on it
    pub async fn setup<A: Adapter + ?Sized>(&mut self, adapter: &A, isolation_level: Option<IsolationLevel>) -> Result<()> {
        if self.state != TransactionState::Initial {
            return Err(QueryError::Transaction(format!(
                "Transaction already set up ({:?})",
                self.state
            )));
        }

        let connection = adapter.get_connection().await?;
        if let Err(e) = adapter.start_transaction(connection, isolation_level).await {
            warn!("Failed to start transaction: {}", e);
            adapter.release_connection(connection).await?;
            return Err(e);
        }

        debug!("Transaction started on connection {:?}", connection);
        self.connection = Some(connection);
        self.isolation_level = isolation_level;
        self.state = TransactionState::Started;
        Ok(())
    }

    /// The pinned connection, or an error if the transaction is not usable
    pub fn check_active(&self) -> Result<ConnectionId> {
        match (self.state, self.connection) {
            (TransactionState::Started, Some(connection)) => Ok(connection),
            (TransactionState::Committed | TransactionState::Rollbacked, _) => {
                Err(QueryError::TransactionFinished)
            }
            _ => Err(QueryError::Transaction("Transaction not started".to_string())),
        }
    }

    pub async fn commit<A: Adapter + ?Sized>(&mut self, adapter: &A) -> Result<()> {
        let connection = self.check_active()?;
        let result = adapter.commit_transaction(connection).await;
        if result.is_ok() {
            self.finish(adapter, connection, TransactionState::Committed).await?;
        }
        result
    }

    /// Roll back; the transaction is finished even if the backend reports an error
    pub async fn rollback<A: Adapter + ?Sized>(&mut self, adapter: &A) -> Result<()> {
        let connection = self.check_active()?;
        let result = adapter.rollback_transaction(connection).await;
        self.finish(adapter, connection, TransactionState::Rollbacked).await?;
        result
    }

    async fn finish<A: Adapter + ?Sized>(
        &mut self,
        adapter: &A,
        connection: ConnectionId,
        state: TransactionState,
    ) -> Result<()> {
        self.state = state;
        self.connection = None;
        debug!("Transaction {:?} on connection {:?}", state, connection);
        adapter.release_connection(connection).await
    }
}
