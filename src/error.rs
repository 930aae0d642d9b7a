use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Duplicate key: {message}")]
    DuplicateKey {
        column: Option<String>,
        message: String,
    },

    #[error("Transaction finished")]
    TransactionFinished,

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Model not registered: {0}")]
    ModelNotRegistered(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
    #[error("SQLx error: {0}")]
    Sqlx(sqlx::Error),
}

impl QueryError {
    /// Only transport failures are worth another attempt; everything else is
    /// either a programmer error or a verdict from the database.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Connection(_))
    }

    /// Re-classify a message reported by a backend into the error taxonomy.
    pub fn classify_database_message(message: &str) -> QueryError {
        let lower = message.to_lowercase();

        if lower.contains("unique constraint")
            || lower.contains("duplicate key")
            || lower.contains("duplicate entry")
            || lower.contains("e11000")
        {
            return QueryError::DuplicateKey {
                column: duplicate_column(message),
                message: message.to_string(),
            };
        }

        if lower.contains("foreign key") || lower.contains("a foreign key constraint fails") {
            return QueryError::IntegrityViolation(message.to_string());
        }

        QueryError::Database(format!("unknown error: {}", message))
    }
}

/// Pull the offending column out of a unique-violation message.
///
/// Handles the three shapes the SQL drivers produce:
/// - SQLite: `UNIQUE constraint failed: users.email`
/// - MySQL: `Duplicate entry 'x' for key 'users.email'`
/// - PostgreSQL: `... unique constraint "users_email_key"` / `Key (email)=(x) already exists`
fn duplicate_column(message: &str) -> Option<String> {
    if let Some(rest) = message.split("UNIQUE constraint failed: ").nth(1) {
        let first = rest.split(',').next()?.trim();
        return first.rsplit('.').next().map(|s| s.to_string());
    }

    if let Some(rest) = message.split("for key '").nth(1) {
        let key = rest.split('\'').next()?;
        return key.rsplit('.').next().map(|s| s.to_string());
    }

    if let Some(rest) = message.split("Key (").nth(1) {
        return rest.split(')').next().map(|s| s.to_string());
    }

    if let Some(rest) = message.split("unique constraint \"").nth(1) {
        let name = rest.split('"').next()?;
        let trimmed = name.strip_suffix("_key").unwrap_or(name);
        return trimmed.split_once('_').map(|(_, col)| col.to_string());
    }

    if let Some(rest) = message.split("index: ").nth(1) {
        let name = rest.split_whitespace().next()?;
        return name.split('_').next().map(|s| s.to_string());
    }

    None
}

#[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                match db_err.kind() {
                    sqlx::error::ErrorKind::UniqueViolation => QueryError::DuplicateKey {
                        column: duplicate_column(&message),
                        message,
                    },
                    sqlx::error::ErrorKind::ForeignKeyViolation => {
                        QueryError::IntegrityViolation(message)
                    }
                    _ => QueryError::classify_database_message(&message),
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
                QueryError::Connection(err.to_string())
            }
            _ => QueryError::Sqlx(err),
        }
    }
}

impl From<bson::ser::Error> for QueryError {
    fn from(err: bson::ser::Error) -> Self {
        QueryError::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for QueryError {
    fn from(err: bson::de::Error) -> Self {
        QueryError::Serialization(err.to_string())
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for QueryError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
                QueryError::Connection(err.to_string())
            }
            _ => QueryError::classify_database_message(&err.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueryError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            QueryError::Connection(err.to_string())
        } else {
            QueryError::Database(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sqlite_unique() {
        let err = QueryError::classify_database_message("UNIQUE constraint failed: users.email");
        match err {
            QueryError::DuplicateKey { column, .. } => assert_eq!(column.as_deref(), Some("email")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_mysql_duplicate() {
        let err = QueryError::classify_database_message(
            "Duplicate entry 'alice' for key 'users.name'",
        );
        match err {
            QueryError::DuplicateKey { column, .. } => assert_eq!(column.as_deref(), Some("name")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_postgres_duplicate() {
        let err = QueryError::classify_database_message(
            "duplicate key value violates unique constraint \"users_email_key\"",
        );
        match err {
            QueryError::DuplicateKey { column, .. } => assert_eq!(column.as_deref(), Some("email")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_mongo_duplicate() {
        let err = QueryError::classify_database_message(
            "E11000 duplicate key error collection: shop.users index: email_1 dup key: { email: \"a\" }",
        );
        match err {
            QueryError::DuplicateKey { column, .. } => assert_eq!(column.as_deref(), Some("email")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_foreign_key() {
        let err = QueryError::classify_database_message("FOREIGN KEY constraint failed");
        assert!(matches!(err, QueryError::IntegrityViolation(_)));
    }

    #[test]
    fn test_classify_unknown() {
        let err = QueryError::classify_database_message("disk I/O error");
        assert!(matches!(err, QueryError::Database(ref m) if m.starts_with("unknown error")));
        assert!(!err.is_retryable());
        assert!(QueryError::Connection("refused".into()).is_retryable());
    }
}
