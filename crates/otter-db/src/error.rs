//! Database error types

use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

/// Boxed error returned by units of work and carried as a cause
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Begin failed, or the unit of work failed and was rolled back
    #[error("{context}: {source}")]
    Transaction {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] Box<DbError>),

    /// Rollback failed while handling an earlier failure. Both causes are kept.
    #[error("{context}: {source}, {cleanup} failed: {rollback}")]
    Rollback {
        context: &'static str,
        cleanup: &'static str,
        #[source]
        source: BoxError,
        rollback: Box<DbError>,
    },

    #[error("{context}: {source}")]
    NestedTransaction {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("SQLite error: {message}")]
    Sqlite { message: String, code: Option<i32> },

    #[error("PostgreSQL error: {message}")]
    Postgres {
        message: String,
        code: Option<String>,
        detail: Option<String>,
        hint: Option<String>,
    },

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Document store error: {0}")]
    Document(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    pub fn configuration(message: impl Into<String>) -> Self {
        DbError::Configuration(message.into())
    }

    pub fn sqlite(err: rusqlite::Error) -> Self {
        DbError::Sqlite {
            message: err.to_string(),
            code: err.sqlite_error_code().map(|c| c as i32),
        }
    }

    pub fn postgres(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            DbError::Postgres {
                message: db_err.message().to_string(),
                code: Some(db_err.code().code().to_string()),
                detail: db_err.detail().map(|s| s.to_string()),
                hint: db_err.hint().map(|s| s.to_string()),
            }
        } else {
            DbError::Postgres {
                message: err.to_string(),
                code: None,
                detail: None,
                hint: None,
            }
        }
    }

    /// Map well-known SQLSTATE codes onto dedicated variants
    pub fn translate(self) -> Self {
        match self {
            DbError::Postgres {
                message,
                code: Some(code),
                detail,
                hint,
            } => match code.as_str() {
                "23505" => DbError::UniqueViolation(message),
                "23503" => DbError::ForeignKeyViolation(message),
                _ => DbError::Postgres {
                    message,
                    code: Some(code),
                    detail,
                    hint,
                },
            },
            other => other,
        }
    }

    /// True when this error, or any error in its cause chain, came from a
    /// cancelled or expired context.
    pub fn is_cancellation(&self) -> bool {
        match self {
            DbError::Cancelled | DbError::DeadlineExceeded => true,
            DbError::Commit(inner) => inner.is_cancellation(),
            DbError::Transaction { source, .. }
            | DbError::NestedTransaction { source, .. }
            | DbError::Rollback { source, .. } => source
                .downcast_ref::<DbError>()
                .is_some_and(DbError::is_cancellation),
            _ => false,
        }
    }

    pub(crate) fn transaction(context: &'static str, source: impl Into<BoxError>) -> Self {
        DbError::Transaction {
            context,
            source: source.into(),
        }
    }

    pub(crate) fn nested(context: &'static str, source: impl Into<BoxError>) -> Self {
        DbError::NestedTransaction {
            context,
            source: source.into(),
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::sqlite(err)
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        DbError::postgres(err)
    }
}

impl From<deadpool_postgres::PoolError> for DbError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DbError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::TypeConversion(err.to_string())
    }
}

#[cfg(feature = "mongo")]
impl From<mongodb::error::Error> for DbError {
    fn from(err: mongodb::error::Error) -> Self {
        DbError::Document(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_error_reports_both_causes() {
        let err = DbError::Rollback {
            context: "transaction failed",
            cleanup: "rollback",
            source: "second insert failed".into(),
            rollback: Box::new(DbError::Connection("connection reset".into())),
        };
        let message = err.to_string();
        assert!(message.contains("second insert failed"));
        assert!(message.contains("rollback failed"));
        assert!(message.contains("connection reset"));
    }

    #[test]
    fn test_cancellation_is_found_through_wrappers() {
        let err = DbError::transaction("transaction failed", DbError::Cancelled);
        assert!(err.is_cancellation());

        let err = DbError::Commit(Box::new(DbError::DeadlineExceeded));
        assert!(err.is_cancellation());

        let err = DbError::transaction("transaction failed", "plain failure");
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_translate_maps_sqlstate() {
        let err = DbError::Postgres {
            message: "duplicate key".into(),
            code: Some("23505".into()),
            detail: None,
            hint: None,
        };
        assert!(matches!(err.translate(), DbError::UniqueViolation(_)));

        let err = DbError::Postgres {
            message: "syntax error".into(),
            code: Some("42601".into()),
            detail: None,
            hint: None,
        };
        assert!(matches!(err.translate(), DbError::Postgres { .. }));
    }
}
