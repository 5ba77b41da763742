//! The seam between [`Db`](crate::Db) and the relational backends.
//!
//! PostgreSQL and SQLite both implement [`SqlAdapter`]; an open transaction
//! is a boxed [`SqlTransaction`].

use crate::error::DbResult;
use crate::value::SqlValue;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Column names paired with the values of one result row
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Value of the first column named `column`
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        let index = self.columns.iter().position(|name| name == column)?;
        self.values.get(index)
    }

    pub fn get_by_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn to_json(&self) -> JsonValue {
        let object: serde_json::Map<String, JsonValue> = self
            .columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned().map(SqlValue::into_json))
            .collect();
        object.into()
    }
}

/// Rows produced by a query, in server order
#[derive(Debug, Default)]
pub struct QueryResult {
    pub rows: Vec<SqlRow>,
}

impl QueryResult {
    pub fn new(rows: Vec<SqlRow>) -> Self {
        Self { rows }
    }

    pub fn first(&self) -> Option<&SqlRow> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SqlRow> {
        self.rows.iter()
    }

    pub fn to_json_array(&self) -> JsonValue {
        self.rows.iter().map(SqlRow::to_json).collect()
    }
}

impl IntoIterator for QueryResult {
    type Item = SqlRow;
    type IntoIter = std::vec::IntoIter<SqlRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Connection pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

/// One open physical transaction.
///
/// Implementations do not track whether they have been finished; the
/// [`Db`](crate::Db) handle that owns the transaction does.
#[async_trait]
pub trait SqlTransaction: Send + Sync {
    /// Run a statement that returns rows
    async fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult>;

    /// Run a statement, returning the affected row count
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64>;

    /// `SAVEPOINT name`
    async fn savepoint(&self, name: &str) -> DbResult<()>;

    /// `ROLLBACK TO SAVEPOINT name`; the transaction stays open
    async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()>;

    async fn commit(&self) -> DbResult<()>;

    async fn rollback(&self) -> DbResult<()>;
}

/// A relational store that can run statements and open transactions
#[async_trait]
pub trait SqlAdapter: Send + Sync {
    /// Short backend name used in logs
    fn adapter_type(&self) -> &'static str;

    /// Run a statement that returns rows on a pooled connection
    async fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult>;

    /// Run a statement on a pooled connection
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64>;

    /// Open a transaction pinned to one connection
    async fn begin(&self, isolation: Option<IsolationLevel>) -> DbResult<Box<dyn SqlTransaction>>;

    /// Round-trip to the server
    async fn ping(&self) -> DbResult<()>;

    /// Pool counters; single-connection backends report a pool of one
    fn stats(&self) -> PoolStats {
        PoolStats {
            max_size: 1,
            size: 1,
            available: 1,
            waiting: 0,
        }
    }

    /// Whether [`close`](SqlAdapter::close) has been called
    fn is_closed(&self) -> bool;

    /// Release every connection; later calls fail
    async fn close(&self) -> DbResult<()>;
}

pub type SharedAdapter = Arc<dyn SqlAdapter>;
