//! Otter DB - database access for Otter services
//!
//! Connection handles for PostgreSQL and SQLite, transaction helpers that
//! commit, roll back and nest through savepoints, JSON document columns,
//! reusable model fields, and an optional MongoDB client.
//!
//! # Usage
//!
//! ```no_run
//! use otter_db::{Db, with_nested_transaction, with_transaction};
//!
//! # async fn demo() -> otter_db::DbResult<()> {
//! let db = Db::sqlite(":memory:")?;
//! db.execute("CREATE TABLE accounts (id INTEGER, balance INTEGER)", &[])
//!     .await?;
//!
//! with_transaction(&db, |tx| async move {
//!     tx.execute("INSERT INTO accounts VALUES (1, 100)", &[]).await?;
//!
//!     // Rolled back on its own if it fails; the outer insert survives
//!     let _ = with_nested_transaction(&tx, |tx| async move {
//!         tx.execute("INSERT INTO missing_table VALUES (1)", &[]).await?;
//!         Ok(())
//!     })
//!     .await;
//!
//!     Ok(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod context;
pub mod document;
pub mod jsonb;
pub mod model;
pub mod postgres;
pub mod sqlite;
pub mod transaction;

mod error;
mod handle;
mod value;

pub use adapter::{
    IsolationLevel, PoolStats, QueryResult, SharedAdapter, SqlAdapter, SqlRow, SqlTransaction,
};
pub use context::Context;
pub use document::{DocumentConfig, ReadPreferenceMode};
pub use error::{BoxError, DbError, DbResult};
pub use handle::{Db, LogLevel, LogSettings};
pub use jsonb::{Jsonb, JsonbArray};
pub use model::{
    BaseModel, BeforeCreate, Identified, RecordId, SoftDeletable, SoftDelete, Timestamped,
    Timestamps,
};
pub use postgres::{PostgresAdapter, PostgresConfig, SslMode};
pub use sqlite::SqliteAdapter;
pub use transaction::{
    TransactionState, with_nested_transaction, with_nested_transaction_context, with_transaction,
    with_transaction_context,
};
pub use value::SqlValue;

#[cfg(feature = "mongo")]
pub use document::DocumentClient;
