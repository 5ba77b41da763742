//! The `Db` handle
//!
//! A `Db` is either bound to a connection pool or to exactly one open
//! transaction. Units of work run by the transaction helpers receive a
//! transaction-bound `Db`, so statements they issue, and nested transaction
//! calls they make, land on the same physical transaction.

use crate::adapter::{IsolationLevel, PoolStats, QueryResult, SharedAdapter};
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::postgres::{PostgresAdapter, PostgresConfig};
use crate::sqlite::SqliteAdapter;
use crate::transaction::ActiveTransaction;
use crate::value::SqlValue;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How much statement activity is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Silent,
    /// Failed statements
    Error,
    /// Failed and slow statements
    Warn,
    /// Every statement
    #[default]
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LogLevel,
    pub slow_threshold: Duration,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            slow_threshold: Duration::from_millis(200),
        }
    }
}

impl LogSettings {
    fn record(&self, sql: &str, elapsed: Duration, error: Option<&DbError>) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if let Some(err) = error {
            if self.level >= LogLevel::Error {
                tracing::error!(sql, elapsed_ms, error = %err, "statement failed");
            }
            return;
        }
        if self.level >= LogLevel::Warn && elapsed >= self.slow_threshold {
            tracing::warn!(sql, elapsed_ms, "slow statement");
        } else if self.level >= LogLevel::Info {
            tracing::debug!(sql, elapsed_ms, "statement");
        }
    }
}

#[derive(Clone)]
enum Binding {
    Pool(SharedAdapter),
    Transaction {
        adapter: SharedAdapter,
        tx: Arc<ActiveTransaction>,
    },
}

impl Binding {
    fn adapter(&self) -> &SharedAdapter {
        match self {
            Binding::Pool(adapter) => adapter,
            Binding::Transaction { adapter, .. } => adapter,
        }
    }
}

/// Database handle
#[derive(Clone, Default)]
pub struct Db {
    binding: Option<Binding>,
    ctx: Context,
    log: LogSettings,
    translate_errors: bool,
    isolation: Option<IsolationLevel>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("adapter", &self.binding.as_ref().map(|b| b.adapter().adapter_type()))
            .field("in_transaction", &self.in_transaction())
            .field("log", &self.log)
            .finish()
    }
}

impl Db {
    /// A handle with no connection behind it. Every operation on it fails
    /// with a configuration error.
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn from_adapter(adapter: SharedAdapter) -> Self {
        Self {
            binding: Some(Binding::Pool(adapter)),
            ..Self::default()
        }
    }

    /// Connect a pooled PostgreSQL handle. Logging and error translation
    /// follow the configuration.
    pub async fn postgres(config: PostgresConfig) -> DbResult<Self> {
        let adapter = PostgresAdapter::connect(config).await?;
        let config = adapter.config();
        let log = LogSettings {
            level: config.log_level.unwrap_or_default(),
            slow_threshold: config.slow_threshold,
        };
        let translate_errors = config.translate_errors;

        Ok(Self::from_adapter(Arc::new(adapter))
            .with_log(log)
            .with_error_translation(translate_errors))
    }

    /// Open a SQLite handle (`:memory:` or a file path)
    pub fn sqlite(path: &str) -> DbResult<Self> {
        Ok(Self::from_adapter(Arc::new(SqliteAdapter::open(path)?)))
    }

    /// Same connection or transaction, different context
    pub fn with_context(&self, ctx: Context) -> Self {
        Self {
            ctx,
            ..self.clone()
        }
    }

    pub fn with_log(&self, log: LogSettings) -> Self {
        Self {
            log,
            ..self.clone()
        }
    }

    pub fn with_error_translation(&self, translate_errors: bool) -> Self {
        Self {
            translate_errors,
            ..self.clone()
        }
    }

    /// Isolation level for transactions begun through this handle
    pub fn with_isolation(&self, level: IsolationLevel) -> Self {
        Self {
            isolation: Some(level),
            ..self.clone()
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn is_connected(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|b| !b.adapter().is_closed())
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.binding, Some(Binding::Transaction { .. }))
    }

    pub fn adapter_type(&self) -> Option<&'static str> {
        self.binding.as_ref().map(|b| b.adapter().adapter_type())
    }

    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        match self.binding()? {
            Binding::Pool(adapter) => self.observe(sql, adapter.query(sql, params)).await,
            Binding::Transaction { tx, .. } => self.observe(sql, tx.query(sql, params)).await,
        }
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        match self.binding()? {
            Binding::Pool(adapter) => self.observe(sql, adapter.execute(sql, params)).await,
            Binding::Transaction { tx, .. } => self.observe(sql, tx.execute(sql, params)).await,
        }
    }

    /// Test the connection
    pub async fn ping(&self, ctx: &Context) -> DbResult<()> {
        let adapter = self.adapter()?;
        ctx.run(adapter.ping()).await
    }

    pub async fn is_healthy(&self, ctx: &Context) -> bool {
        self.ping(ctx).await.is_ok()
    }

    pub fn stats(&self) -> PoolStats {
        self.binding
            .as_ref()
            .map(|b| b.adapter().stats())
            .unwrap_or_default()
    }

    /// Close the underlying pool. Handles sharing it become unusable.
    pub async fn close(&self) -> DbResult<()> {
        match &self.binding {
            Some(binding) => binding.adapter().close().await,
            None => Ok(()),
        }
    }

    pub(crate) fn adapter(&self) -> DbResult<&SharedAdapter> {
        self.binding().map(Binding::adapter)
    }

    pub(crate) fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub(crate) fn active_transaction(&self) -> Option<&Arc<ActiveTransaction>> {
        match &self.binding {
            Some(Binding::Transaction { tx, .. }) => Some(tx),
            _ => None,
        }
    }

    /// A handle bound to `tx`, inheriting this handle's settings
    pub(crate) fn bind(&self, tx: Arc<ActiveTransaction>, ctx: Context) -> DbResult<Self> {
        let adapter = self.adapter()?.clone();
        Ok(Self {
            binding: Some(Binding::Transaction { adapter, tx }),
            ctx,
            ..self.clone()
        })
    }

    fn binding(&self) -> DbResult<&Binding> {
        match &self.binding {
            None => Err(DbError::configuration(
                "database connection is not initialized",
            )),
            Some(binding) if binding.adapter().is_closed() => {
                Err(DbError::configuration("database connection is closed"))
            }
            Some(binding) => Ok(binding),
        }
    }

    async fn observe<T, F>(&self, sql: &str, call: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let started = Instant::now();
        let result = self.ctx.run(call).await;
        self.log.record(sql, started.elapsed(), result.as_ref().err());

        if self.translate_errors {
            result.map_err(DbError::translate)
        } else {
            result
        }
    }
}
