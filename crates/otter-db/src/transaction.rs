//! Transaction helpers
//!
//! Runs a unit of work inside a transaction, committing when it succeeds and
//! rolling back when it fails or panics. The nested variants reuse a
//! transaction that is already open on the handle by layering a savepoint on
//! top of it, so helpers that need atomicity can be composed without knowing
//! whether their caller already opened a transaction.
//!
//! ```ignore
//! with_transaction(&db, |tx| async move {
//!     tx.execute("INSERT INTO orders (id) VALUES (?)", &[1.into()]).await?;
//!     with_nested_transaction(&tx, |tx| async move {
//!         tx.execute("INSERT INTO order_lines (order_id) VALUES (?)", &[1.into()])
//!             .await?;
//!         Ok(())
//!     })
//!     .await?;
//!     Ok(())
//! })
//! .await?;
//! ```

use crate::adapter::{QueryResult, SqlTransaction};
use crate::context::Context;
use crate::error::{BoxError, DbError, DbResult};
use crate::handle::Db;
use crate::value::SqlValue;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// An open physical transaction shared by every handle bound to it.
///
/// Commit and rollback can each happen at most once; statements are refused
/// after either.
pub(crate) struct ActiveTransaction {
    inner: Box<dyn SqlTransaction>,
    state: Mutex<TransactionState>,
    savepoints: AtomicU64,
}

impl ActiveTransaction {
    fn new(inner: Box<dyn SqlTransaction>) -> Self {
        Self {
            inner,
            state: Mutex::new(TransactionState::Active),
            savepoints: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) async fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        self.ensure_active()?;
        self.inner.query(sql, params).await
    }

    pub(crate) async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.ensure_active()?;
        self.inner.execute(sql, params).await
    }

    /// Savepoint names are unique for the lifetime of this transaction
    fn next_savepoint_name(&self) -> String {
        let id = self.savepoints.fetch_add(1, Ordering::Relaxed) + 1;
        format!("sp_{}", id)
    }

    async fn savepoint(&self, ctx: &Context, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        ctx.run(self.inner.savepoint(name)).await
    }

    async fn rollback_to_savepoint(&self, ctx: &Context, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        ctx.run(self.inner.rollback_to_savepoint(name)).await
    }

    async fn commit(&self, ctx: &Context) -> DbResult<()> {
        self.finish(TransactionState::Committed)?;
        ctx.run(self.inner.commit()).await
    }

    async fn rollback(&self, ctx: &Context) -> DbResult<()> {
        self.finish(TransactionState::RolledBack)?;
        ctx.run(self.inner.rollback()).await
    }

    fn finish(&self, next: TransactionState) -> DbResult<()> {
        let mut state = self.state.lock();
        if *state != TransactionState::Active {
            return Err(finished_error(*state));
        }
        *state = next;
        Ok(())
    }

    fn ensure_active(&self) -> DbResult<()> {
        match self.state() {
            TransactionState::Active => Ok(()),
            state => Err(finished_error(state)),
        }
    }
}

fn finished_error(state: TransactionState) -> DbError {
    let reason = match state {
        TransactionState::Committed => "transaction has already been committed",
        _ => "transaction has already been rolled back",
    };
    DbError::transaction("transaction is no longer usable", reason)
}

/// Execute `work` within a new database transaction.
pub async fn with_transaction<F, Fut>(db: &Db, work: F) -> DbResult<()>
where
    F: FnOnce(Db) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    with_transaction_context(&Context::background(), db, work).await
}

/// Execute `work` within a new database transaction scoped to `ctx`.
///
/// `work` receives a handle bound to the transaction. The transaction is
/// committed when `work` succeeds and rolled back when it fails, when `ctx`
/// is done before the commit, or when `work` panics. Panics are resumed after
/// the rollback with the original payload.
pub async fn with_transaction_context<F, Fut>(ctx: &Context, db: &Db, work: F) -> DbResult<()>
where
    F: FnOnce(Db) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    let adapter = db.adapter()?;
    if db.in_transaction() {
        return Err(DbError::transaction(
            "failed to begin transaction",
            "a transaction is already open on this handle, use a nested transaction",
        ));
    }

    let tx = ctx
        .run(adapter.begin(db.isolation()))
        .await
        .map_err(|e| DbError::transaction("failed to begin transaction", e))?;
    let tx = Arc::new(ActiveTransaction::new(tx));
    let handle = db.bind(tx.clone(), ctx.clone())?;
    debug!(adapter = adapter.adapter_type(), "transaction started");

    let outcome = AssertUnwindSafe(async move { work(handle).await })
        .catch_unwind()
        .await;

    match outcome {
        Err(panic) => {
            if let Err(err) = tx.rollback(&Context::cleanup()).await {
                warn!(error = %err, "rollback after panic failed");
            }
            resume_unwind(panic)
        }
        Ok(Err(err)) => match tx.rollback(&Context::cleanup()).await {
            Ok(()) => {
                debug!(error = %err, "transaction rolled back");
                Err(DbError::transaction("transaction failed", err))
            }
            Err(rollback) => {
                warn!(error = %err, rollback_error = %rollback, "rollback failed");
                Err(DbError::Rollback {
                    context: "transaction failed",
                    cleanup: "rollback",
                    source: err,
                    rollback: Box::new(rollback),
                })
            }
        },
        Ok(Ok(())) => {
            if let Some(err) = ctx.err() {
                if let Err(rollback) = tx.rollback(&Context::cleanup()).await {
                    warn!(error = %rollback, "rollback of abandoned transaction failed");
                }
                return Err(err);
            }
            tx.commit(ctx)
                .await
                .map_err(|e| DbError::Commit(Box::new(e)))?;
            debug!("transaction committed");
            Ok(())
        }
    }
}

/// Execute `work` within a savepoint when `db` is bound to an open
/// transaction, otherwise within a new transaction.
pub async fn with_nested_transaction<F, Fut>(db: &Db, work: F) -> DbResult<()>
where
    F: FnOnce(Db) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    with_nested_transaction_context(&Context::background(), db, work).await
}

/// Context-aware form of [`with_nested_transaction`].
///
/// Inside an open transaction a successful `work` leaves its savepoint in
/// place; it is released by the enclosing commit. A failing or panicking
/// `work` is undone by rolling back to the savepoint, leaving the enclosing
/// transaction usable.
pub async fn with_nested_transaction_context<F, Fut>(
    ctx: &Context,
    db: &Db,
    work: F,
) -> DbResult<()>
where
    F: FnOnce(Db) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    db.adapter()?;
    let Some(tx) = db.active_transaction().cloned() else {
        return with_transaction_context(ctx, db, work).await;
    };

    let savepoint = tx.next_savepoint_name();
    tx.savepoint(ctx, &savepoint)
        .await
        .map_err(|e| DbError::nested("failed to create savepoint", e))?;
    debug!(savepoint = %savepoint, "savepoint created");

    let handle = db.with_context(ctx.clone());
    let outcome = AssertUnwindSafe(async move { work(handle).await })
        .catch_unwind()
        .await;

    match outcome {
        Err(panic) => {
            if let Err(err) = tx.rollback_to_savepoint(&Context::cleanup(), &savepoint).await {
                warn!(savepoint = %savepoint, error = %err, "savepoint rollback after panic failed");
            }
            resume_unwind(panic)
        }
        Ok(Err(err)) => match tx.rollback_to_savepoint(&Context::cleanup(), &savepoint).await {
            Ok(()) => {
                debug!(savepoint = %savepoint, error = %err, "rolled back to savepoint");
                Err(DbError::nested("nested transaction failed", err))
            }
            Err(rollback) => {
                warn!(savepoint = %savepoint, error = %err, rollback_error = %rollback, "savepoint rollback failed");
                Err(DbError::Rollback {
                    context: "nested transaction failed",
                    cleanup: "savepoint rollback",
                    source: err,
                    rollback: Box::new(rollback),
                })
            }
        },
        Ok(Ok(())) => {
            if let Some(err) = ctx.err() {
                if let Err(rollback) = tx
                    .rollback_to_savepoint(&Context::cleanup(), &savepoint)
                    .await
                {
                    warn!(savepoint = %savepoint, error = %rollback, "savepoint rollback failed");
                }
                return Err(err);
            }
            Ok(())
        }
    }
}
