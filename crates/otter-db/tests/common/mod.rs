//! Recording adapter for transaction tests
//!
//! Logs every store call and fails or stalls the ones a test asks for.

#![allow(dead_code)]

use async_trait::async_trait;
use otter_db::{
    Db, DbError, DbResult, IsolationLevel, QueryResult, SqlAdapter, SqlTransaction, SqlValue,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub begin: bool,
    pub commit: bool,
    pub rollback: bool,
    pub savepoint: bool,
    pub rollback_to_savepoint: bool,
    pub execute: Option<String>,
    /// Commit never completes
    pub stall_commit: bool,
}

#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
    faults: Mutex<Faults>,
    closed: AtomicBool,
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of calls whose name is exactly `op` or starts with `op:`
    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls
            .lock()
            .iter()
            .filter(|call| *call == op || call.starts_with(&prefix))
            .count()
    }

    pub fn fail(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut self.faults.lock());
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn faults(&self) -> Faults {
        self.faults.lock().clone()
    }
}

pub struct RecordingAdapter(Arc<Recorder>);

/// Route library logs to the test harness; `RUST_LOG` overrides the filter
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("otter_db=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A handle over a fresh recording adapter
pub fn recording_db() -> (Db, Arc<Recorder>) {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let db = Db::from_adapter(Arc::new(RecordingAdapter(recorder.clone())));
    (db, recorder)
}

fn injected(op: &str) -> DbError {
    DbError::Connection(format!("{} connection lost", op))
}

#[async_trait]
impl SqlAdapter for RecordingAdapter {
    fn adapter_type(&self) -> &'static str {
        "recording"
    }

    async fn query(&self, sql: &str, _params: &[SqlValue]) -> DbResult<QueryResult> {
        self.0.record(format!("query:{}", sql));
        Ok(QueryResult::default())
    }

    async fn execute(&self, sql: &str, _params: &[SqlValue]) -> DbResult<u64> {
        self.0.record(format!("execute:{}", sql));
        Ok(1)
    }

    async fn begin(&self, isolation: Option<IsolationLevel>) -> DbResult<Box<dyn SqlTransaction>> {
        match isolation {
            Some(level) => self.0.record(format!("begin:{}", level.as_sql())),
            None => self.0.record("begin"),
        }
        if self.0.faults().begin {
            return Err(injected("begin"));
        }
        Ok(Box::new(RecordingTransaction(self.0.clone())))
    }

    async fn ping(&self) -> DbResult<()> {
        self.0.record("ping");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> DbResult<()> {
        self.0.record("close");
        self.0.close();
        Ok(())
    }
}

struct RecordingTransaction(Arc<Recorder>);

#[async_trait]
impl SqlTransaction for RecordingTransaction {
    async fn query(&self, sql: &str, _params: &[SqlValue]) -> DbResult<QueryResult> {
        self.0.record(format!("query:{}", sql));
        Ok(QueryResult::default())
    }

    async fn execute(&self, sql: &str, _params: &[SqlValue]) -> DbResult<u64> {
        self.0.record(format!("execute:{}", sql));
        match self.0.faults().execute {
            Some(failing) if failing == sql => Err(DbError::Query(format!("{} failed", sql))),
            _ => Ok(1),
        }
    }

    async fn savepoint(&self, name: &str) -> DbResult<()> {
        self.0.record(format!("savepoint:{}", name));
        if self.0.faults().savepoint {
            return Err(injected("savepoint"));
        }
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        self.0.record(format!("rollback_to_savepoint:{}", name));
        if self.0.faults().rollback_to_savepoint {
            return Err(injected("savepoint rollback"));
        }
        Ok(())
    }

    async fn commit(&self) -> DbResult<()> {
        self.0.record("commit");
        let faults = self.0.faults();
        if faults.stall_commit {
            futures_util::future::pending::<()>().await;
        }
        if faults.commit {
            return Err(injected("commit"));
        }
        Ok(())
    }

    async fn rollback(&self) -> DbResult<()> {
        self.0.record("rollback");
        if self.0.faults().rollback {
            return Err(injected("rollback"));
        }
        Ok(())
    }
}
