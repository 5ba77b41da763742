//! SQLite adapter
//!
//! One rusqlite connection behind a mutex. Every call runs on the blocking
//! pool so the async runtime never waits on disk I/O.
//!
//! An open transaction owns the connection: it holds the adapter's gate
//! until it commits, rolls back or is dropped, and statements issued on the
//! adapter itself wait for the gate.

mod types;

use crate::adapter::{IsolationLevel, QueryResult, SqlAdapter, SqlRow, SqlTransaction};
use crate::error::{DbError, DbResult};
use crate::value::SqlValue;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as Gate, OwnedMutexGuard};

type SharedConn = Arc<Mutex<Connection>>;
type GateGuard = OwnedMutexGuard<()>;

const MEMORY: &str = ":memory:";

pub struct SqliteAdapter {
    conn: SharedConn,
    gate: Arc<Gate<()>>,
    path: String,
    closed: AtomicBool,
}

impl SqliteAdapter {
    /// Open `:memory:` or a database file. A `sqlite://` or `sqlite:`
    /// prefix is accepted. File databases use WAL journaling; foreign keys
    /// are enforced for both.
    pub fn open(path: &str) -> DbResult<Self> {
        let path = strip_scheme(path).to_string();
        let conn = if path == MEMORY {
            Connection::open_in_memory().map_err(DbError::sqlite)?
        } else {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .map_err(DbError::sqlite)?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
                .map_err(DbError::sqlite)?;
            conn
        };
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(DbError::sqlite)?;

        tracing::debug!(path = %path, "sqlite database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            gate: Arc::new(Gate::new(())),
            path,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Run `f` against the connection on the blocking pool
async fn blocking<T, F>(conn: &SharedConn, f: F) -> DbResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || f(&conn.lock()))
        .await
        .map_err(|e| DbError::Query(format!("sqlite worker failed: {}", e)))?
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(DbError::sqlite)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    // Only columns declared JSON or JSONB decode into `SqlValue::Json`
    let json: Vec<bool> = stmt
        .columns()
        .iter()
        .map(|column| column.decl_type().is_some_and(types::is_json_decl))
        .collect();

    let mut rows = stmt
        .query(params_from_iter(params.iter().map(types::Param)))
        .map_err(DbError::sqlite)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(DbError::sqlite)? {
        let values = (0..columns.len())
            .map(|i| types::column_value(row, i, json[i]))
            .collect();
        out.push(SqlRow::new(columns.clone(), values));
    }
    Ok(QueryResult::new(out))
}

fn run_execute(conn: &Connection, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
    let changed = conn
        .execute(sql, params_from_iter(params.iter().map(types::Param)))
        .map_err(DbError::sqlite)?;
    Ok(changed as u64)
}

async fn query(conn: &SharedConn, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
    let (sql, params) = (sql.to_string(), params.to_vec());
    blocking(conn, move |c| run_query(c, &sql, &params)).await
}

async fn execute(conn: &SharedConn, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
    let (sql, params) = (sql.to_string(), params.to_vec());
    blocking(conn, move |c| run_execute(c, &sql, &params)).await
}

/// BEGIN, SAVEPOINT, COMMIT and friends
async fn control(conn: &SharedConn, sql: String) -> DbResult<()> {
    blocking(conn, move |c| c.execute_batch(&sql).map_err(DbError::sqlite)).await
}

#[async_trait]
impl SqlAdapter for SqliteAdapter {
    fn adapter_type(&self) -> &'static str {
        "sqlite"
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        let _gate = self.gate.lock().await;
        query(&self.conn, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let _gate = self.gate.lock().await;
        execute(&self.conn, sql, params).await
    }

    /// Waits until no other transaction is open. SQLite has no
    /// per-transaction isolation levels; IMMEDIATE takes the write lock at
    /// begin instead of at the first write.
    async fn begin(&self, _isolation: Option<IsolationLevel>) -> DbResult<Box<dyn SqlTransaction>> {
        let gate = self.gate.clone().lock_owned().await;
        control(&self.conn, "BEGIN IMMEDIATE".into()).await?;
        Ok(Box::new(SqliteTransaction {
            conn: self.conn.clone(),
            gate: Mutex::new(Some(gate)),
            finished: AtomicBool::new(false),
        }))
    }

    async fn ping(&self) -> DbResult<()> {
        let _gate = self.gate.lock().await;
        query(&self.conn, "SELECT 1", &[]).await.map(drop)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> DbResult<()> {
        // The connection is released with the last handle
        self.closed.store(true, Ordering::Release);
        tracing::debug!(path = %self.path, "sqlite database closed");
        Ok(())
    }
}

struct SqliteTransaction {
    conn: SharedConn,
    gate: Mutex<Option<GateGuard>>,
    finished: AtomicBool,
}

impl SqliteTransaction {
    /// COMMIT or ROLLBACK; the gate opens once the connection is back in
    /// autocommit mode
    async fn finish(&self, sql: &str) -> DbResult<()> {
        control(&self.conn, sql.to_string()).await?;
        self.finished.store(true, Ordering::Release);
        self.gate.lock().take();
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl SqlTransaction for SqliteTransaction {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        query(&self.conn, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        execute(&self.conn, sql, params).await
    }

    async fn savepoint(&self, name: &str) -> DbResult<()> {
        control(&self.conn, format!("SAVEPOINT {}", quote_ident(name))).await
    }

    async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        control(&self.conn, format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name))).await
    }

    async fn commit(&self) -> DbResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> DbResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        // Abandoned without commit or rollback. The gate stays shut until
        // the connection has left the transaction.
        let gate = self.gate.get_mut().take();
        if let Some(conn) = self.conn.try_lock() {
            rollback_abandoned(&conn);
            return;
        }
        // A cancelled statement still holds the connection on the blocking pool
        let conn = self.conn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    rollback_abandoned(&conn.lock());
                    drop(gate);
                });
            }
            Err(_) => rollback_abandoned(&conn.lock()),
        }
    }
}

fn rollback_abandoned(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %err, "rollback of abandoned sqlite transaction failed");
    }
}

fn strip_scheme(path: &str) -> &str {
    if path == MEMORY {
        return path;
    }
    path.strip_prefix("sqlite://")
        .or_else(|| path.strip_prefix("sqlite:"))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn with_table() -> SqliteAdapter {
        let db = SqliteAdapter::open(MEMORY).unwrap();
        db.execute(
            "CREATE TABLE encounters (id INTEGER PRIMARY KEY, status TEXT, score REAL)",
            &[],
        )
        .await
        .unwrap();
        db
    }

    async fn count(db: &SqliteAdapter) -> Option<SqlValue> {
        db.query("SELECT COUNT(*) AS n FROM encounters", &[])
            .await
            .unwrap()
            .first()
            .and_then(|row| row.get("n").cloned())
    }

    #[tokio::test]
    async fn test_params_and_rows() {
        let db = with_table().await;
        let changed = db
            .execute(
                "INSERT INTO encounters (status, score) VALUES (?, ?), (?, ?)",
                &["planned".into(), 1.5.into(), "finished".into(), SqlValue::Null],
            )
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let result = db
            .query(
                "SELECT status, score FROM encounters WHERE status = ?",
                &["planned".into()],
            )
            .await
            .unwrap();
        let row = result.first().unwrap();
        assert_eq!(row.columns(), ["status", "score"]);
        assert_eq!(row.get("score"), Some(&SqlValue::Float(1.5)));
    }

    #[tokio::test]
    async fn test_rollback_to_savepoint_keeps_earlier_writes() {
        let db = with_table().await;

        let tx = db.begin(None).await.unwrap();
        tx.execute("INSERT INTO encounters (status) VALUES ('kept')", &[])
            .await
            .unwrap();
        tx.savepoint("sp_1").await.unwrap();
        tx.execute("INSERT INTO encounters (status) VALUES ('undone')", &[])
            .await
            .unwrap();
        tx.rollback_to_savepoint("sp_1").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count(&db).await, Some(SqlValue::Int(1)));
    }

    #[tokio::test]
    async fn test_abandoned_transaction_is_rolled_back() {
        let db = with_table().await;

        let tx = db.begin(None).await.unwrap();
        tx.execute("INSERT INTO encounters (status) VALUES ('lost')", &[])
            .await
            .unwrap();
        drop(tx);

        assert_eq!(count(&db).await, Some(SqlValue::Int(0)));
        // A new transaction can start on the same connection
        db.begin(None).await.unwrap().rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let db = SqliteAdapter::open(MEMORY).unwrap();
        db.execute("CREATE TABLE patients (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        db.execute(
            "CREATE TABLE visits (patient_id INTEGER REFERENCES patients(id))",
            &[],
        )
        .await
        .unwrap();

        let err = db
            .execute("INSERT INTO visits VALUES (42)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Sqlite { .. }));
    }

    #[tokio::test]
    async fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otter.db");
        let url = format!("sqlite://{}", path.display());

        let db = SqliteAdapter::open(&url).unwrap();
        assert_eq!(db.path(), path.to_str().unwrap());
        db.ping().await.unwrap();
        db.close().await.unwrap();
        assert!(db.is_closed());
    }

    #[tokio::test]
    async fn test_json_decoded_only_for_json_columns() {
        let db = SqliteAdapter::open(MEMORY).unwrap();
        db.execute("CREATE TABLE notes (body JSON, note TEXT)", &[])
            .await
            .unwrap();
        db.execute(
            "INSERT INTO notes VALUES (?, ?), (?, ?)",
            &[
                r#"{"a":1}"#.into(),
                "[]".into(),
                "not json".into(),
                r#"{"b":2}"#.into(),
            ],
        )
        .await
        .unwrap();

        let result = db.query("SELECT body, note FROM notes", &[]).await.unwrap();
        let rows: Vec<_> = result.iter().collect();
        assert_eq!(
            rows[0].get("body"),
            Some(&SqlValue::Json(serde_json::json!({"a": 1})))
        );
        assert_eq!(rows[0].get("note").and_then(SqlValue::as_str), Some("[]"));
        assert_eq!(rows[1].get("body").and_then(SqlValue::as_str), Some("not json"));
        assert_eq!(
            rows[1].get("note").and_then(SqlValue::as_str),
            Some(r#"{"b":2}"#)
        );
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme(":memory:"), ":memory:");
        assert_eq!(strip_scheme("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(strip_scheme("sqlite:a.db"), "a.db");
        assert_eq!(strip_scheme("a.db"), "a.db");
    }
}
