use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, InterruptHandle, OptionalExtension, params};
use strata_common::DriverError;
use tracing::{debug, info};

use crate::backend::{BackendOptions, quote_ident};
use crate::session::{
    ACTIVE_SQL_TRANSACTION, DriverResult, INVALID_TRANSACTION_TERMINATION, MetadataRecord,
    MetadataStore, Notice, Session,
};

/// What SQLite says when `BEGIN` is issued inside a transaction.
const NESTED_BEGIN_MESSAGE: &str = "cannot start a transaction within a transaction";

const TRANSACTION_ENDED_MESSAGE: &str =
    "statement ended the enclosing transaction; the run was rolled back";

const APPLICATION_ID_KEY: &str = "application_id";

/// A SQLite database as a migration target.
///
/// SQLite transactions are serializable, and `BEGIN EXCLUSIVE` takes the
/// database-wide write lock up front, so the lock is held from
/// [`Session::begin_serializable`] onwards. Other runners wait for it up to
/// the configured busy timeout.
pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    interrupt: InterruptHandle,
    table_name: String,
    table: String,
    identity_table: String,
    notices: Vec<Notice>,
}

impl SqliteSession {
    pub fn open(db_path: &Path, options: &BackendOptions) -> DriverResult<Self> {
        info!("opening sqlite database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| DriverError::new(format!("failed to open database: {e}")))?;
        Self::from_connection(conn, options)
    }

    pub fn in_memory(options: &BackendOptions) -> DriverResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DriverError::new(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn, options)
    }

    fn from_connection(conn: Connection, options: &BackendOptions) -> DriverResult<Self> {
        conn.busy_timeout(options.busy_timeout)
            .map_err(|e| DriverError::new(format!("failed to set busy timeout: {e}")))?;

        let table = format!("{}_{}", options.schema, options.table);
        Ok(Self {
            interrupt: conn.get_interrupt_handle(),
            identity_table: quote_ident(&format!("{table}_identity")),
            table: quote_ident(&table),
            table_name: table,
            conn: Arc::new(Mutex::new(conn)),
            notices: Vec::new(),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> DriverResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| DriverError::new("sqlite connection lock poisoned"))?;
            f(&conn).map_err(driver_error)
        })
        .await
        .map_err(|e| DriverError::new(format!("sqlite task failed: {e}")))?
    }
}

fn driver_error(e: rusqlite::Error) -> DriverError {
    match &e {
        rusqlite::Error::SqliteFailure(code, _) => {
            DriverError::with_code(e.to_string(), code.extended_code.to_string())
        }
        _ => DriverError::new(e.to_string()),
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}

#[async_trait]
impl Session for SqliteSession {
    async fn begin_serializable(&mut self) -> DriverResult<()> {
        self.with_conn(|conn| conn.execute_batch("BEGIN EXCLUSIVE"))
            .await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.with_conn(|conn| conn.execute_batch("COMMIT")).await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                return Ok(());
            }
            conn.execute_batch("ROLLBACK")
        })
        .await
    }

    async fn execute(&mut self, sql: &str) -> DriverResult<()> {
        let sql = sql.to_string();
        let (result, ended) = self
            .with_conn(move |conn| {
                // Any commit while migration text runs becomes a rollback of
                // the whole transaction.
                let in_transaction = !conn.is_autocommit();
                if in_transaction {
                    conn.commit_hook(Some(|| true));
                }
                let result = conn.execute_batch(&sql).map_err(driver_error);
                conn.commit_hook(None::<fn() -> bool>);
                Ok((result, in_transaction && conn.is_autocommit()))
            })
            .await?;

        // SQLite refuses a nested BEGIN outright; surface it the same way a
        // server warning would arrive so the runner attributes it correctly.
        if let Err(e) = &result
            && e.message.contains(NESTED_BEGIN_MESSAGE)
        {
            self.notices.push(Notice {
                code: ACTIVE_SQL_TRANSACTION.to_string(),
                severity: "ERROR".to_string(),
                message: e.message.clone(),
            });
        }
        if ended {
            self.notices.push(Notice {
                code: INVALID_TRANSACTION_TERMINATION.to_string(),
                severity: "ERROR".to_string(),
                message: TRANSACTION_ENDED_MESSAGE.to_string(),
            });
        }
        result
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    async fn interrupt(&mut self) {
        debug!("interrupting sqlite statement");
        self.interrupt.interrupt();
    }
}

#[async_trait]
impl MetadataStore for SqliteSession {
    async fn ensure_schema(&mut self) -> DriverResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
            self.table, self.identity_table
        );
        self.with_conn(move |conn| conn.execute_batch(&sql)).await
    }

    async fn schema_exists(&mut self) -> DriverResult<bool> {
        let name = self.table_name.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
        .await
    }

    async fn lock_exclusive(&mut self) -> DriverResult<()> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                return Err(rusqlite::Error::InvalidQuery);
            }
            Ok(())
        })
        .await
        .map_err(|_| DriverError::new("exclusive lock requires an open transaction"))
    }

    async fn load_all(&mut self) -> DriverResult<Vec<MetadataRecord>> {
        let sql = format!("SELECT id, hash, at FROM {} ORDER BY id", self.table);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(MetadataRecord {
                    id: row.get(0)?,
                    hash: row.get(1)?,
                    applied_at: parse_datetime(&row.get::<_, String>(2)?),
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn insert(&mut self, id: &str, hash: &str) -> DriverResult<()> {
        let sql = format!("INSERT INTO {} (id, hash) VALUES (?1, ?2)", self.table);
        let (id, hash) = (id.to_string(), hash.to_string());
        self.with_conn(move |conn| conn.execute(&sql, params![id, hash]).map(|_| ()))
            .await
    }

    async fn upsert(&mut self, id: &str, hash: &str) -> DriverResult<()> {
        let sql = format!(
            "INSERT INTO {} (id, hash) VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET
                hash = excluded.hash,
                at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            self.table
        );
        let (id, hash) = (id.to_string(), hash.to_string());
        self.with_conn(move |conn| conn.execute(&sql, params![id, hash]).map(|_| ()))
            .await
    }

    async fn application_id(&mut self) -> DriverResult<Option<String>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", self.identity_table);
        self.with_conn(move |conn| {
            conn.query_row(&sql, params![APPLICATION_ID_KEY], |row| row.get(0))
                .optional()
        })
        .await
    }

    async fn set_application_id(&mut self, application_id: &str) -> DriverResult<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            self.identity_table
        );
        let value = application_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(&sql, params![APPLICATION_ID_KEY, value])
                .map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SqliteSession {
        SqliteSession::in_memory(&BackendOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let mut s = session();
        s.ensure_schema().await.unwrap();
        s.ensure_schema().await.unwrap();
        s.begin_serializable().await.unwrap();
        assert!(s.load_all().await.unwrap().is_empty());
        s.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn schema_exists_only_after_creation() {
        let mut s = session();
        assert!(!s.schema_exists().await.unwrap());
        s.ensure_schema().await.unwrap();
        assert!(s.schema_exists().await.unwrap());
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let mut s = session();
        s.ensure_schema().await.unwrap();
        s.begin_serializable().await.unwrap();
        s.insert("0001_a.sql", "h1").await.unwrap();
        let err = s.insert("0001_a.sql", "h2").await.unwrap_err();
        assert!(err.message.contains("UNIQUE"), "unexpected error: {err}");
        s.commit().await.unwrap();

        s.begin_serializable().await.unwrap();
        let records = s.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "0001_a.sql");
        assert_eq!(records[0].hash, "h1");
        s.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_overwrites_the_hash() {
        let mut s = session();
        s.ensure_schema().await.unwrap();
        s.begin_serializable().await.unwrap();
        s.insert("0001_a.sql", "old").await.unwrap();
        s.upsert("0001_a.sql", "new").await.unwrap();
        s.upsert("0002_b.sql", "fresh").await.unwrap();

        let records = s.load_all().await.unwrap();
        assert_eq!(records[0].hash, "new");
        assert_eq!(records[1].id, "0002_b.sql");
        s.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_records() {
        let mut s = session();
        s.ensure_schema().await.unwrap();
        s.begin_serializable().await.unwrap();
        s.insert("0001_a.sql", "h").await.unwrap();
        s.rollback().await.unwrap();

        s.begin_serializable().await.unwrap();
        assert!(s.load_all().await.unwrap().is_empty());
        s.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_without_transaction_is_a_no_op() {
        let mut s = session();
        s.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn lock_requires_a_transaction() {
        let mut s = session();
        s.ensure_schema().await.unwrap();
        assert!(s.lock_exclusive().await.is_err());
        s.begin_serializable().await.unwrap();
        s.lock_exclusive().await.unwrap();
        s.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn nested_begin_is_reported_as_notice() {
        let mut s = session();
        s.begin_serializable().await.unwrap();
        let err = s.execute("BEGIN; CREATE TABLE t (x INT); COMMIT;").await;
        assert!(err.is_err());

        let notices = s.drain_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].code, ACTIVE_SQL_TRANSACTION);
        assert!(s.drain_notices().is_empty());
        s.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn commit_inside_statement_rolls_back_the_transaction() {
        let mut s = session();
        s.ensure_schema().await.unwrap();
        s.begin_serializable().await.unwrap();
        s.insert("0001_a.sql", "h").await.unwrap();
        assert!(s.execute("CREATE TABLE u (x INT); COMMIT;").await.is_err());

        let notices = s.drain_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].code, INVALID_TRANSACTION_TERMINATION);
        s.rollback().await.unwrap();

        s.begin_serializable().await.unwrap();
        assert!(s.load_all().await.unwrap().is_empty());
        s.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_inside_statement_is_reported() {
        let mut s = session();
        s.begin_serializable().await.unwrap();
        s.execute("CREATE TABLE u (x INT); ROLLBACK;").await.unwrap();
        assert_eq!(s.drain_notices()[0].code, INVALID_TRANSACTION_TERMINATION);
    }

    #[tokio::test]
    async fn ordinary_statements_keep_the_transaction() {
        let mut s = session();
        s.begin_serializable().await.unwrap();
        s.execute("CREATE TABLE u (x INT); INSERT INTO u VALUES (1);")
            .await
            .unwrap();
        assert!(s.drain_notices().is_empty());
        s.commit().await.unwrap();
    }

    #[tokio::test]
    async fn application_id_round_trip() {
        let mut s = session();
        s.ensure_schema().await.unwrap();
        s.begin_serializable().await.unwrap();
        assert_eq!(s.application_id().await.unwrap(), None);
        s.set_application_id("billing").await.unwrap();
        assert_eq!(s.application_id().await.unwrap().as_deref(), Some("billing"));
        s.commit().await.unwrap();
    }

    #[test]
    fn parses_both_timestamp_shapes() {
        let iso = parse_datetime("2024-03-01T10:20:30.123Z");
        assert_eq!(iso.to_rfc3339(), "2024-03-01T10:20:30.123+00:00");
        let plain = parse_datetime("2024-03-01 10:20:30");
        assert_eq!(plain.to_rfc3339(), "2024-03-01T10:20:30+00:00");
    }
}
