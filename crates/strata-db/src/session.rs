use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_common::DriverError;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// SQLSTATE raised when `BEGIN` is issued inside an open transaction.
pub const ACTIVE_SQL_TRANSACTION: &str = "25001";

/// SQLSTATE used when a statement ended the enclosing transaction with its
/// own `COMMIT` or `ROLLBACK`.
pub const INVALID_TRANSACTION_TERMINATION: &str = "2D000";

/// An informational message the server sent alongside a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub code: String,
    pub severity: String,
    pub message: String,
}

/// A persisted record of one applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataRecord {
    pub id: String,
    pub hash: String,
    pub applied_at: DateTime<Utc>,
}

/// One dedicated database session.
#[async_trait]
pub trait Session: Send {
    /// Begin a transaction at serializable isolation.
    async fn begin_serializable(&mut self) -> DriverResult<()>;

    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;

    /// Execute raw SQL text, which may hold several statements.
    ///
    /// If the text ends the transaction opened by
    /// [`begin_serializable`](Session::begin_serializable), the session
    /// queues a notice with code [`INVALID_TRANSACTION_TERMINATION`].
    async fn execute(&mut self, sql: &str) -> DriverResult<()>;

    /// Take every notice received since the previous call.
    fn drain_notices(&mut self) -> Vec<Notice>;

    /// Best-effort abort of whatever statement is currently running.
    async fn interrupt(&mut self) {}
}

/// The migration bookkeeping table, reached through a [`Session`].
#[async_trait]
pub trait MetadataStore: Session {
    /// Create the metadata tables if they do not exist. Safe to race.
    async fn ensure_schema(&mut self) -> DriverResult<()>;

    /// Whether the metadata table has been created. Creates nothing.
    async fn schema_exists(&mut self) -> DriverResult<bool>;

    /// Block every other reader and writer of the metadata table until the
    /// current transaction ends.
    async fn lock_exclusive(&mut self) -> DriverResult<()>;

    async fn load_all(&mut self) -> DriverResult<Vec<MetadataRecord>>;

    /// Append a record; fails if `id` is already recorded.
    async fn insert(&mut self, id: &str, hash: &str) -> DriverResult<()>;

    /// Write or overwrite a record without running anything.
    async fn upsert(&mut self, id: &str, hash: &str) -> DriverResult<()>;

    async fn application_id(&mut self) -> DriverResult<Option<String>>;

    async fn set_application_id(&mut self, application_id: &str) -> DriverResult<()>;
}
