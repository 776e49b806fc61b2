use std::path::Path;
use std::time::Duration;

use strata_common::{Error, Result};

use crate::postgres::PgSession;
use crate::session::MetadataStore;
use crate::sqlite::SqliteSession;

pub const DEFAULT_SCHEMA: &str = "strata";
pub const DEFAULT_TABLE: &str = "migrations";
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the metadata lives and how long to wait for locks.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// PostgreSQL schema. SQLite has none and prefixes the table name with
    /// it instead (`strata_migrations`).
    pub schema: String,
    pub table: String,
    /// How long a SQLite runner waits for another one to release the lock.
    pub busy_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_TABLE.to_string(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Sqlite,
}

impl BackendKind {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            BackendKind::Postgres
        } else {
            BackendKind::Sqlite
        }
    }
}

/// Open a session for `url`: `postgres://…` / `postgresql://…` for
/// PostgreSQL, otherwise a SQLite path (optionally prefixed `sqlite:`), or
/// `:memory:`.
pub async fn connect(url: &str, options: &BackendOptions) -> Result<Box<dyn MetadataStore>> {
    if url.is_empty() {
        return Err(Error::InvalidConfig("database url cannot be empty".into()));
    }

    match BackendKind::from_url(url) {
        BackendKind::Postgres => {
            let session = PgSession::connect(url, options)
                .await
                .map_err(Error::Connection)?;
            Ok(Box::new(session))
        }
        BackendKind::Sqlite => {
            let path = url
                .strip_prefix("sqlite://")
                .or_else(|| url.strip_prefix("sqlite:"))
                .unwrap_or(url);
            let session = if path == ":memory:" {
                SqliteSession::in_memory(options)
            } else {
                SqliteSession::open(Path::new(path), options)
            }
            .map_err(Error::Connection)?;
            Ok(Box::new(session))
        }
    }
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
