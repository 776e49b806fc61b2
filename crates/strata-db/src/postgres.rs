use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use strata_common::DriverError;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendOptions, quote_ident};
use crate::session::{
    DriverResult, INVALID_TRANSACTION_TERMINATION, MetadataRecord, MetadataStore, Notice, Session,
};

const APPLICATION_ID_KEY: &str = "application_id";

const CURRENT_XACT: &str = "SELECT txid_current()";

/// A PostgreSQL database as a migration target.
///
/// Server notices are forwarded from the connection task over a channel and
/// picked up synchronously with [`Session::drain_notices`].
///
/// PostgreSQL cannot refuse a `COMMIT` issued by migration text. The session
/// remembers the id of the transaction it opened and, after each statement,
/// reports a notice when the id has changed. Work the stray `COMMIT` made
/// durable stays committed.
pub struct PgSession {
    client: Client,
    notices: mpsc::UnboundedReceiver<Notice>,
    own_notices: mpsc::UnboundedSender<Notice>,
    xact: Option<i64>,
    schema_name: String,
    table_name: String,
    schema: String,
    table: String,
    identity_table: String,
}

impl PgSession {
    pub async fn connect(url: &str, options: &BackendOptions) -> DriverResult<Self> {
        let (client, mut connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(pg_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let own_notices = tx.clone();
        tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notice(notice)) => {
                        let _ = tx.send(Notice {
                            code: notice.code().code().to_string(),
                            severity: notice.severity().to_string(),
                            message: notice.message().to_string(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("postgres connection error: {e}");
                        break;
                    }
                }
            }
            debug!("postgres connection closed");
        });

        info!("connected to postgres");
        let schema = quote_ident(&options.schema);
        Ok(Self {
            client,
            notices: rx,
            own_notices,
            xact: None,
            schema_name: options.schema.clone(),
            table_name: options.table.clone(),
            table: format!("{schema}.{}", quote_ident(&options.table)),
            identity_table: format!(
                "{schema}.{}",
                quote_ident(&format!("{}_identity", options.table))
            ),
            schema,
        })
    }

    /// Queue a notice if the transaction opened by `begin_serializable` is
    /// no longer the one the session is in. A failing lookup means the
    /// transaction is aborted but still open.
    async fn check_transaction(&mut self) {
        let Some(expected) = self.xact else { return };
        match current_xact(&self.client).await {
            Ok(current) if current != expected => {
                warn!("transaction {expected} ended inside a migration, now in {current}");
                self.xact = None;
                let _ = self.own_notices.send(Notice {
                    code: INVALID_TRANSACTION_TERMINATION.to_string(),
                    severity: "ERROR".to_string(),
                    message: "statement ended the enclosing transaction".to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => debug!("transaction id lookup failed: {e}"),
        }
    }
}

async fn current_xact(client: &Client) -> Result<i64, tokio_postgres::Error> {
    client.query_one(CURRENT_XACT, &[]).await?.try_get(0)
}

/// Run one DDL statement, treating "someone else created it first" as
/// success.
async fn create_if_missing(client: &Client, sql: &str) -> DriverResult<()> {
    match client.batch_execute(sql).await {
        Ok(()) => Ok(()),
        Err(e) if is_creation_race(&e) => {
            debug!("concurrent creation ignored: {e}");
            Ok(())
        }
        Err(e) => Err(pg_error(e)),
    }
}

fn is_creation_race(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(code) if *code == SqlState::UNIQUE_VIOLATION
            || *code == SqlState::DUPLICATE_SCHEMA
            || *code == SqlState::DUPLICATE_TABLE
            || *code == SqlState::DUPLICATE_OBJECT
    )
}

fn pg_error(e: tokio_postgres::Error) -> DriverError {
    match e.as_db_error() {
        Some(db) => DriverError::with_code(db.message(), db.code().code()),
        None => DriverError::new(e.to_string()),
    }
}

#[async_trait]
impl Session for PgSession {
    async fn begin_serializable(&mut self) -> DriverResult<()> {
        self.client
            .batch_execute("BEGIN ISOLATION LEVEL SERIALIZABLE")
            .await
            .map_err(pg_error)?;
        self.xact = Some(current_xact(&self.client).await.map_err(pg_error)?);
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.xact = None;
        self.client.batch_execute("COMMIT").await.map_err(pg_error)
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.xact = None;
        self.client.batch_execute("ROLLBACK").await.map_err(pg_error)
    }

    async fn execute(&mut self, sql: &str) -> DriverResult<()> {
        let result = self.client.batch_execute(sql).await.map_err(pg_error);
        self.check_transaction().await;
        result
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        let mut drained = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            drained.push(notice);
        }
        drained
    }

    async fn interrupt(&mut self) {
        if let Err(e) = self.client.cancel_token().cancel_query(NoTls).await {
            warn!("failed to cancel running query: {e}");
        }
    }
}

#[async_trait]
impl MetadataStore for PgSession {
    async fn ensure_schema(&mut self) -> DriverResult<()> {
        create_if_missing(
            &self.client,
            &format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
        )
        .await?;
        create_if_missing(
            &self.client,
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id text PRIMARY KEY,
                    hash text NOT NULL,
                    at timestamptz NOT NULL DEFAULT now()
                )",
                self.table
            ),
        )
        .await?;
        create_if_missing(
            &self.client,
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key text PRIMARY KEY,
                    value text NOT NULL
                )",
                self.identity_table
            ),
        )
        .await
    }

    async fn schema_exists(&mut self) -> DriverResult<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables
                                WHERE schemaname = $1 AND tablename = $2)",
                &[&self.schema_name, &self.table_name],
            )
            .await
            .map_err(pg_error)?;
        row.try_get(0).map_err(pg_error)
    }

    async fn lock_exclusive(&mut self) -> DriverResult<()> {
        self.client
            .batch_execute(&format!(
                "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
                self.table
            ))
            .await
            .map_err(pg_error)
    }

    async fn load_all(&mut self) -> DriverResult<Vec<MetadataRecord>> {
        let rows = self
            .client
            .query(
                &format!("SELECT id, hash, at FROM {} ORDER BY id", self.table),
                &[],
            )
            .await
            .map_err(pg_error)?;

        rows.iter()
            .map(|row| {
                Ok(MetadataRecord {
                    id: row.try_get("id").map_err(pg_error)?,
                    hash: row.try_get("hash").map_err(pg_error)?,
                    applied_at: row.try_get::<_, DateTime<Utc>>("at").map_err(pg_error)?,
                })
            })
            .collect()
    }

    async fn insert(&mut self, id: &str, hash: &str) -> DriverResult<()> {
        self.client
            .execute(
                &format!("INSERT INTO {} (id, hash) VALUES ($1, $2)", self.table),
                &[&id, &hash],
            )
            .await
            .map(|_| ())
            .map_err(pg_error)
    }

    async fn upsert(&mut self, id: &str, hash: &str) -> DriverResult<()> {
        self.client
            .execute(
                &format!(
                    "INSERT INTO {} (id, hash) VALUES ($1, $2)
                     ON CONFLICT (id) DO UPDATE SET hash = excluded.hash, at = now()",
                    self.table
                ),
                &[&id, &hash],
            )
            .await
            .map(|_| ())
            .map_err(pg_error)
    }

    async fn application_id(&mut self) -> DriverResult<Option<String>> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT value FROM {} WHERE key = $1", self.identity_table),
                &[&APPLICATION_ID_KEY],
            )
            .await
            .map_err(pg_error)?;
        row.map(|r| r.try_get(0).map_err(pg_error)).transpose()
    }

    async fn set_application_id(&mut self, application_id: &str) -> DriverResult<()> {
        self.client
            .execute(
                &format!(
                    "INSERT INTO {} (key, value) VALUES ($1, $2)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                    self.identity_table
                ),
                &[&APPLICATION_ID_KEY, &application_id],
            )
            .await
            .map(|_| ())
            .map_err(pg_error)
    }
}
