//! The migration runner.
//!
//! A run takes one serializable transaction on a dedicated session, locks the
//! metadata table exclusively, verifies every recorded migration against the
//! catalog, then applies the pending ones in catalog order and records each
//! as it succeeds. Everything commits together or nothing does. The table
//! lock is the only thing keeping concurrent runners apart: a second runner
//! waits at the lock and re-reads the metadata once the first is done.

use std::collections::HashSet;
use std::fmt;

use strata_common::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Entry};
use crate::detector::NestedTxnDetector;
use crate::session::{MetadataRecord, MetadataStore};

/// Race a session call against cancellation. When the token fires first the
/// session is interrupted and the enclosing function returns
/// `Error::Cancelled`.
macro_rules! or_cancel {
    ($cancel:expr, $session:expr, $call:expr) => {{
        let outcome = tokio::select! {
            biased;
            _ = $cancel.cancelled() => None,
            res = $call => Some(res),
        };
        match outcome {
            Some(res) => res,
            None => {
                $session.interrupt().await;
                return Err(Error::Cancelled);
            }
        }
    }};
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Execute everything, then roll back instead of committing.
    pub dry_run: bool,
    /// When set, the database must carry this application id (it is
    /// recorded on first use).
    pub application_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Locking,
    Verifying,
    Applying,
    Committed,
    RolledBack,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Locking => "locking",
            RunState::Verifying => "verifying",
            RunState::Applying => "applying",
            RunState::Committed => "committed",
            RunState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

struct Progress {
    state: RunState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!("run state {} -> {}", self.state, next);
        self.state = next;
    }
}

pub struct Migrator {
    catalog: Catalog,
    options: RunOptions,
}

impl Migrator {
    pub fn new(catalog: Catalog, options: RunOptions) -> Result<Self> {
        if options.application_id.as_deref().is_some_and(str::is_empty) {
            return Err(Error::InvalidConfig(
                "application id cannot be an empty string".into(),
            ));
        }
        Ok(Self { catalog, options })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Entries that a run would apply right now. Takes the same lock as a
    /// run and always rolls back. Writes nothing: on a database that has
    /// never been migrated every entry is pending.
    pub async fn check<S>(&self, session: &mut S, cancel: &CancellationToken) -> Result<Vec<&Entry>>
    where
        S: MetadataStore + ?Sized,
    {
        let exists =
            or_cancel!(cancel, session, session.schema_exists()).map_err(Error::Metadata)?;
        if !exists {
            info!(
                "no metadata table yet, {} migration(s) pending",
                self.catalog.len()
            );
            return Ok(self.catalog.entries().iter().collect());
        }

        let mut progress = Progress::new();
        let pending = self.lock_and_verify(session, cancel, &mut progress).await;
        finish(session, pending, false, &mut progress).await
    }

    /// Apply every pending entry and return their ids in the order they ran.
    pub async fn run<S>(&self, session: &mut S, cancel: &CancellationToken) -> Result<Vec<String>>
    where
        S: MetadataStore + ?Sized,
    {
        let mut progress = Progress::new();
        ensure_schema(session, cancel).await?;
        let applied = self.apply(session, cancel, &mut progress).await;
        let applied = finish(session, applied, !self.options.dry_run, &mut progress).await?;

        if self.options.dry_run {
            info!(
                "dry run finished: {} migration(s) executed and rolled back",
                applied.len()
            );
        } else if applied.is_empty() {
            info!("database is up to date");
        } else {
            info!("{} migration(s) committed", applied.len());
        }
        Ok(applied)
    }

    /// Record `id` as applied without running its statement. Meant for
    /// manual repair only.
    pub async fn mark_applied<S>(
        &self,
        session: &mut S,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: MetadataStore + ?Sized,
    {
        let entry = self
            .catalog
            .get(id)
            .ok_or_else(|| Error::InvalidConfig(format!("migration \"{id}\" not found")))?;

        let mut progress = Progress::new();
        ensure_schema(session, cancel).await?;
        let marked = self.mark(session, entry, cancel, &mut progress).await;
        finish(session, marked, !self.options.dry_run, &mut progress).await?;
        if self.options.dry_run {
            info!("dry run: {} would be marked as applied, nothing written", entry.id());
        } else {
            warn!("marked {} as applied without executing it", entry.id());
        }
        Ok(())
    }

    async fn lock_and_verify<'a, S>(
        &'a self,
        session: &mut S,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<Vec<&'a Entry>>
    where
        S: MetadataStore + ?Sized,
    {
        self.lock(session, cancel, progress).await?;

        let records = or_cancel!(cancel, session, session.load_all()).map_err(Error::Metadata)?;
        let applied = verify_records(&self.catalog, &records)?;

        let pending: Vec<&Entry> = self
            .catalog
            .entries()
            .iter()
            .filter(|e| !applied.contains(e.id()))
            .collect();
        info!(
            "{} applied, {} pending of {} migration(s)",
            records.len(),
            pending.len(),
            self.catalog.len()
        );
        Ok(pending)
    }

    /// Begin, take the table lock and check the application id.
    async fn lock<S>(
        &self,
        session: &mut S,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<()>
    where
        S: MetadataStore + ?Sized,
    {
        progress.enter(RunState::Locking);
        or_cancel!(cancel, session, session.begin_serializable()).map_err(Error::Connection)?;
        or_cancel!(cancel, session, session.lock_exclusive()).map_err(Error::Connection)?;

        progress.enter(RunState::Verifying);
        if let Some(expected) = self.options.application_id.as_deref() {
            let stored =
                or_cancel!(cancel, session, session.application_id()).map_err(Error::Metadata)?;
            match stored {
                None => {
                    info!("recording application id \"{expected}\"");
                    or_cancel!(cancel, session, session.set_application_id(expected))
                        .map_err(Error::Metadata)?;
                }
                Some(found) if found != expected => {
                    return Err(Error::ApplicationIdentity {
                        expected: expected.to_string(),
                        found,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn apply<S>(
        &self,
        session: &mut S,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<Vec<String>>
    where
        S: MetadataStore + ?Sized,
    {
        let pending = self.lock_and_verify(session, cancel, progress).await?;
        progress.enter(RunState::Applying);

        let mut detector = NestedTxnDetector::new();
        let mut applied = Vec::with_capacity(pending.len());
        for entry in pending {
            detector.reset(session);
            debug!("executing {}", entry.id());
            let executed = or_cancel!(cancel, session, session.execute(entry.statement()));
            detector.observe(session);

            // The diagnostic may arrive with or without a failed statement;
            // either way it is what the author needs to fix.
            if let Some(notice) = detector.offending_notice() {
                return Err(Error::NestedTransaction {
                    id: entry.id().to_string(),
                    message: notice.message.clone(),
                });
            }
            executed.map_err(|source| Error::Execution {
                id: entry.id().to_string(),
                source,
            })?;

            or_cancel!(
                cancel,
                session,
                session.insert(entry.id(), entry.content_hash())
            )
            .map_err(Error::Metadata)?;
            info!("applied {}", entry.id());
            applied.push(entry.id().to_string());
        }
        Ok(applied)
    }

    async fn mark<S>(
        &self,
        session: &mut S,
        entry: &Entry,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<()>
    where
        S: MetadataStore + ?Sized,
    {
        self.lock(session, cancel, progress).await?;
        or_cancel!(
            cancel,
            session,
            session.upsert(entry.id(), entry.content_hash())
        )
        .map_err(Error::Metadata)
    }
}

async fn ensure_schema<S>(session: &mut S, cancel: &CancellationToken) -> Result<()>
where
    S: MetadataStore + ?Sized,
{
    or_cancel!(cancel, session, session.ensure_schema()).map_err(Error::Metadata)
}

/// End the transaction: commit when asked to and everything succeeded,
/// roll back on every other path.
async fn finish<S, T>(
    session: &mut S,
    outcome: Result<T>,
    commit: bool,
    progress: &mut Progress,
) -> Result<T>
where
    S: MetadataStore + ?Sized,
{
    match outcome {
        Ok(value) if commit => match session.commit().await {
            Ok(()) => {
                progress.enter(RunState::Committed);
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = session.rollback().await {
                    debug!("rollback after failed commit: {rb}");
                }
                progress.enter(RunState::RolledBack);
                Err(Error::Connection(e))
            }
        },
        Ok(value) => {
            session.rollback().await.map_err(Error::Connection)?;
            progress.enter(RunState::RolledBack);
            Ok(value)
        }
        Err(err) => {
            warn!("rolling back: {err}");
            if let Err(rb) = session.rollback().await {
                warn!("rollback failed: {rb}");
            }
            progress.enter(RunState::RolledBack);
            Err(err)
        }
    }
}

/// Check every record against the catalog and return the applied ids.
pub fn verify_records<'a>(
    catalog: &Catalog,
    records: &'a [MetadataRecord],
) -> Result<HashSet<&'a str>> {
    let mut applied = HashSet::with_capacity(records.len());
    for record in records {
        let Some(entry) = catalog.get(&record.id) else {
            return Err(Error::Consistency {
                id: record.id.clone(),
            });
        };
        if entry.content_hash() != record.hash {
            return Err(Error::Drift {
                id: record.id.clone(),
                computed_hash: entry.content_hash().to_string(),
                stored_hash: record.hash.clone(),
            });
        }
        applied.insert(record.id.as_str());
    }
    Ok(applied)
}
