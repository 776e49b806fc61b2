pub mod backend;
pub mod catalog;
pub mod detector;
pub mod normalize;
pub mod postgres;
pub mod runner;
pub mod session;
pub mod source;
pub mod sqlite;

pub use backend::{BackendKind, BackendOptions, connect};
pub use catalog::{Catalog, Entry, Item};
pub use detector::NestedTxnDetector;
pub use normalize::{content_hash, normalize};
pub use runner::{Migrator, RunOptions, RunState};
pub use session::{MetadataRecord, MetadataStore, Notice, Session};
pub use source::{DirSource, MigrationSource, RawMigration, StaticSource};

use strata_common::Result;
use tokio_util::sync::CancellationToken;

/// Build a catalog from `source`, connect to `url` and run every pending
/// migration with default options.
pub async fn migrate(
    source: &dyn MigrationSource,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let migrator = Migrator::new(Catalog::build(source)?, RunOptions::default())?;
    let mut session = connect(url, &BackendOptions::default()).await?;
    migrator.run(session.as_mut(), cancel).await
}
