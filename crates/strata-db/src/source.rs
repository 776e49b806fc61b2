use std::fs;
use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::debug;

/// Extension a file must carry to be picked up from a directory.
pub const SQL_EXTENSION: &str = "sql";

/// One migration as found in a source, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMigration {
    pub name: String,
    pub sql: String,
    /// Set when the source found a group (e.g. a sub-directory) under this
    /// name instead of a single statement body.
    pub is_group: bool,
}

impl RawMigration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            is_group: false,
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: String::new(),
            is_group: true,
        }
    }
}

/// Somewhere migrations come from.
pub trait MigrationSource {
    fn load(&self) -> Result<Vec<RawMigration>>;
}

/// Reads every `*.sql` file in a single directory.
///
/// Other regular files are ignored. Sub-directories are reported as groups
/// so that catalog construction rejects them.
pub struct DirSource {
    dir: PathBuf,
}

impl DirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MigrationSource for DirSource {
    fn load(&self) -> Result<Vec<RawMigration>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::Discovery(format!(
                "cannot read migration directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if entry.file_type()?.is_dir() {
                found.push(RawMigration::group(name));
                continue;
            }
            if path.extension().is_none_or(|ext| ext != SQL_EXTENSION) {
                debug!("skipping non-migration file {}", path.display());
                continue;
            }

            let sql = fs::read_to_string(&path).map_err(|e| {
                Error::Discovery(format!("cannot read {}: {e}", path.display()))
            })?;
            found.push(RawMigration::new(name, sql));
        }
        Ok(found)
    }
}

/// Migrations held in memory, typically embedded with `include_str!`.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    migrations: Vec<RawMigration>,
}

impl StaticSource {
    pub fn new<I, N, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        Self {
            migrations: pairs
                .into_iter()
                .map(|(name, sql)| RawMigration::new(name, sql))
                .collect(),
        }
    }

    pub fn push(&mut self, migration: RawMigration) {
        self.migrations.push(migration);
    }
}

impl MigrationSource for StaticSource {
    fn load(&self) -> Result<Vec<RawMigration>> {
        Ok(self.migrations.clone())
    }
}
