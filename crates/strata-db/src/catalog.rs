use std::collections::HashMap;

use strata_common::{Error, Result};
use tracing::debug;

use crate::normalize::content_hash;
use crate::source::{MigrationSource, RawMigration, StaticSource};

/// One migration: a stable identifier and the SQL it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    id: String,
    statement: String,
    content_hash: String,
}

impl Entry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

/// Identifier and hash of an entry, for listings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Item {
    pub id: String,
    pub hash: String,
}

/// The sorted, immutable set of migrations known for a run.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Discover migrations from `source`, validate them and fix their order.
    pub fn build(source: &dyn MigrationSource) -> Result<Self> {
        Self::from_raw(source.load()?)
    }

    pub fn from_pairs<I, N, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        Self::build(&StaticSource::new(pairs))
    }

    fn from_raw(raw: Vec<RawMigration>) -> Result<Self> {
        let mut entries = Vec::with_capacity(raw.len());
        for migration in raw {
            validate_name(&migration)?;
            entries.push(Entry {
                content_hash: content_hash(&migration.sql),
                id: migration.name,
                statement: migration.sql,
            });
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if index.insert(entry.id.clone(), i).is_some() {
                return Err(Error::Discovery(format!(
                    "duplicate migration id \"{}\"",
                    entry.id
                )));
            }
        }

        debug!("catalog built with {} entries", entries.len());
        Ok(Self { entries, index })
    }

    /// Entries in execution order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn items(&self) -> Vec<Item> {
        self.entries
            .iter()
            .map(|e| Item {
                id: e.id.clone(),
                hash: e.content_hash.clone(),
            })
            .collect()
    }
}

fn validate_name(migration: &RawMigration) -> Result<()> {
    let name = &migration.name;
    if migration.is_group {
        return Err(Error::Discovery(format!(
            "\"{name}\" is a group; migrations cannot be nested"
        )));
    }
    if name.is_empty() {
        return Err(Error::Discovery("migration id cannot be empty".into()));
    }
    if name.contains(['/', '\\']) {
        return Err(Error::Discovery(format!(
            "migration id \"{name}\" cannot contain a path separator"
        )));
    }
    if name.to_lowercase() != *name {
        return Err(Error::Discovery(format!(
            "migration id \"{name}\" must be lowercase"
        )));
    }
    Ok(())
}
