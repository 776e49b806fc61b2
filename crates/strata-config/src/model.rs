use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    /// Execute pending migrations, then roll back.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `postgres://…`, `sqlite:path`, a plain SQLite path or `:memory:`.
    pub url: String,
    /// How long a SQLite runner waits for a concurrent one to finish.
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            busy_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub dir: PathBuf,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            schema: "strata".to_string(),
            table: "migrations".to_string(),
            application_id: None,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(Error::Config(
                "database url is required (database.url or STRATA_DATABASE_URL)".into(),
            ));
        }
        for (what, value) in [
            ("migrations.schema", &self.migrations.schema),
            ("migrations.table", &self.migrations.table),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{what} cannot be empty")));
            }
        }
        if self
            .migrations
            .application_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(Error::Config("application id cannot be empty".into()));
        }
        Ok(())
    }
}
