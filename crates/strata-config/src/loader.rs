use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// File names looked up, in order, when no explicit path is given.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["strata.yml", "strata.yaml", "strata.toml"];

/// Optional file in the migrations directory holding the application id.
pub const APP_ID_FILE: &str = "__APP_ID__.txt";

/// Loads `AppConfig` from a file, then layers `STRATA_*` environment
/// variables on top.
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
    search_dir: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Look for a config file in the working directory.
    pub fn new() -> Self {
        Self::in_dir(".")
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            explicit: None,
            search_dir: dir.into(),
        }
    }

    /// Load exactly this file; a missing file is an error.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
            search_dir: PathBuf::from("."),
        }
    }

    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match self.config_path() {
            Some(path) => {
                info!("loading config from {}", path.display());
                load_file(&path)?
            }
            None => {
                debug!("no config file found, using defaults");
                AppConfig::default()
            }
        };
        apply_env(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            return Some(path.clone());
        }
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.search_dir.join(name))
            .find(|p| p.is_file())
    }
}

fn load_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

/// Override file values with `STRATA_*` variables read through `var`.
pub fn apply_env(config: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("STRATA_DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(dir) = var("STRATA_DIR") {
        config.migrations.dir = PathBuf::from(dir);
    }
    if let Some(schema) = var("STRATA_SCHEMA") {
        config.migrations.schema = schema;
    }
    if let Some(table) = var("STRATA_TABLE") {
        config.migrations.table = table;
    }
    if let Some(id) = var("STRATA_APPLICATION_ID") {
        config.migrations.application_id = Some(id);
    }
    if let Some(dry_run) = var("STRATA_DRY_RUN") {
        config.dry_run = parse_bool(&dry_run);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Fill in the application id from `__APP_ID__.txt` in the migrations
/// directory when the configuration does not set one.
pub fn resolve_application_id(config: &mut AppConfig) -> Result<()> {
    if config.migrations.application_id.is_some() {
        return Ok(());
    }
    let path = config.migrations.dir.join(APP_ID_FILE);
    if !path.is_file() {
        return Ok(());
    }
    let id = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    debug!("application id read from {}", path.display());
    config.migrations.application_id = Some(id.trim().to_string());
    Ok(())
}
