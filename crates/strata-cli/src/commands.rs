use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use strata_config::{AppConfig, ConfigLoader, resolve_application_id};
use strata_db::{
    BackendOptions, Catalog, DirSource, MetadataStore, Migrator, RunOptions, connect,
    content_hash, normalize,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Cli, Command, report};

pub async fn dispatch(cli: &Cli, cancel: &CancellationToken) -> Result<()> {
    match &cli.command {
        Command::Hash { file, normalized } => hash_file(file, *normalized),
        Command::List { json } => {
            let config = load_config(cli)?;
            list(&load_catalog(&config)?, *json)
        }
        Command::Up { dry_run } => {
            let mut config = load_config(cli)?;
            config.dry_run |= *dry_run;
            up(&config, cli.verbose > 0, cancel).await
        }
        Command::Status { json } => status(&load_config(cli)?, *json, cancel).await,
        Command::MarkApplied { id } => mark_applied(&load_config(cli)?, id, cancel).await,
    }
}

/// Config file, then environment, then command-line flags.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }
    if let Some(dir) = &cli.dir {
        config.migrations.dir = dir.clone();
    }
    resolve_application_id(&mut config)?;
    Ok(config)
}

fn load_catalog(config: &AppConfig) -> Result<Catalog> {
    let catalog = Catalog::build(&DirSource::new(&config.migrations.dir))?;
    info!(
        "{} migration(s) found in {}",
        catalog.len(),
        config.migrations.dir.display()
    );
    Ok(catalog)
}

fn backend_options(config: &AppConfig) -> BackendOptions {
    BackendOptions {
        schema: config.migrations.schema.clone(),
        table: config.migrations.table.clone(),
        busy_timeout: Duration::from_secs(config.database.busy_timeout_secs),
    }
}

async fn prepare(config: &AppConfig) -> Result<(Migrator, Box<dyn MetadataStore>)> {
    config.validate()?;
    let migrator = Migrator::new(
        load_catalog(config)?,
        RunOptions {
            dry_run: config.dry_run,
            application_id: config.migrations.application_id.clone(),
        },
    )?;
    let session = connect(&config.database.url, &backend_options(config)).await?;
    Ok((migrator, session))
}

async fn up(config: &AppConfig, verbose: bool, cancel: &CancellationToken) -> Result<()> {
    let (migrator, mut session) = prepare(config).await?;
    let applied = match migrator.run(session.as_mut(), cancel).await {
        Ok(applied) => applied,
        Err(e) => {
            if verbose {
                report::print_drift_detail(&e, migrator.catalog());
            }
            return Err(e.into());
        }
    };

    for id in &applied {
        println!("applied {id}");
    }
    if applied.is_empty() {
        println!("Nothing to apply");
    }
    if config.dry_run {
        println!("Migration complete, but not committed because of dry run");
    } else {
        println!("Migration complete");
    }
    Ok(())
}

async fn status(config: &AppConfig, as_json: bool, cancel: &CancellationToken) -> Result<()> {
    let (migrator, mut session) = prepare(config).await?;
    let pending: Vec<&str> = migrator
        .check(session.as_mut(), cancel)
        .await?
        .into_iter()
        .map(|e| e.id())
        .collect();

    if as_json {
        let out = json!({
            "total": migrator.catalog().len(),
            "pending": pending,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if pending.is_empty() {
        println!("Up to date ({} applied)", migrator.catalog().len());
    } else {
        println!("{} pending:", pending.len());
        for id in pending {
            println!("  {id}");
        }
    }
    Ok(())
}

fn list(catalog: &Catalog, as_json: bool) -> Result<()> {
    let items = catalog.items();
    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    for item in items {
        println!("{}  {}", item.hash, item.id);
    }
    Ok(())
}

fn hash_file(path: &Path, show_normalized: bool) -> Result<()> {
    let sql = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    println!("{}", content_hash(&sql));
    if show_normalized {
        println!();
        println!("{}", normalize(&sql));
    }
    Ok(())
}

async fn mark_applied(config: &AppConfig, id: &str, cancel: &CancellationToken) -> Result<()> {
    let (migrator, mut session) = prepare(config).await?;
    migrator.mark_applied(session.as_mut(), id, cancel).await?;
    if config.dry_run {
        println!("{id} would be marked as applied (dry run, nothing written)");
    } else {
        println!("{id} marked as applied");
    }
    Ok(())
}
