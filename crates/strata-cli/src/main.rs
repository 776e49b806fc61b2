mod commands;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Apply SQL migrations exactly once")]
pub struct Cli {
    /// Config file (default: strata.yml, strata.yaml or strata.toml in the working directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL; overrides the config file and STRATA_DATABASE_URL
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Directory containing the *.sql migrations
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// More output (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply every pending migration
    Up {
        /// Execute pending migrations, then roll back instead of committing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show which migrations are pending
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List every migration with its content hash
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the content hash of a SQL file
    Hash {
        file: PathBuf,
        /// Also print the canonical text that is hashed
        #[arg(long)]
        normalized: bool,
    },
    /// Record a migration as applied without running it (manual repair)
    MarkApplied { id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel the run on Ctrl+C; the runner rolls back on its own.
fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if res.is_ok() {
                    warn!("interrupt received, rolling back");
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {}
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let result = commands::dispatch(&cli, &cancel).await;
    cancel.cancel();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report::print_error(&e);
            ExitCode::from(report::exit_code(&e))
        }
    }
}
