use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use statroll::config::Config;
use statroll::migrate::{Migrator, SqliteMigrator};
use statroll::sql::manager::{AggregationManager, AggregationOptions};

/// SQL statistics rollup engine.
#[derive(Parser)]
#[command(name = "statroll", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregation scheduler until interrupted.
    Run,

    /// Run a single aggregation pass and exit.
    Aggregate,

    /// Manage the database schema.
    Migrate {
        #[command(subcommand)]
        direction: MigrateCommand,
    },

    /// Print version information and exit.
    Version,
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Show the current schema version.
    Status,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("statroll {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Every remaining subcommand needs config and a database.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting statroll",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        let pool = connect(&cfg).await?;

        match cli.command {
            Some(Command::Aggregate) => aggregate_once(pool, &cfg).await,
            Some(Command::Migrate { direction }) => migrate(pool, direction).await,
            Some(Command::Run) | None => run(pool, cfg).await,
            Some(Command::Version) => unreachable!("handled above"),
        }
    })
}

async fn connect(cfg: &Config) -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await
        .with_context(|| format!("connecting to {}", cfg.database.url))
}

async fn migrate(pool: SqlitePool, direction: MigrateCommand) -> Result<()> {
    let migrator = SqliteMigrator::new(pool);

    match direction {
        MigrateCommand::Up => migrator.up().await,
        MigrateCommand::Down => migrator.down().await,
        MigrateCommand::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version} dirty: {dirty}");
            Ok(())
        }
    }
}

async fn aggregate_once(pool: SqlitePool, cfg: &Config) -> Result<()> {
    SqliteMigrator::new(pool.clone()).up().await?;

    let manager = AggregationManager::new(pool, AggregationOptions::from_config(&cfg.aggregation));
    manager.aggregate().await?;

    Ok(())
}

async fn run(pool: SqlitePool, cfg: Config) -> Result<()> {
    SqliteMigrator::new(pool.clone()).up().await?;

    // Set up signal handling.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        signal_token.cancel();
    });

    let manager = AggregationManager::new(pool, AggregationOptions::from_config(&cfg.aggregation));

    tracing::info!(
        interval = ?cfg.aggregation.interval,
        "aggregation scheduler started",
    );

    let mut ticker = tokio::time::interval(cfg.aggregation.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = manager.aggregate().await {
                    tracing::error!(error = ?err, "aggregation pass failed");
                }
            }
            _ = shutdown.cancelled() => {
                break;
            }
        }
    }

    tracing::info!("statroll stopped");

    Ok(())
}
