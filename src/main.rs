use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flamestore::config::{Config, StoreBackendKind};
use flamestore::engine::Engine;
use flamestore::export::ClickHouseConnection;
use flamestore::ingest::{decode_body, stack_rows};
use flamestore::migrate::{ClickHouseMigrator, Migrator};
use flamestore::query::flamegraph::FlameGraph;
use flamestore::stack::decode::{IdleFilter, StackDecoder};
use flamestore::stack::normalize::ReloadableRules;

/// Profiling artifact ingestion and flame graph query service.
#[derive(Parser)]
#[command(name = "flamestore", about)]
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
    /// Print version information and exit.
    Version,
    /// Decode an artifact file and print its stacks in collapsed format.
    Collapse {
        /// Artifact file, plain or gzip-compressed.
        file: PathBuf,
    },
    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply pending migrations.
    Up,
    /// Roll back the last migration.
    Down,
    /// Print the current schema version.
    Status,
}

/// Build-time version info, injected via build.rs.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, or "unknown".
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("flamestore {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    // Logs go to stderr so `collapse` output stays clean.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Some(Command::Collapse { file }) => return collapse(&cfg, &file),
        Some(Command::Migrate { action }) => {
            return runtime()?.block_on(migrate(cfg, action));
        }
        Some(Command::Version) | None => {}
    }

    if cli.config.is_none() {
        bail!("--config is required (use --help for usage)");
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flamestore",
    );

    runtime()?.block_on(run(cfg))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

/// Decodes one artifact with the configured rules and prints collapsed
/// stacks with self weights.
fn collapse(cfg: &Config, file: &Path) -> Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;

    let rules = Arc::new(
        ReloadableRules::new(&cfg.ingest.normalization).context("loading normalization rules")?,
    );
    let decoder = StackDecoder::new(rules, IdleFilter::new(cfg.ingest.idle_frames.clone()));

    let key = file.display().to_string();
    let artifact = decode_body(&decoder, &key, &raw)?;
    if let Some((line, err)) = &artifact.first_line_error {
        tracing::warn!(line, error = %err, skipped = artifact.stats.skipped, "skipped lines");
    }

    let rows = stack_rows(&artifact, 0, chrono::Utc::now());
    let graph = FlameGraph::build(&rows);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in graph.collapsed() {
        writeln!(out, "{line}").context("writing output")?;
    }
    out.flush().context("flushing output")?;

    Ok(())
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    if cfg.store.backend != StoreBackendKind::Clickhouse {
        bail!("migrations require store.backend: clickhouse");
    }

    let ch_cfg = cfg.store.clickhouse;
    let database = ch_cfg.database.clone();
    let mut connection = ClickHouseConnection::new(ch_cfg);
    let pool = connection
        .connect()
        .await
        .context("connecting to ClickHouse")?;
    let migrator = ClickHouseMigrator::new(pool, database);

    let result = match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => migrator
            .status()
            .await
            .map(|state| println!("schema {state}")),
    };

    connection.close();
    result
}

async fn run(cfg: Config) -> Result<()> {
    let mut engine = Engine::new(cfg)?;
    let fatal = engine.fatal();

    engine.start().await?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = fatal.cancelled() => {
            tracing::error!("fatal component error, shutting down");
        }
    }

    engine.stop().await?;

    tracing::info!("flamestore stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
