//! Command line entry points.
//!
//! Every subcommand loads the layered configuration, applies its flags on
//! top, sets up logging and then drives the orchestrator or one of the
//! services. Ctrl-C cancels the root token, which interrupts whatever is
//! running and lets it tear down cleanly.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crawling::{Orchestrator, PageRange, PipelineConfig, RunSummary, TailSettings};
use crate::domain::DeckId;
use crate::infrastructure::{AppConfig, DatabaseConnection, SqliteDeckStore, VaultClient, init_logging_with_config};
use crate::services::CountReporter;

#[derive(Parser, Debug)]
#[command(name = "deckvault")]
#[command(about = "Mirror KeyForge decks and cards into a local SQLite database")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML, YAML, JSON or INI)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// More log output; repeat for trace
    #[arg(long, short, action = clap::ArgAction::Count, global = true, conflicts_with = "quiet")]
    verbose: u8,

    /// Only warnings and errors
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a range of listing pages and store every new deck
    Get(GetArgs),

    /// Keep polling the newest pages for new decks
    Tail(TailArgs),

    /// Fetch and store specific decks
    FetchIds(FetchIdsArgs),

    /// Print the id of the first deck matching a name
    Find {
        name: String,
    },

    /// Periodically report how many decks are stored
    Report(ReportArgs),
}

/// Pool size overrides
#[derive(Args, Debug, Default)]
struct PoolArgs {
    #[arg(long, visible_alias = "deck-fetchers")]
    detail_fetchers: Option<usize>,

    #[arg(long, visible_alias = "db-workers")]
    persisters: Option<usize>,
}

#[derive(Args, Debug)]
struct GetArgs {
    #[arg(long, default_value_t = 1)]
    start_page: u32,

    /// Last page to scan (inclusive)
    #[arg(long, visible_alias = "max-pages", default_value_t = 1)]
    end_page: u32,

    #[arg(long)]
    page_workers: Option<usize>,

    #[command(flatten)]
    pools: PoolArgs,

    /// Scan from the last page back to the first
    #[arg(long)]
    reverse: bool,

    /// Also tail the newest pages every this many seconds; 0 disables
    #[arg(long, short = 'i', visible_alias = "page-one-interval", default_value_t = 0)]
    tail_interval: u64,
}

#[derive(Args, Debug)]
struct TailArgs {
    /// Seconds between scans of the newest pages
    #[arg(long, short)]
    interval: Option<u64>,

    #[command(flatten)]
    pools: PoolArgs,
}

#[derive(Args, Debug)]
struct FetchIdsArgs {
    #[arg(required = true)]
    ids: Vec<String>,

    #[command(flatten)]
    pools: PoolArgs,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Seconds between reports
    #[arg(long, short)]
    interval: Option<u64>,

    /// Number of intervals in the running average
    #[arg(long, short, visible_alias = "running-window")]
    window: Option<usize>,
}

impl Cli {
    fn log_level(&self, configured: &str) -> String {
        match (self.quiet, self.verbose) {
            (true, _) => "warn".to_string(),
            (false, 0) => configured.to_string(),
            (false, 1) => "debug".to_string(),
            (false, _) => "trace".to_string(),
        }
    }
}

fn apply_pools(config: &mut AppConfig, pools: &PoolArgs) {
    if let Some(fetchers) = pools.detail_fetchers {
        config.workers.detail_fetchers = fetchers;
    }
    if let Some(persisters) = pools.persisters {
        config.workers.persisters = persisters;
    }
}

/// Parses the command line and runs the chosen subcommand
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.logging.level = cli.log_level(&config.logging.level);
    let _log_guard = init_logging_with_config(&config.logging)?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Command::Find { name } => find(&config, &name).await,
        Command::Report(args) => report(config, &args, shutdown).await,
        Command::Get(args) => {
            apply_pools(&mut config, &args.pools);
            if let Some(workers) = args.page_workers {
                config.workers.page_workers = workers;
            }
            let range = PageRange::new(args.start_page, args.end_page, args.reverse)?;
            let tail = (args.tail_interval > 0).then(|| TailSettings {
                interval: Duration::from_secs(args.tail_interval),
                stop_file: config.timing.stop_file.clone(),
            });
            with_orchestrator(&config, shutdown, |orchestrator| async move {
                orchestrator.run_pages(range, tail).await
            })
            .await
        }
        Command::Tail(args) => {
            apply_pools(&mut config, &args.pools);
            if let Some(interval) = args.interval {
                config.timing.tail_interval_seconds = interval;
            }
            let tail = TailSettings::from_timing(&config.timing);
            with_orchestrator(&config, shutdown, |orchestrator| async move {
                orchestrator.run_tail(tail).await
            })
            .await
        }
        Command::FetchIds(args) => {
            apply_pools(&mut config, &args.pools);
            let ids = args.ids.into_iter().map(DeckId::from).collect();
            with_orchestrator(&config, shutdown, |orchestrator| async move {
                orchestrator.run_ids(ids).await
            })
            .await
        }
    }
}

/// Pool size that leaves every persister its own connection plus one spare
fn pool_size(config: &AppConfig) -> u32 {
    let persisters = u32::try_from(config.workers.persisters).unwrap_or(u32::MAX);
    config.database.max_connections.max(persisters.saturating_add(1))
}

async fn open_store(config: &AppConfig) -> Result<(DatabaseConnection, Arc<SqliteDeckStore>)> {
    let db = DatabaseConnection::new(&config.database.url, pool_size(config))
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    let store = Arc::new(SqliteDeckStore::new(db.clone()));
    Ok((db, store))
}

type SqliteOrchestrator = Orchestrator<VaultClient, SqliteDeckStore>;

async fn with_orchestrator<F, Fut>(config: &AppConfig, shutdown: CancellationToken, run: F) -> Result<()>
where
    F: FnOnce(Arc<SqliteOrchestrator>) -> Fut,
    Fut: Future<Output = Result<RunSummary, crate::crawling::OrchestratorError>>,
{
    let client = Arc::new(VaultClient::new(&config.vault).context("Failed to build the vault client")?);
    let (db, store) = open_store(config).await?;

    let orchestrator = Arc::new(Orchestrator::new(
        client,
        store,
        PipelineConfig::from_app_config(config),
        shutdown,
    ));
    let result = run(orchestrator).await;
    db.close().await;

    let summary = result.context("Pipeline run failed")?;
    if summary.interrupted {
        warn!("Run was interrupted before every queue drained");
    }
    Ok(())
}

async fn find(config: &AppConfig, name: &str) -> Result<()> {
    let client = VaultClient::new(&config.vault).context("Failed to build the vault client")?;
    let id = client
        .find_deck_id(name)
        .await
        .with_context(|| format!("Failed to look up deck {name:?}"))?;
    println!("{id}");
    Ok(())
}

async fn report(mut config: AppConfig, args: &ReportArgs, shutdown: CancellationToken) -> Result<()> {
    if let Some(interval) = args.interval {
        config.timing.report_interval_seconds = interval;
    }
    if let Some(window) = args.window {
        config.timing.report_window = window;
    }

    let (db, store) = open_store(&config).await?;
    CountReporter::new(store, config.timing.report_interval(), config.timing.report_window)
        .run(shutdown)
        .await;
    db.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn get_accepts_legacy_flag_aliases() {
        let cli = Cli::try_parse_from([
            "deckvault",
            "get",
            "--start-page",
            "3",
            "--max-pages",
            "9",
            "--db-workers",
            "2",
            "--deck-fetchers",
            "7",
            "--reverse",
            "-i",
            "60",
        ])
        .unwrap();

        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!((args.start_page, args.end_page), (3, 9));
        assert_eq!(args.pools.persisters, Some(2));
        assert_eq!(args.pools.detail_fetchers, Some(7));
        assert!(args.reverse);
        assert_eq!(args.tail_interval, 60);
    }

    #[test]
    fn verbosity_overrides_configured_level() {
        let cli = Cli::try_parse_from(["deckvault", "-vv", "find", "Some Deck"]).unwrap();
        assert_eq!(cli.log_level("info"), "trace");

        let cli = Cli::try_parse_from(["deckvault", "--quiet", "report"]).unwrap();
        assert_eq!(cli.log_level("info"), "warn");
    }

    #[test]
    fn pool_grows_to_fit_the_persisters() {
        let mut config = AppConfig::default();
        config.database.max_connections = 8;
        config.workers.persisters = 3;
        assert_eq!(pool_size(&config), 8);

        config.workers.persisters = 10;
        assert_eq!(pool_size(&config), 11);
    }

    #[test]
    fn fetch_ids_requires_an_id() {
        assert!(Cli::try_parse_from(["deckvault", "fetch-ids"]).is_err());
    }
}
