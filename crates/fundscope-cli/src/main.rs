use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fundscope_core::BatchReport;
use fundscope_storage::{FundStore, MemoryFundStore, PgFundStore};
use fundscope_sync::{build_ingestor, IngestionCycle, SchedulePolicy, Scheduler, SyncConfig};
use fundscope_web::{AppState, WebConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fundscope")]
#[command(about = "ETF holdings ingestor and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion scheduler and serve the API.
    Serve,
    /// Run a single ingestion cycle and print the batch report.
    Sync {
        /// Keep results in memory instead of writing to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("fundscope error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Sync { dry_run } => {
            let store: Arc<dyn FundStore> = if dry_run {
                Arc::new(MemoryFundStore::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let ingestor = build_ingestor(&config, store)?;
            let report = ingestor.run_cycle().await.context("ingestion cycle failed")?;
            print_report(&report);
            Ok(())
        }
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn serve(config: SyncConfig) -> Result<()> {
    let web = WebConfig::from_env()?;
    let store = Arc::new(connect(&config).await?);
    let ingestor = build_ingestor(&config, store.clone())?;
    let scheduler = Scheduler::new(Arc::new(ingestor), SchedulePolicy::default());

    let state = AppState {
        funds: store.clone(),
        users: store,
        jwt_secret: web.jwt_secret,
    };

    tokio::select! {
        result = scheduler.run() => {
            result.context("scheduler stopped")?;
            Ok(())
        }
        result = fundscope_web::serve(web.port, state) => result,
    }
}

async fn connect(config: &SyncConfig) -> Result<PgFundStore> {
    let store = PgFundStore::connect(&config.database_url, 10)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    info!("database ready");
    Ok(store)
}

fn print_report(report: &BatchReport) {
    println!(
        "sync complete: attempted={} stored={} skipped={} failed={}",
        report.attempted, report.stored, report.skipped, report.failed
    );
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("FUNDSCOPE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["fundscope"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn every_subcommand_has_help_text() {
        use clap::CommandFactory;

        let command = Cli::command();
        for name in ["serve", "sync", "migrate"] {
            let sub = command.find_subcommand(name).unwrap();
            assert!(sub.get_about().is_some(), "{name} has no about text");
        }
    }

    #[test]
    fn sync_accepts_dry_run() {
        let cli = Cli::try_parse_from(["fundscope", "sync", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Sync { dry_run: true })));
    }
}
