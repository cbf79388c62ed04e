use std::path::PathBuf;
use std::sync::Arc;

use alertwatch_core::SourceKind;
use alertwatch_sync::{pipeline_from_env, report_daily_markdown, RunOptions, SyncConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "alertwatch")]
#[command(about = "Patient safety alert scraper and reconciler")]
struct Cli {
    /// YAML run options; overrides ALERTWATCH_OPTIONS.
    #[arg(long, global = true)]
    options: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape both sources once and reconcile.
    Sync,
    /// Run the daily schedule until interrupted.
    Watch,
    /// Markdown digest of the most recent runs.
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
    },
    /// Validate configuration and options without fetching anything.
    CheckConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,alertwatch=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pipeline_from_env(cli.options)?.run_once().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} cas={} govuk={} new={} updated={} duplicate={} skipped={} failures={} reports={}",
                    summary.run_id,
                    summary.drafts_by_source.get(&SourceKind::CasPortal).copied().unwrap_or(0),
                    summary.drafts_by_source.get(&SourceKind::GovUk).copied().unwrap_or(0),
                    summary.counts.new,
                    summary.counts.updated,
                    summary.counts.duplicate,
                    summary.skipped,
                    summary.failures.len(),
                    summary.reports_dir.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Watch => {
            let pipeline = Arc::new(pipeline_from_env(cli.options)?);
            let cron = pipeline.config().daily_cron.clone();
            let mut sched = alertwatch_sync::build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            print!("{}", report_daily_markdown(runs, &config.reports_root())?);
        }
        Commands::CheckConfig => {
            let mut config = SyncConfig::from_env();
            if cli.options.is_some() {
                config.options_path = cli.options;
            }
            let options = RunOptions::load_optional(config.options_path.as_deref())?;
            println!("data_dir={}", config.data_dir.display());
            println!("reports_dir={}", config.reports_root().display());
            println!("cas_search_url={}", config.cas_search_url);
            println!("govuk_listing_url={}", config.govuk_listing_url);
            println!("daily_cron={}", config.daily_cron);
            println!("options={options:?}");
        }
    }

    Ok(())
}
