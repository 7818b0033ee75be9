//! Command line interface and command handlers.
//!
//! Every handler returns `Ok(true)` when the command fully succeeded; `main`
//! turns `Ok(false)` into a non-zero exit status.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{Duration, FixedOffset, NaiveDate, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::archive::Archive;
use crate::client::WeatherApi;
use crate::config::Config;
use crate::governor::Governor;
use crate::ingest::{IngestReport, Ingestor};
use crate::models::Parameter;
use crate::runs::{MetadataTracker, RunStatus};
use crate::store::WeatherStore;
use crate::tracker::DownloadTracker;
use crate::transform::engine::{Engine, TransformSummary};

// ---

#[derive(Parser, Debug)]
#[command(name = "weatherflow", version, about, long_about = None)]
pub struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG still wins
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database schema
    Init,
    /// Fetch, validate and store raw documents
    Ingest(IngestArgs),
    /// Store archived documents in the raw table, skipping unchanged files
    Load(LoadArgs),
    /// Transform raw documents into the normalized tables
    Transform(TransformArgs),
    /// Ingest then transform
    Run(RunArgs),
    /// Show download and transform state
    Status(RangeArgs),
    /// Empty the raw table and the download tracker
    ClearRaw,
}

#[derive(Args, Debug)]
pub struct RangeArgs {
    /// First date (YYYY-MM-DD)
    #[arg(long)]
    pub start: NaiveDate,
    /// Last date, inclusive (YYYY-MM-DD)
    #[arg(long)]
    pub end: NaiveDate,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[command(flatten)]
    pub range: RangeArgs,
    /// Datasets to ingest (default: all)
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub parameters: Vec<Parameter>,
    /// Re-fetch units already stored
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Archive root (default: RAW_ARCHIVE_DIR)
    #[arg(long)]
    pub dir: Option<PathBuf>,
    #[command(flatten)]
    pub range: RangeArgs,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub parameters: Vec<Parameter>,
    /// Load files even when unchanged since their last load
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct TransformArgs {
    /// First date (default: earliest raw date)
    #[arg(long)]
    pub start: Option<NaiveDate>,
    /// Last date, inclusive (default: latest raw date)
    #[arg(long)]
    pub end: Option<NaiveDate>,
    /// Dates transformed concurrently (default: PARALLELISM)
    #[arg(long)]
    pub parallel: Option<usize>,
    /// Reprocess dates that already succeeded
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// First date (default: seven days before --end)
    #[arg(long)]
    pub start: Option<NaiveDate>,
    /// Last date, inclusive (default: yesterday, Singapore time)
    #[arg(long)]
    pub end: Option<NaiveDate>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub parameters: Vec<Parameter>,
    #[arg(long)]
    pub parallel: Option<usize>,
    /// Re-fetch and reprocess everything in range
    #[arg(long)]
    pub force: bool,
}

/// Shared handles for the command handlers.
pub struct Context {
    pub cfg: Config,
    pub store: Arc<dyn WeatherStore>,
    pub api: Arc<dyn WeatherApi>,
}

impl Context {
    fn governor(&self, parallel: Option<usize>) -> Governor {
        // ---
        Governor::from_config(&self.cfg, parallel)
    }
}

fn parameters_or_all(parameters: Vec<Parameter>) -> Vec<Parameter> {
    // ---
    if parameters.is_empty() {
        Parameter::ALL.to_vec()
    } else {
        parameters
    }
}

/// Today's date in Singapore.
fn today_sgt() -> NaiveDate {
    // ---
    match FixedOffset::east_opt(8 * 3600) {
        Some(offset) => Utc::now().with_timezone(&offset).date_naive(),
        None => Utc::now().date_naive(),
    }
}

fn ensure_order(start: NaiveDate, end: NaiveDate) -> Result<()> {
    // ---
    if start > end {
        return Err(anyhow!("--start {} is after --end {}", start, end));
    }
    Ok(())
}

pub async fn execute(command: Commands, ctx: &Context) -> Result<bool> {
    // ---
    match command {
        Commands::Init => {
            info!("Schema is up to date");
            Ok(true)
        }
        Commands::Ingest(args) => {
            ensure_order(args.range.start, args.range.end)?;
            let report = ingest(
                ctx,
                args.range.start,
                args.range.end,
                parameters_or_all(args.parameters),
                args.force,
                None,
            )
            .await;
            Ok(report.is_complete())
        }
        Commands::Load(args) => {
            ensure_order(args.range.start, args.range.end)?;
            let Some(dir) = args.dir.or_else(|| ctx.cfg.raw_archive_dir.clone()) else {
                return Err(anyhow!("no archive directory: pass --dir or set RAW_ARCHIVE_DIR"));
            };
            let report = Ingestor::new(ctx.api.clone(), ctx.store.clone(), ctx.governor(None))
                .load(
                    &Archive::new(dir),
                    args.range.start,
                    args.range.end,
                    &parameters_or_all(args.parameters),
                    args.force,
                )
                .await?;
            log_failures(&report);
            Ok(report.is_complete())
        }
        Commands::Transform(args) => {
            let (start, end) = match (args.start, args.end) {
                (Some(start), Some(end)) => (start, end),
                (start, end) => match ctx.store.raw_date_range().await? {
                    Some((first, last)) => (start.unwrap_or(first), end.unwrap_or(last)),
                    None => {
                        warn!("raw_weather_data is empty, nothing to transform");
                        return Ok(true);
                    }
                },
            };
            ensure_order(start, end)?;
            let summary = transform(ctx, start, end, args.parallel, args.force).await;
            Ok(summary.all_succeeded())
        }
        Commands::Run(args) => {
            let end = args.end.unwrap_or_else(|| today_sgt() - Duration::days(1));
            let start = args.start.unwrap_or(end - Duration::days(7));
            ensure_order(start, end)?;

            let report = ingest(
                ctx,
                start,
                end,
                parameters_or_all(args.parameters),
                args.force,
                args.parallel,
            )
            .await;
            let summary = transform(ctx, start, end, args.parallel, args.force).await;
            Ok(report.is_complete() && summary.all_succeeded())
        }
        Commands::Status(args) => {
            ensure_order(args.start, args.end)?;
            status(ctx, args.start, args.end).await?;
            Ok(true)
        }
        Commands::ClearRaw => {
            ctx.store.clear_raw().await?;
            info!("Cleared raw_weather_data, weather_data_metadata and download_state");
            Ok(true)
        }
    }
}

async fn ingest(
    ctx: &Context,
    start: NaiveDate,
    end: NaiveDate,
    parameters: Vec<Parameter>,
    force: bool,
    parallel: Option<usize>,
) -> IngestReport {
    // ---
    let mut ingestor = Ingestor::new(ctx.api.clone(), ctx.store.clone(), ctx.governor(parallel));
    if let Some(dir) = &ctx.cfg.raw_archive_dir {
        ingestor = ingestor.with_archive(Archive::new(dir));
    }
    let report = ingestor.ingest(start, end, &parameters, force).await;
    log_failures(&report);
    report
}

fn log_failures(report: &IngestReport) {
    // ---
    for (key, message) in &report.failed {
        warn!("Not stored: {}: {}", key, message);
    }
}

async fn transform(
    ctx: &Context,
    start: NaiveDate,
    end: NaiveDate,
    parallel: Option<usize>,
    force: bool,
) -> TransformSummary {
    // ---
    let engine = Engine::new(ctx.store.clone(), ctx.governor(parallel));
    let summary = engine.transform_range(start, end, force).await;
    for outcome in summary.outcomes.iter().filter(|o| !o.is_success()) {
        warn!(
            "{}: {}{}",
            outcome.date,
            outcome.status,
            outcome
                .error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }
    summary
}

async fn status(ctx: &Context, start: NaiveDate, end: NaiveDate) -> Result<()> {
    // ---
    let downloads = DownloadTracker::new(ctx.store.clone()).states(start, end).await?;
    let runs = MetadataTracker::new(ctx.store.clone()).runs(start, end).await?;

    println!("{:<12} {:<10} {:<26}", "date", "transform", "completed_at");
    for date in start.iter_days().take_while(|d| *d <= end) {
        let run = runs.iter().find(|r| r.date == date);
        let run_status = run.map_or(RunStatus::Pending, |r| r.status);
        let completed = run
            .and_then(|r| r.completed_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!("{:<12} {:<10} {:<26}", date, run_status, completed);

        for unit in downloads.iter().filter(|u| u.date == date) {
            println!(
                "    {:<28} {:<12} attempts={:<3} {}",
                unit.parameter,
                unit.state,
                unit.attempts,
                unit.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}
