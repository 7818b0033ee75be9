//! Command entry point for the `weatherflow` pipeline.
//!
//! This binary orchestrates the startup sequence shared by every command:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Dispatching the parsed command to the `cli` gateway (EMBP pattern)
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `WEATHERFLOW_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `WEATHERFLOW_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Ctrl-C stops the command and exits with status 130. Transform runs still
//! marked `running` are released with their database sessions, so the next
//! invocation can take those dates.
//!
//! See [`weatherflow::config`] for the remaining pipeline settings.
use std::{env, process::ExitCode, sync::Arc};

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use weatherflow::cli::{self, Cli, Context};
use weatherflow::{config, schema, HttpClient, PgStore};

// ---

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---
    let args = Cli::parse();

    dotenv().ok();
    init_tracing(args.verbose);

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!(
        "Attempting to connect to database: {}",
        cfg.masked_db_url()
    );

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database '{}': {}",
                cfg.masked_db_url(),
                e
            )
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let ctx = Context {
        api: Arc::new(HttpClient::from_config(&cfg)?),
        store: Arc::new(PgStore::new(pool.clone())),
        cfg,
    };

    let ok = tokio::select! {
        result = cli::execute(args.command, &ctx) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, abandoning in-flight work");
            return Ok(ExitCode::from(130));
        }
    };
    pool.close().await;

    if ok {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!("Finished with failures");
        Ok(ExitCode::FAILURE)
    }
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `WEATHERFLOW_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, else `WEATHERFLOW_LOG_LEVEL` raised
///   by `-v` flags (see [`log_filter`])
///
/// Called once at startup, after `.env` is loaded so those variables apply.
fn init_tracing(verbose: u8) {
    // ---
    let span_events = match env::var("WEATHERFLOW_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to WEATHERFLOW_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = env::var("WEATHERFLOW_LOG_LEVEL").ok();
        EnvFilter::new(log_filter(level.as_deref(), verbose))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Crates whose own logging drowns out the pipeline's below `warn`.
const NOISY_CRATES: &[&str] = &["sqlx", "hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Filter directives for `level` (default `info`), raised one step per `-v`.
///
/// Dependencies stay at `warn` unless the pipeline itself runs at `trace`.
fn log_filter(level: Option<&str>, verbose: u8) -> String {
    // ---
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

    let base = LEVELS
        .iter()
        .position(|l| Some(*l) == level)
        .unwrap_or(2);
    let level = LEVELS[(base + verbose as usize).min(LEVELS.len() - 1)];

    let mut directives = vec![level.to_string()];
    if level != "trace" {
        directives.extend(NOISY_CRATES.iter().map(|c| format!("{c}=warn")));
    }
    directives.join(",")
}
