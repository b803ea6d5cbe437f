//! Host binary for the bidding engine.
//!
//! Usage:
//!   ord-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Config file path (default: config/bot.toml)
//!   --log-level <LEVEL>    Override the configured log level
//!
//! Loads configuration, validates it fail-closed, runs the engine until
//! Ctrl-C, then stops it cleanly (flushing snapshots).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ord_bot::config::BotConfig;
use ord_bot::engine::BidEngine;
use ord_market::{HttpMarketplace, HttpSigner};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "ord-bot")]
#[command(about = "Ordinals marketplace bidding bot")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut config = BotConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.apply_env_overrides();

    let log_level = args
        .log_level
        .unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ord_bot={log_level},ord_market={log_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Fail closed before any network activity.
    config.validate().context("configuration invalid")?;

    let market = Arc::new(HttpMarketplace::new(
        config.api_base_url.clone(),
        config.api_key.clone(),
    ));
    let signer = Arc::new(HttpSigner::new(config.signer_endpoint.clone()));

    let mut engine = BidEngine::new(config, market, signer)?;
    engine.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    engine.stop().await;
    Ok(())
}
