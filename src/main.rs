//! trailguard: position risk management for one equity account.
//!
//! Tracks every open long position, trails a volatility-adjusted stop per
//! ticker, evaluates a priority-ordered exit chain on every poll, and
//! submits exit orders to the brokerage with classified retries.

mod api;
mod config;
mod engine;
mod error;
mod execution;
mod models;
mod reconcile;
mod records;
mod risk;
mod store;
#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::KiteClient;
use crate::config::{EngineConfig, StopPolicyKind};
use crate::engine::{market_is_open, Engine};
use crate::records::OrderRecordStore;

/// Position risk-management daemon CLI.
#[derive(Parser)]
#[command(name = "trailguard")]
#[command(about = "Trail volatility-adjusted stops and exit positions autonomously", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring and execution loop
    Run {
        /// Price poll interval in seconds
        #[arg(short, long, default_value = "20")]
        interval: u64,

        /// Directory of historical order-record day files
        #[arg(long)]
        records_dir: Option<PathBuf>,

        /// Extra order-record file to seed reconciliation
        #[arg(long)]
        records_file: Option<PathBuf>,

        /// Loss threshold from entry, percent
        #[arg(long, default_value = "2.0")]
        loss_threshold: Decimal,

        /// Enable profit-target tranches
        #[arg(long)]
        tranches: bool,

        /// Use the regime-aware stop policy, reading this signal file
        #[arg(long)]
        regime_signal: Option<String>,

        /// Evaluate and log exits without placing orders
        #[arg(long)]
        dry_run: bool,

        /// Start (and keep running) outside market hours
        #[arg(long)]
        force: bool,
    },

    /// Reconstruct positions and print a snapshot without starting the loop
    Report,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            interval,
            records_dir,
            records_file,
            loss_threshold,
            tranches,
            regime_signal,
            dry_run,
            force,
        } => {
            if !force && !market_is_open(Utc::now()) {
                println!("Market is closed. Use --force to start anyway.");
                return Ok(());
            }

            let config = EngineConfig {
                poll_interval_secs: interval,
                loss_threshold_pct: loss_threshold,
                tranches_enabled: tranches,
                stop_policy: if regime_signal.is_some() {
                    StopPolicyKind::Regime
                } else {
                    StopPolicyKind::Fixed
                },
                regime_signal_path: regime_signal,
                dry_run,
                ..EngineConfig::default()
            };

            let mut records = OrderRecordStore::new(records_dir);
            if let Some(path) = &records_file {
                let count = records.seed_from_file(path)?;
                info!(count, path = %path.display(), "Seeded order records");
            }

            let broker = Arc::new(
                KiteClient::from_env()
                    .context("Broker credentials missing")?
                    .with_exchange(&config.exchange),
            );

            info!(
                interval = config.poll_interval_secs,
                dry_run = config.dry_run,
                tranches = config.tranches_enabled,
                policy = ?config.stop_policy,
                "Starting trailguard"
            );
            println!("\n=== trailguard ===");
            println!("Poll interval:  {}s", config.poll_interval_secs);
            println!("Loss threshold: {}%", config.loss_threshold_pct);
            println!("Tranches:       {}", if config.tranches_enabled { "on" } else { "off" });
            println!(
                "Mode:           {}",
                if config.dry_run { "DRY RUN (no real orders)" } else { "LIVE" }
            );
            println!("\nPress Ctrl+C to stop.\n");

            let engine = Engine::new(config, broker, records, force);
            engine.run().await?;
        }

        Commands::Report => {
            let broker = Arc::new(KiteClient::from_env().context("Broker credentials missing")?);
            let engine = Engine::new(
                EngineConfig::default(),
                broker,
                OrderRecordStore::new(None),
                true,
            );

            let rows = engine.snapshot().await?;
            if rows.is_empty() {
                println!("No open positions.");
                return Ok(());
            }

            println!(
                "\n{:<14} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8}",
                "TICKER", "QTY", "ENTRY", "LAST", "HIGH", "STOP", "PNL%"
            );
            println!("{}", "-".repeat(76));
            for row in rows {
                let last = row
                    .last_price
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".to_string());
                let stop = row
                    .stop
                    .map(|s| format!("{:.2}", s.stop_price))
                    .unwrap_or_else(|| "-".to_string());
                let pnl = row
                    .last_price
                    .map(|p| format!("{:.2}", row.position.pnl_pct(p)))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<14} {:>8} {:>10.2} {:>10} {:>10.2} {:>10} {:>8}",
                    row.position.ticker,
                    row.position.quantity,
                    row.position.entry_price,
                    last,
                    row.position.position_high,
                    stop,
                    pnl
                );
            }
        }

        Commands::Config => {
            let config = EngineConfig::default();

            println!("\n=== Engine Configuration ===\n");
            println!("Venue:");
            println!("  Exchange:             {}", config.exchange);
            println!("  Product:              {}", config.product);
            println!("  Tick size:            {}", config.tick_size);
            println!("  Quote batch size:     {}", config.quote_batch_size);

            println!("\nCadence:");
            println!("  Poll interval:        {}s", config.poll_interval_secs);
            println!("  Resync interval:      {}s", config.resync_interval_secs);
            println!("  Pending cool-down:    {}s", config.pending_cooldown_secs);
            println!("  ATR refresh:          {}h", config.atr_refresh_hours);

            println!("\nExit rules:");
            println!("  Loss threshold:       {}%", config.loss_threshold_pct);
            println!("  VSR decay fraction:   {}", config.vsr_decay_fraction);
            println!("  VSR check interval:   {}s", config.vsr_check_interval_secs);
            println!("  Candle-length mult:   {}x ATR", config.candle_length_atr_mult);
            println!("  Trend check delay:    {}s", config.trend_check_delay_secs);
            println!("  Tranches enabled:     {}", config.tranches_enabled);
            println!(
                "  Stop tranche:         {}%",
                config.tranche.stop_pct * Decimal::from(100)
            );
            println!(
                "  Target 1:             {}% at entry + {}x ATR",
                config.tranche.target1_pct * Decimal::from(100),
                config.tranche.target1_atr_mult
            );
            println!(
                "  Target 2:             {}% at entry + {}x ATR",
                config.tranche.target2_pct * Decimal::from(100),
                config.tranche.target2_atr_mult
            );

            println!("\nOrder execution:");
            println!("  Retry budget:         {}", config.retry_budget);
            println!("  Tick retry cap:       {}", config.tick_retry_cap);
            println!("  Backoff base:         {}ms", config.backoff_base_ms);
            println!("  Backoff growth:       {}x", config.backoff_growth);

            println!("\nReconstruction:");
            println!("  Lookback:             {} days", config.lookback_days);
        }
    }

    Ok(())
}
