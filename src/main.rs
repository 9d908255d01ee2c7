//! trailguard: threshold-triggered trailing stops
//!
//! Monitors a CSV of price thresholds and places one trailing-stop order per
//! entry once its threshold is crossed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use trailguard::api::{Exchange, MarketDataClient, PaperExchange};
use trailguard::bot::Bot;
use trailguard::models::EntryPhase;
use trailguard::store::{ConfigStore, StateStore};
use trailguard::trading::{EngineConfig, EngineError, TriggerEngine};

/// Threshold-triggered trailing-stop CLI.
#[derive(Parser)]
#[command(name = "trailguard")]
#[command(about = "Place trailing-stop orders when price thresholds are crossed", long_about = None)]
struct Cli {
    /// Config CSV path
    #[arg(short, long, env = "TRAILGUARD_CONFIG", default_value = "trailguard.csv")]
    config: PathBuf,

    /// Trigger state CSV path
    #[arg(short, long, env = "TRAILGUARD_STATE", default_value = "trailguard_state.csv")]
    state: PathBuf,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Public market data endpoint
    #[arg(long, env = "TRAILGUARD_API_URL", default_value = "https://api.kraken.com")]
    api_url: String,

    /// Per-call timeout in seconds
    #[arg(long, env = "TRAILGUARD_TIMEOUT", default_value = "15")]
    timeout: u64,

    /// Simulated wallet balances, e.g. "XXBT=0.5,XBT.F=0.01,ZUSD=1000"
    #[arg(long, env = "TRAILGUARD_PAPER_BALANCES", default_value = "")]
    paper_balances: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring loop
    Run {
        /// Polling interval in seconds
        #[arg(short, long, env = "TRAILGUARD_INTERVAL", default_value = "60")]
        interval: u64,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,

        /// Report invalid entries without disabling them
        #[arg(long)]
        no_auto_disable: bool,
    },

    /// Validate active entries and print errors and warnings
    Validate {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show trigger state per entry
    Status,

    /// Set the enabled column of one entry (true, false, paused, canceled)
    SetEnabled { id: String, status: String },

    /// Cancel the live order of one entry, or cancel a dormant entry
    Cancel { id: String },

    /// Cancel every tracked open order
    CancelAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            interval,
            once,
            no_auto_disable,
        } => {
            let config = EngineConfig {
                poll_interval_secs: interval,
                call_timeout: Duration::from_secs(cli.timeout),
                auto_disable_invalid: !no_auto_disable,
                ..EngineConfig::default()
            };
            info!(
                config = %cli.config.display(),
                state = %cli.state.display(),
                interval = interval,
                "Starting trailguard"
            );

            let engine = build_engine(&cli.config, &cli.state, &cli.api_url, &cli.paper_balances, config)?;
            let mut bot = Bot::new(engine);
            if once {
                bot.run_once().await?;
            } else {
                bot.run().await?;
            }
        }

        Commands::Validate { json } => {
            let config = EngineConfig {
                call_timeout: Duration::from_secs(cli.timeout),
                ..EngineConfig::default()
            };
            let mut engine = build_engine(&cli.config, &cli.state, &cli.api_url, &cli.paper_balances, config)?;
            let results = engine.validate_config().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
                return Ok(());
            }
            if results.is_empty() {
                println!("No active entries in {}", cli.config.display());
                return Ok(());
            }

            let mut invalid = 0;
            for result in &results {
                let verdict = if result.is_valid() { "OK" } else { "INVALID" };
                println!("\n[{}] {} (line {})", verdict, result.id, result.line);
                for err in &result.errors {
                    println!("  error:   {}", err);
                }
                for warning in &result.warnings {
                    println!("  warning: {}", warning);
                }
                if let Some(balance) = &result.balance {
                    println!(
                        "  balance: {} {} available, {} required ({})",
                        balance.available,
                        balance.asset,
                        balance.required,
                        balance.describe_sources()
                    );
                }
                if !result.is_valid() {
                    invalid += 1;
                }
            }
            println!("\n{} entries checked, {} invalid", results.len(), invalid);
        }

        Commands::Status => {
            let config = ConfigStore::new(&cli.config).read_all()?;
            let states = StateStore::new(&cli.state).read_all()?;

            println!(
                "\n{:<24} {:<12} {:<10} {:<18} {:<24} {:<20}",
                "ID", "PAIR", "ENABLED", "STATUS", "ORDER", "TRIGGERED AT"
            );
            println!("{}", "-".repeat(112));

            for record in config.active.iter().chain(config.inactive.iter()) {
                let state = states.get(&record.id);
                println!(
                    "{:<24} {:<12} {:<10} {:<18} {:<24} {:<20}",
                    truncate(&record.id, 22),
                    record.pair,
                    record.enabled.as_str(),
                    state.map(|s| s.last_status).unwrap_or(EntryPhase::Idle).as_str(),
                    state.and_then(|s| s.order_id.as_deref()).unwrap_or("-"),
                    state
                        .and_then(|s| s.triggered_at)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            for err in &config.row_errors {
                println!("line {}: {}", err.line, err.message);
            }
        }

        Commands::SetEnabled { id, status } => {
            ConfigStore::new(&cli.config).update_enabled(&id, &status)?;
            println!("{} -> {}", id, status.trim().to_ascii_lowercase());
        }

        Commands::Cancel { id } => {
            let mut engine = build_engine(
                &cli.config,
                &cli.state,
                &cli.api_url,
                &cli.paper_balances,
                EngineConfig::default(),
            )?;
            match engine.cancel_order(&id).await {
                Ok(()) => println!("Canceled order for {}", id),
                Err(EngineError::NoOpenOrder { .. }) => {
                    ConfigStore::new(&cli.config)
                        .update_enabled(&id, "canceled")
                        .with_context(|| format!("No open order for {} and config update failed", id))?;
                    println!("No open order for {}; entry marked canceled", id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::CancelAll => {
            let mut engine = build_engine(
                &cli.config,
                &cli.state,
                &cli.api_url,
                &cli.paper_balances,
                EngineConfig::default(),
            )?;
            let report = engine.cancel_all().await;
            print!("{}", report);
            if !report.is_complete() {
                bail!("{} cancellations failed", report.failed.len());
            }
        }
    }

    Ok(())
}

fn build_engine(
    config_path: &Path,
    state_path: &Path,
    api_url: &str,
    paper_balances: &str,
    config: EngineConfig,
) -> Result<TriggerEngine> {
    let market = MarketDataClient::with_base_url(api_url.to_string(), config.call_timeout)
        .context("Failed to create market data client")?;
    let balances = parse_balances(paper_balances)?;
    let exchange: Arc<dyn Exchange> = Arc::new(PaperExchange::new(market, balances));

    Ok(TriggerEngine::new(
        exchange,
        ConfigStore::new(config_path),
        StateStore::new(state_path),
        config,
    ))
}

/// Parse `KEY=AMOUNT` pairs separated by commas.
fn parse_balances(raw: &str) -> Result<HashMap<String, Decimal>> {
    let mut balances = HashMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, amount)) = part.split_once('=') else {
            bail!("Invalid balance '{}', expected KEY=AMOUNT", part);
        };
        let amount = Decimal::from_str(amount.trim())
            .with_context(|| format!("Invalid amount for {}", key.trim()))?;
        balances.insert(key.trim().to_string(), amount);
    }
    Ok(balances)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
