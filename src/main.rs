//! Helmsman: an automated trading engine.
//!
//! Orchestrates capital allocation and the trade/order lifecycle against an
//! abstract exchange gateway: entries sized from the wallet, stepped position
//! adjustment, stoploss/ROI/trailing exits, and crash-consistent
//! reconciliation of every in-flight order.

mod bot;
mod db;
mod exchange;
mod models;
mod trading;

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::Bot;
use crate::models::TradeDirection;
use crate::trading::TradingConfig;

/// Helmsman trading engine CLI.
#[derive(Parser)]
#[command(name = "helmsman")]
#[command(about = "Automated trading engine with crash-consistent order tracking", long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Tick interval in seconds (overrides the configuration)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show open trades
    Status,

    /// Show open-trade count against the configured maximum
    Count,

    /// Force-entry on a pair
    Enter {
        /// Trading pair, e.g. ETH/USDT
        pair: String,

        /// Direction: long or short
        #[arg(short, long, default_value = "long")]
        side: String,

        /// Limit price (market-derived when omitted)
        #[arg(short, long)]
        price: Option<Decimal>,

        /// Stake in quote currency (allocator-sized when omitted)
        #[arg(long)]
        stake: Option<Decimal>,
    },

    /// Force-exit one trade by id, or "all"
    ForceExit {
        target: String,
    },

    /// Delete a trade from the ledger, cancelling its resting orders
    DeleteTrade {
        id: i64,
    },

    /// Lock a pair against new entries
    Lock {
        /// Pair to lock, or "*" for all pairs
        pair: String,

        /// Lock duration in minutes
        #[arg(short, long, default_value = "60")]
        minutes: i64,

        /// Reason, for the audit trail
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Release locks by lock id or pair name
    Unlock {
        target: String,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<TradingConfig> {
    let mut config = match &cli.config {
        Some(path) => TradingConfig::from_file(path)?,
        None => TradingConfig::default(),
    };
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database_url = url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level: Level = cli.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Run { interval } => {
            if let Some(secs) = interval {
                config.tick_interval_secs = secs;
            }
            let mut bot = Bot::new(config).await?;
            bot.run().await?;
        }

        Commands::Status => {
            let bot = Bot::new(config).await?;
            let views = bot.status().await?;
            if views.is_empty() {
                println!("No open trades");
            }
            for view in views {
                println!("{view}");
            }
        }

        Commands::Count => {
            let bot = Bot::new(config).await?;
            let (current, max) = bot.count().await?;
            println!("Open trades: {current} / {max}");
        }

        Commands::Enter {
            pair,
            side,
            price,
            stake,
        } => {
            let direction = match side.to_lowercase().as_str() {
                "long" | "buy" => TradeDirection::Long,
                "short" | "sell" => TradeDirection::Short,
                other => anyhow::bail!("invalid side {other:?}, expected long or short"),
            };
            let bot = Bot::new(config).await?;
            let trade = bot.enter(&pair, direction, price, stake).await?;
            info!(
                trade_id = trade.id.unwrap_or_default(),
                pair = %trade.pair,
                stake = %trade.stake_amount,
                "Entry submitted"
            );
        }

        Commands::ForceExit { target } => {
            let bot = Bot::new(config).await?;
            let exited = bot.force_exit(&target).await?;
            println!("Exited {exited} trade(s)");
        }

        Commands::DeleteTrade { id } => {
            let bot = Bot::new(config).await?;
            let cancelled = bot.delete_trade(id).await?;
            println!("Trade {id} deleted, {cancelled} order cancellation(s) issued");
        }

        Commands::Lock {
            pair,
            minutes,
            reason,
        } => {
            let bot = Bot::new(config).await?;
            let until = Utc::now() + Duration::minutes(minutes);
            let lock = bot.lock(&pair, until, reason.as_deref()).await?;
            println!(
                "Locked {} until {} (lock id {})",
                lock.pair,
                lock.lock_until,
                lock.id.unwrap_or_default()
            );
        }

        Commands::Unlock { target } => {
            let bot = Bot::new(config).await?;
            let released = bot.unlock(&target).await?;
            println!("Released {released} lock(s)");
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
