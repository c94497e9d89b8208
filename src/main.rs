//! Signal Autotrader
//!
//! Turns structured trading signals into staged multi-leg entries and
//! supervises the resulting positions: breakeven, trailing stops, final
//! target completion and cleanup of unfilled orders.

mod api;
mod bot;
mod db;
mod models;
mod trading;

#[cfg(test)]
mod test_helpers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{HttpGateway, OrderGateway, PaperVenue, PriceSource};
use crate::bot::{Bot, BotConfig};
use crate::db::{Database, SignalLedger};
use crate::models::{Fingerprint, Signal};
use crate::trading::{LegResult, SubmitOutcome, TradingConfig};

/// Signal autotrader CLI.
#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Execute multi-leg trading signals and supervise their stops", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./autotrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot, reading newline-delimited JSON signals from stdin
    Run {
        #[command(flatten)]
        venue: VenueArgs,
    },

    /// Plan and place a single signal from a JSON file
    Submit {
        /// Signal JSON file
        file: PathBuf,

        #[command(flatten)]
        venue: VenueArgs,
    },

    /// Show the ledger status and legs of a signal
    Status {
        /// Signal fingerprint
        fingerprint: String,
    },

    /// List recent signals
    Ledger {
        /// Maximum number of signals to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Validate a signal file and print its fingerprint
    Fingerprint {
        /// Signal JSON file
        file: PathBuf,
    },

    /// Show current configuration
    Config,
}

#[derive(Args)]
struct VenueArgs {
    /// Base URL of the HTTP order bridge; without it orders go to a paper venue
    #[arg(long, env = "GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Paper venue quote as SYMBOL=BID:ASK or SYMBOL=PRICE (repeatable)
    #[arg(long = "quote", value_parser = parse_quote)]
    quotes: Vec<QuoteArg>,
}

#[derive(Debug, Clone, PartialEq)]
struct QuoteArg {
    symbol: String,
    bid: Decimal,
    ask: Decimal,
}

impl VenueArgs {
    async fn connect(&self) -> Result<(Arc<dyn OrderGateway>, Arc<dyn PriceSource>)> {
        if let Some(url) = &self.gateway_url {
            let bridge = Arc::new(HttpGateway::new(url.as_str())?);
            info!(url = %url, "Using HTTP order bridge");
            let gateway: Arc<dyn OrderGateway> = bridge.clone();
            let prices: Arc<dyn PriceSource> = bridge;
            return Ok((gateway, prices));
        }

        warn!("No gateway URL configured, orders go to a paper venue");
        let venue = Arc::new(PaperVenue::new());
        for quote in &self.quotes {
            venue.set_quote(&quote.symbol, quote.bid, quote.ask).await;
        }
        let gateway: Arc<dyn OrderGateway> = venue.clone();
        let prices: Arc<dyn PriceSource> = venue;
        Ok((gateway, prices))
    }
}

fn parse_quote(s: &str) -> Result<QuoteArg, String> {
    let (symbol, prices) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=BID:ASK, got '{s}'"))?;
    let parse = |p: &str| {
        p.trim()
            .parse::<Decimal>()
            .map_err(|e| format!("invalid price '{p}': {e}"))
    };
    let (bid, ask) = match prices.split_once(':') {
        Some((bid, ask)) => (parse(bid)?, parse(ask)?),
        None => {
            let price = parse(prices)?;
            (price, price)
        }
    };
    if bid > ask {
        return Err(format!("bid {bid} above ask {ask}"));
    }
    Ok(QuoteArg {
        symbol: symbol.trim().to_uppercase(),
        bid,
        ask,
    })
}

async fn read_signal(path: &Path) -> Result<Signal> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid signal in {}", path.display()))
}

/// Forward signals from stdin to the bot until EOF.
async fn feed_stdin(tx: mpsc::Sender<Signal>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Signal>(line) {
            Ok(signal) => {
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Rejected signal"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
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

    // Initialize database
    let db = Database::new(&cli.database)
        .await
        .context("failed to open signal ledger")?;
    let ledger: Arc<dyn SignalLedger> = Arc::new(db);

    match cli.command {
        Commands::Run { venue } => {
            let config = TradingConfig::from_env()?;
            let (gateway, prices) = venue.connect().await?;

            let bot = Bot::new(gateway, prices, ledger, BotConfig::from(config));
            bot.initialize().await?;

            println!("\n=== Signal Autotrader ===");
            println!("Mode: {}", if venue.gateway_url.is_some() { "LIVE (HTTP bridge)" } else { "PAPER" });
            println!("Reading signals from stdin, one JSON object per line.");
            println!("\nPress Ctrl+C to stop.\n");

            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(feed_stdin(tx));

            // Run the bot
            if let Err(e) = bot.run(rx).await {
                tracing::error!(error = %e, "Bot error");
            }

            // Show final stats
            let stats = bot.get_stats().await;
            println!("\n{}", stats);
        }

        Commands::Submit { file, venue } => {
            let config = TradingConfig::from_env()?;
            let signal = read_signal(&file).await?;
            let (gateway, prices) = venue.connect().await?;

            let bot = Bot::new(gateway, prices, ledger, BotConfig::from(config));
            match bot.submit(&signal).await? {
                SubmitOutcome::Planned(report) => {
                    println!("\nSignal {} planned at {} ({})", report.fingerprint, report.current_price, report.status);
                    println!("\n{:<4} {:<10} {:>12} {:>12} {:>12} {:<24}", "LEG", "MODE", "PRICE", "SL", "TP", "RESULT");
                    println!("{}", "-".repeat(80));
                    for leg in &report.legs {
                        let d = &leg.decision;
                        let result = match &leg.result {
                            LegResult::Skipped(reason) => format!("skipped ({reason:?})"),
                            LegResult::Placed(ticket) => format!("ticket {ticket}"),
                            LegResult::Rejected(reason) => format!("rejected: {reason}"),
                        };
                        println!(
                            "{:<4} {:<10} {:>12} {:>12} {:>12} {:<24}",
                            d.leg,
                            d.mode.as_str(),
                            d.price,
                            d.stop_loss,
                            d.take_profit.map_or_else(|| "runner".to_string(), |tp| tp.to_string()),
                            result
                        );
                    }
                }
                SubmitOutcome::Duplicate(status) => {
                    println!("Signal {} already in progress ({})", signal.fingerprint(), status);
                }
                SubmitOutcome::AlreadyCompleted(status) => {
                    println!("Signal {} already finished ({})", signal.fingerprint(), status);
                }
                SubmitOutcome::Blocked(reason) => {
                    println!("Signal {} refused: {}", signal.fingerprint(), reason);
                }
            }
        }

        Commands::Status { fingerprint } => {
            let fingerprint = Fingerprint::from(fingerprint);
            let Some(signal) = ledger.signal(&fingerprint).await? else {
                println!("No signal with fingerprint {fingerprint}.");
                return Ok(());
            };
            let status = ledger
                .get(&fingerprint)
                .await?
                .map_or_else(|| "unknown".to_string(), |s| s.to_string());

            println!("\n=== Signal: {} ===", fingerprint);
            println!("Status:     {}", status);
            println!("Direction:  {} {}", signal.direction(), signal.symbol());
            println!("Entries:    {} / {} / {}", signal.upper(), signal.middle(), signal.lower());
            println!("Stop Loss:  {:?}", signal.stop_losses());
            println!("Targets:    {:?}", signal.take_profits());

            let legs = ledger.legs(&fingerprint).await?;
            println!("\n--- Legs ({}) ---", legs.len());
            println!("{:<4} {:<10} {:<10} {:>10} {:>12} {:>12} {:>12}", "LEG", "MODE", "STATE", "TICKET", "ENTRY", "SL", "TP");
            for leg in legs {
                println!(
                    "{:<4} {:<10} {:<10} {:>10} {:>12} {:>12} {:>12}",
                    leg.leg,
                    leg.mode.as_str(),
                    leg.state.as_str(),
                    leg.ticket.map_or_else(|| "-".to_string(), |t| t.to_string()),
                    leg.entry_price,
                    leg.stop_loss,
                    leg.take_profit.map_or_else(|| "runner".to_string(), |tp| tp.to_string()),
                );
            }
        }

        Commands::Ledger { limit } => {
            let entries = ledger.entries(limit).await?;
            if entries.is_empty() {
                println!("No signals recorded. Use 'autotrader submit <file>' to place one.");
                return Ok(());
            }

            println!(
                "\n{:<18} {:<10} {:<5} {:<10} {:<20}",
                "FINGERPRINT", "SYMBOL", "DIR", "STATUS", "UPDATED"
            );
            println!("{}", "-".repeat(66));
            for entry in entries {
                println!(
                    "{:<18} {:<10} {:<5} {:<10} {:<20}",
                    entry.fingerprint.as_str(),
                    entry.symbol,
                    entry.direction.as_str(),
                    entry.status.as_str(),
                    entry.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::Fingerprint { file } => {
            let signal = read_signal(&file).await?;
            println!("{}", signal.fingerprint());
        }

        Commands::Config => {
            let config = TradingConfig::from_env()?;

            println!("\n=== Trading Configuration ===\n");
            println!("Legs:");
            println!("  Legs per Signal:      {}", config.num_legs);
            println!("  First Leg Target:     TP{}", config.first_leg_target);
            println!("  Runner Enabled:       {}", config.runner_enabled);
            println!("  Stop-Loss Mode:       {:?}", config.stop_loss_mode);
            println!("  Stop-Loss Level:      SL{} (fixed mode)", config.stop_loss_level);
            println!("  Leg Volume:           {}", config.leg_volume);

            println!("\nEntry:");
            println!("  Staged Entry:         {:?}", config.staged_entry);
            println!("  Min Limit Distance:   {}", config.min_limit_distance);
            println!("  Block Opposite:       {}", config.block_opposite_positions);

            println!("\nSupervision:");
            println!("  Stop Mode:            {:?}", config.stop_mode);
            println!("  Breakeven Trigger:    {:?} +{}", config.breakeven.trigger, config.breakeven.trigger_offset);
            println!("  Breakeven Lock:       {}", config.breakeven.lock_offset);
            println!("  Trailing Activation:  {}", config.trailing.activation);
            println!("  Trailing Distance:    {}", config.trailing.distance);
            println!("  Final Target:         TP{}", config.final_target_level);
            println!("  Final Target by Price:{}", config.final_target_by_price);

            println!("\nRuntime:");
            println!("  Poll Interval:        {:?}", config.poll_interval());
            println!("  Call Timeout:         {:?}", config.call_timeout());
            println!("  Max Workers:          {}", config.max_workers);
            println!("  Cancel Retry:         {:?} (budget {:?})", config.cancel_retry(), config.cancel_budget());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_quote() {
        let quote = parse_quote("xauusd=2650.10:2650.30").unwrap();
        assert_eq!(quote.symbol, "XAUUSD");
        assert_eq!((quote.bid, quote.ask), (dec!(2650.10), dec!(2650.30)));

        let quote = parse_quote("EURUSD=1.0840").unwrap();
        assert_eq!((quote.bid, quote.ask), (dec!(1.0840), dec!(1.0840)));

        assert!(parse_quote("EURUSD").is_err());
        assert!(parse_quote("EURUSD=1.1:1.0").is_err());
        assert!(parse_quote("EURUSD=abc").is_err());
    }
}
