//! Grid engine - main entry point
//!
//! This binary provides two subcommands:
//! - validate: Load and validate a strategy configuration
//! - run: Run the engine (paper trading against a simulated random walk)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grid_engine::engine::{Engine, EngineEvent, OrderUpdateKind};
use grid_engine::exchange::PaperExchange;
use grid_engine::StrategyConfig;

#[derive(Parser, Debug)]
#[command(name = "grid-engine")]
#[command(about = "Grid trading strategy engine with risk coordination", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a configuration file and report validation errors
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/btc_grid.json")]
        config: String,
    },

    /// Run the engine
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/btc_grid.json")]
        config: String,

        /// Paper trading mode (simulated exchange, no real money)
        #[arg(long)]
        paper: bool,

        /// Paper account starting cash
        #[arg(long, default_value = "10000.0")]
        cash: f64,

        /// Paper market starting price
        #[arg(long, default_value = "50000.0")]
        start_price: f64,

        /// Milliseconds between simulated price ticks
        #[arg(long, default_value = "500")]
        tick_ms: u64,

        /// Seconds between status/reconciliation timer events
        #[arg(long, default_value = "30")]
        timer_secs: u64,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Validate { .. } => "validate",
        Commands::Run { .. } => "run",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Validate { config } => {
            let cfg = StrategyConfig::from_file(&config)?;
            info!(
                symbol = %cfg.symbol,
                levels = cfg.levels,
                "configuration valid"
            );
            println!("OK: {config}");
            Ok(())
        }
        Commands::Run {
            config,
            paper,
            cash,
            start_price,
            tick_ms,
            timer_secs,
        } => {
            let cfg = StrategyConfig::from_file(&config)?;
            if !paper {
                anyhow::bail!(
                    "no live exchange transport is wired up in this build; run with --paper"
                );
            }
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_paper(cfg, cash, start_price, tick_ms, timer_secs))
        }
    }
}

/// Paper session: random-walk price feed, simulated fills, periodic account
/// snapshots and timer events, ctrl-c for graceful shutdown.
async fn run_paper(
    config: StrategyConfig,
    cash: f64,
    start_price: f64,
    tick_ms: u64,
    timer_secs: u64,
) -> Result<()> {
    info!(symbol = %config.symbol, cash, start_price, "starting paper session");
    let paper = Arc::new(PaperExchange::new(cash, start_price));
    let (mut engine, tx) = Engine::new(config, paper.clone());

    let feed_tx = tx.clone();
    let feed_paper = paper.clone();
    let feed = tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut price = start_price;
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
        loop {
            ticker.tick().await;
            // +/- 0.4% per tick random walk
            price *= 1.0 + rng.gen_range(-0.004..0.004);
            for fill in feed_paper.mark_price(price) {
                let update = EngineEvent::OrderUpdate {
                    client_order_id: fill.client_order_id,
                    kind: OrderUpdateKind::Filled {
                        price: fill.price,
                        size: fill.size,
                    },
                };
                if feed_tx.send(update).await.is_err() {
                    return;
                }
            }
            let tick = EngineEvent::PriceTick {
                timestamp: Utc::now(),
                price,
            };
            if feed_tx.send(tick).await.is_err() {
                return;
            }
            let account = EngineEvent::Account(feed_paper.account_snapshot());
            if feed_tx.send(account).await.is_err() {
                return;
            }
        }
    });

    let timer_tx = tx.clone();
    let timer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(timer_secs.max(1)));
        ticker.tick().await; // first tick is immediate, skip it
        loop {
            ticker.tick().await;
            if timer_tx.send(EngineEvent::Timer).await.is_err() {
                return;
            }
        }
    });

    let shutdown_tx = tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, requesting shutdown");
            let _ = shutdown_tx.send(EngineEvent::Shutdown).await;
        }
    });

    let result = engine.run().await;
    feed.abort();
    timer.abort();

    let status = engine.status();
    let snapshot = paper.account_snapshot();
    info!(
        executed_trades = status.executed_trades,
        realized_spread_pnl = %status.realized_spread_pnl,
        final_value = snapshot.account_value,
        realized_pnl = snapshot.realized_pnl,
        "paper session finished"
    );
    result
}
