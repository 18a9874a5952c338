//! Candlecast - headless next-bar price prediction engine
//!
//! Fetches market bars from Binance, fits (or reloads) the per-market
//! normalizers and forest model, then keeps publishing next-bar price
//! predictions on a fixed cadence until stopped.
//!
//! # Usage
//! ```sh
//! SYMBOL=ETH/USDT TIME_FRAME=5m cargo run
//! cargo run -- --symbol BTC/USDT --time-frame 1h
//! ```
//!
//! # Environment Variables
//! - `SYMBOL` - Trading pair to track (default: ETH/USDT)
//! - `TIME_FRAME` - Candle interval (default: 5m)
//! - `REFRESH_INTERVAL_MS` - Refresh cadence in milliseconds (default: 9000)
//! - `MODEL_DIR` - Directory for persisted models and scalers (default: models)

use anyhow::Result;
use candlecast::application::ml::forest::SmartcoreTrainer;
use candlecast::application::scheduler::{PredictionScheduler, SchedulerConfig};
use candlecast::application::session_cache::SessionCache;
use candlecast::config::Config;
use candlecast::domain::events::LoggingListener;
use candlecast::infrastructure::artifact_store::FsArtifactStore;
use candlecast::infrastructure::binance::BinanceMarketData;
use candlecast::infrastructure::event_bus::EventBus;
use candlecast::infrastructure::prediction_log::FilePredictionLog;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trading pair to track, e.g. ETH/USDT (overrides SYMBOL)
    #[arg(long)]
    symbol: Option<String>,

    /// Candle interval, e.g. 5m or 1h (overrides TIME_FRAME)
    #[arg(long)]
    time_frame: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(symbol) = args.symbol {
        config.symbol = symbol;
    }
    if let Some(time_frame) = args.time_frame {
        config.time_frame = time_frame;
    }
    config.validate()?;

    info!("Candlecast {} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Tracking {} {} (lookback {}, history limit {})",
        config.symbol, config.time_frame, config.lookback, config.history_limit
    );

    let fetcher = Arc::new(BinanceMarketData::new(config.binance_base_url.clone()));
    let trainer = Arc::new(SmartcoreTrainer::new(
        config.forest_candidates.clone(),
        config.holdout_fraction,
    ));
    let store = Arc::new(FsArtifactStore::new(&config.model_dir)?);
    let log = Arc::new(FilePredictionLog::new(&config.prediction_log));

    let cache = Arc::new(SessionCache::new(
        fetcher.clone(),
        trainer.clone(),
        store,
        config.history_limit,
        config.lookback,
    ));

    let events = EventBus::new();
    events.subscribe(Arc::new(LoggingListener)).await;

    let (command_tx, command_rx) = mpsc::channel(16);
    let scheduler = Arc::new(PredictionScheduler::new(
        cache,
        fetcher,
        trainer,
        log,
        events,
        SchedulerConfig {
            interval: config.refresh_interval,
            lookback: config.lookback,
            ticker_symbols: config.ticker_symbols.clone(),
        },
        command_tx,
    ));

    scheduler.start(config.initial_key()).await?;

    let command_loop = Arc::clone(&scheduler);
    tokio::spawn(async move {
        command_loop.run(command_rx).await;
    });

    info!("Engine running. Press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting...");
    scheduler.stop();

    Ok(())
}
