use crate::domain::types::SessionKey;
use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Engine configuration, read from environment variables with defaults
/// suitable for the ETH/USDT 5m market.
#[derive(Debug, Clone)]
pub struct Config {
    /// Trading pair of the initially active session, e.g. "ETH/USDT".
    pub symbol: String,
    /// Candle granularity in the exchange's interval notation ("5m", "1h").
    pub time_frame: String,
    /// Bars per model input window.
    pub lookback: usize,
    /// Bars fetched at session build time and retained in the sliding history.
    pub history_limit: usize,
    /// Cadence shared by the ticker, prediction and accuracy tasks.
    pub refresh_interval: Duration,
    /// Directory the fitted normalizers and trained models are stored in.
    pub model_dir: String,
    /// File prediction records are appended to.
    pub prediction_log: String,
    /// Symbols the ticker task polls spot prices for.
    pub ticker_symbols: Vec<String>,
    pub binance_base_url: String,
    /// Fraction of training examples held out for accuracy evaluation.
    pub holdout_fraction: f64,
    /// Tree counts tried during forest training; lowest holdout MSE wins.
    pub forest_candidates: Vec<usize>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let symbol = env::var("SYMBOL").unwrap_or_else(|_| "ETH/USDT".to_string());
        let time_frame = env::var("TIME_FRAME").unwrap_or_else(|_| "5m".to_string());

        let lookback = env::var("LOOKBACK")
            .unwrap_or_else(|_| "94".to_string())
            .parse::<usize>()
            .context("Failed to parse LOOKBACK")?;

        let history_limit = env::var("HISTORY_LIMIT")
            .unwrap_or_else(|_| "12000".to_string())
            .parse::<usize>()
            .context("Failed to parse HISTORY_LIMIT")?;

        let refresh_interval_ms = env::var("REFRESH_INTERVAL_MS")
            .unwrap_or_else(|_| "9000".to_string())
            .parse::<u64>()
            .context("Failed to parse REFRESH_INTERVAL_MS")?;

        let model_dir = env::var("MODEL_DIR").unwrap_or_else(|_| "models".to_string());

        let prediction_log =
            env::var("PREDICTION_LOG").unwrap_or_else(|_| "predicted_prices.txt".to_string());

        let ticker_symbols_str =
            env::var("TICKER_SYMBOLS").unwrap_or_else(|_| "BTC/USDT,ETH/USDT".to_string());
        let ticker_symbols: Vec<String> = ticker_symbols_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let binance_base_url = env::var("BINANCE_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        let holdout_fraction = env::var("HOLDOUT_FRACTION")
            .unwrap_or_else(|_| "0.2".to_string())
            .parse::<f64>()
            .context("Failed to parse HOLDOUT_FRACTION")?;

        let forest_candidates_str =
            env::var("FOREST_CANDIDATES").unwrap_or_else(|_| "64,128".to_string());
        let forest_candidates: Vec<usize> = forest_candidates_str
            .split(',')
            .map(|s| {
                s.trim().parse::<usize>().with_context(|| {
                    format!("Failed to parse FOREST_CANDIDATES entry '{}'", s.trim())
                })
            })
            .collect::<Result<_>>()?;

        let config = Self {
            symbol,
            time_frame,
            lookback,
            history_limit,
            refresh_interval: Duration::from_millis(refresh_interval_ms),
            model_dir,
            prediction_log,
            ticker_symbols,
            binance_base_url,
            holdout_fraction,
            forest_candidates,
        };
        config.validate()?;
        Ok(config)
    }

    /// Bounds that keep the pipeline arithmetic sound.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            anyhow::bail!("SYMBOL must not be empty");
        }
        if self.time_frame.is_empty() {
            anyhow::bail!("TIME_FRAME must not be empty");
        }
        if self.lookback == 0 {
            anyhow::bail!("LOOKBACK must be positive");
        }
        if self.history_limit <= self.lookback {
            anyhow::bail!(
                "HISTORY_LIMIT ({}) must exceed LOOKBACK ({})",
                self.history_limit,
                self.lookback
            );
        }
        if self.refresh_interval.is_zero() {
            anyhow::bail!("REFRESH_INTERVAL_MS must be positive");
        }
        if !(0.0..1.0).contains(&self.holdout_fraction) {
            anyhow::bail!(
                "HOLDOUT_FRACTION must be in [0, 1), got {}",
                self.holdout_fraction
            );
        }
        if self.forest_candidates.is_empty() {
            anyhow::bail!("FOREST_CANDIDATES must name at least one tree count");
        }
        if self.forest_candidates.iter().any(|&n| n == 0) {
            anyhow::bail!("FOREST_CANDIDATES entries must be positive");
        }
        Ok(())
    }

    /// The session the engine starts on.
    pub fn initial_key(&self) -> SessionKey {
        SessionKey::new(self.symbol.clone(), self.time_frame.clone())
    }
}
