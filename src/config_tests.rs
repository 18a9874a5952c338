use crate::config::Config;
use std::env;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

// Global lock to prevent race conditions when modifying environment variables in tests
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn get_env_lock() -> &'static Mutex<()> {
    ENV_LOCK.get_or_init(|| Mutex::new(()))
}

const ALL_VARS: &[&str] = &[
    "SYMBOL",
    "TIME_FRAME",
    "LOOKBACK",
    "HISTORY_LIMIT",
    "REFRESH_INTERVAL_MS",
    "MODEL_DIR",
    "PREDICTION_LOG",
    "TICKER_SYMBOLS",
    "BINANCE_BASE_URL",
    "HOLDOUT_FRACTION",
    "FOREST_CANDIDATES",
];

fn clear_vars() {
    for var in ALL_VARS {
        unsafe { env::remove_var(var) };
    }
}

#[test]
fn test_defaults_when_env_unset() {
    let _guard = get_env_lock().lock().unwrap();
    clear_vars();

    let config = Config::from_env().unwrap();

    assert_eq!(config.symbol, "ETH/USDT");
    assert_eq!(config.time_frame, "5m");
    assert_eq!(config.lookback, 94);
    assert_eq!(config.history_limit, 12_000);
    assert_eq!(config.refresh_interval, Duration::from_millis(9_000));
    assert_eq!(config.model_dir, "models");
    assert_eq!(config.prediction_log, "predicted_prices.txt");
    assert_eq!(config.ticker_symbols, vec!["BTC/USDT", "ETH/USDT"]);
    assert_eq!(config.binance_base_url, "https://api.binance.com");
    assert!((config.holdout_fraction - 0.2).abs() < 1e-12);
    assert_eq!(config.forest_candidates, vec![64, 128]);

    let key = config.initial_key();
    assert_eq!(key.symbol, "ETH/USDT");
    assert_eq!(key.time_frame, "5m");
}

#[test]
fn test_env_overrides_are_applied() {
    let _guard = get_env_lock().lock().unwrap();
    clear_vars();

    unsafe {
        env::set_var("SYMBOL", "SOL/USDT");
        env::set_var("TIME_FRAME", "1h");
        env::set_var("LOOKBACK", "50");
        env::set_var("HISTORY_LIMIT", "600");
        env::set_var("REFRESH_INTERVAL_MS", "2500");
        env::set_var("TICKER_SYMBOLS", "SOL/USDT, ADA/USDT ,");
        env::set_var("FOREST_CANDIDATES", "32");
    }

    let config = Config::from_env().unwrap();

    assert_eq!(config.symbol, "SOL/USDT");
    assert_eq!(config.time_frame, "1h");
    assert_eq!(config.lookback, 50);
    assert_eq!(config.history_limit, 600);
    assert_eq!(config.refresh_interval, Duration::from_millis(2_500));
    // Whitespace is trimmed and empty entries dropped.
    assert_eq!(config.ticker_symbols, vec!["SOL/USDT", "ADA/USDT"]);
    assert_eq!(config.forest_candidates, vec![32]);

    clear_vars();
}

#[test]
fn test_unparseable_number_is_an_error() {
    let _guard = get_env_lock().lock().unwrap();
    clear_vars();

    unsafe { env::set_var("LOOKBACK", "ninety-four") };
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("LOOKBACK"));

    clear_vars();
}

fn base_config() -> Config {
    Config {
        symbol: "ETH/USDT".to_string(),
        time_frame: "5m".to_string(),
        lookback: 94,
        history_limit: 12_000,
        refresh_interval: Duration::from_millis(9_000),
        model_dir: "models".to_string(),
        prediction_log: "predicted_prices.txt".to_string(),
        ticker_symbols: vec!["BTC/USDT".to_string()],
        binance_base_url: "https://api.binance.com".to_string(),
        holdout_fraction: 0.2,
        forest_candidates: vec![64, 128],
    }
}

#[test]
fn test_validate_rejects_history_not_exceeding_lookback() {
    let mut config = base_config();
    config.history_limit = 94;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("HISTORY_LIMIT"));
}

#[test]
fn test_validate_rejects_out_of_range_holdout() {
    let mut config = base_config();
    config.holdout_fraction = 1.0;
    assert!(config.validate().is_err());

    config.holdout_fraction = -0.1;
    assert!(config.validate().is_err());

    config.holdout_fraction = 0.0;
    assert!(config.validate().is_ok());
}

#[test]
fn test_validate_rejects_empty_forest_candidates() {
    let mut config = base_config();
    config.forest_candidates.clear();
    assert!(config.validate().is_err());

    config.forest_candidates = vec![64, 0];
    assert!(config.validate().is_err());
}
