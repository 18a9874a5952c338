//! Scriptable in-memory implementations of the engine's ports, for tests
//! and offline runs.

use crate::domain::errors::ModelError;
use crate::domain::events::{EngineEvent, EventListener};
use crate::domain::features::{InferenceWindow, TrainingSet};
use crate::domain::ports::{
    ArtifactStore, MarketDataFetcher, ModelTrainer, PredictionLog, PredictionModel,
};
use crate::domain::types::{Bar, Channel, PredictionRecord, SessionKey};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Deterministic wavy OHLCV bars: every channel covers a non-degenerate
/// range, so normalizers always fit.
pub fn synthetic_bars(count: usize, start_ts: i64, step_ms: i64) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let base = 2_000.0 + i as f64 * 1.5 + (i as f64 * 0.9).sin() * 40.0;
            Bar {
                timestamp: start_ts + i as i64 * step_ms,
                open: base - 2.0,
                high: base + 5.0,
                low: base - 6.0,
                close: base,
                volume: 500.0 + (i as f64 * 0.4).cos().abs() * 120.0,
            }
        })
        .collect()
}

/// Fetcher backed by scripted per-key bars. Unscripted lookups fail, which
/// doubles as the transient-error case.
pub struct MockDataFetcher {
    histories: RwLock<HashMap<SessionKey, Vec<Bar>>>,
    latest: RwLock<HashMap<SessionKey, Bar>>,
    tickers: RwLock<HashMap<String, f64>>,
    history_delay: RwLock<Duration>,
    latest_delay: RwLock<Duration>,
    history_calls: AtomicUsize,
    latest_calls: AtomicUsize,
    ticker_calls: AtomicUsize,
}

impl MockDataFetcher {
    pub fn new() -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            tickers: RwLock::new(HashMap::new()),
            history_delay: RwLock::new(Duration::ZERO),
            latest_delay: RwLock::new(Duration::ZERO),
            history_calls: AtomicUsize::new(0),
            latest_calls: AtomicUsize::new(0),
            ticker_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_history(&self, key: &SessionKey, bars: Vec<Bar>) {
        self.histories.write().await.insert(key.clone(), bars);
    }

    /// Override the bar `fetch_latest_bar` returns. Without an override the
    /// newest scripted history bar is served.
    pub async fn set_latest_bar(&self, key: &SessionKey, bar: Bar) {
        self.latest.write().await.insert(key.clone(), bar);
    }

    pub async fn set_ticker_price(&self, symbol: &str, price: f64) {
        self.tickers.write().await.insert(symbol.to_string(), price);
    }

    /// Delay every history fetch, for races that need a slow build.
    pub async fn set_history_delay(&self, delay: Duration) {
        *self.history_delay.write().await = delay;
    }

    pub async fn set_latest_delay(&self, delay: Duration) {
        *self.latest_delay.write().await = delay;
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }

    pub fn ticker_calls(&self) -> usize {
        self.ticker_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockDataFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataFetcher for MockDataFetcher {
    async fn fetch_history(&self, key: &SessionKey, limit: usize) -> Result<Vec<Bar>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.history_delay.read().await;
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let histories = self.histories.read().await;
        let bars = histories
            .get(key)
            .ok_or_else(|| anyhow!("no history scripted for {}", key))?;
        let skip = bars.len().saturating_sub(limit);
        Ok(bars[skip..].to_vec())
    }

    async fn fetch_latest_bar(&self, key: &SessionKey) -> Result<Bar> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.latest_delay.read().await;
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        if let Some(bar) = self.latest.read().await.get(key) {
            return Ok(*bar);
        }
        self.histories
            .read()
            .await
            .get(key)
            .and_then(|bars| bars.last().copied())
            .ok_or_else(|| anyhow!("no latest bar scripted for {}", key))
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<f64> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        self.tickers
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no ticker price scripted for {}", symbol))
    }
}

/// Transparent stand-in model: predicts the normalized price of the
/// window's newest bar, so the inverse transform yields exactly the latest
/// close. That makes scheduler assertions exact.
#[derive(Debug, Serialize, Deserialize)]
pub struct LastPriceModel {
    pub lookback: usize,
}

impl PredictionModel for LastPriceModel {
    fn predict(&self, window: &InferenceWindow) -> Result<f64> {
        if window.lookback() != self.lookback {
            return Err(ModelError::WindowMismatch {
                expected: self.lookback,
                actual: window.lookback(),
            }
            .into());
        }
        Ok(window.data()[[self.lookback - 1, Channel::Price.index()]])
    }

    fn lookback(&self) -> usize {
        self.lookback
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Trainer that hands out `LastPriceModel`s and counts invocations.
pub struct MockTrainer {
    train_calls: AtomicUsize,
}

impl MockTrainer {
    pub fn new() -> Self {
        Self {
            train_calls: AtomicUsize::new(0),
        }
    }

    pub fn train_calls(&self) -> usize {
        self.train_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelTrainer for MockTrainer {
    async fn train(&self, set: &TrainingSet) -> Result<Arc<dyn PredictionModel>> {
        self.train_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LastPriceModel {
            lookback: set.lookback(),
        }))
    }

    fn load(&self, payload: &[u8]) -> Result<Arc<dyn PredictionModel>> {
        let model: LastPriceModel = serde_json::from_slice(payload)?;
        Ok(Arc::new(model))
    }

    fn holdout_split(&self, set: TrainingSet) -> (TrainingSet, TrainingSet) {
        let train_len = (set.len() as f64 * 0.8).floor() as usize;
        set.split_at(train_len)
    }
}

/// Artifact store over a HashMap, keyed by (session, slot).
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<(SessionKey, String), Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn slot_count(&self) -> usize {
        self.blobs.read().await.len()
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn load(&self, key: &SessionKey, slot: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(&(key.clone(), slot.to_string())).cloned())
    }

    async fn save(&self, key: &SessionKey, slot: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert((key.clone(), slot.to_string()), bytes.to_vec());
        Ok(())
    }
}

/// Prediction log that keeps records in memory for assertions.
pub struct MemoryPredictionLog {
    records: RwLock<Vec<PredictionRecord>>,
}

impl MemoryPredictionLog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    pub async fn records(&self) -> Vec<PredictionRecord> {
        self.records.read().await.clone()
    }
}

impl Default for MemoryPredictionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PredictionLog for MemoryPredictionLog {
    async fn append(&self, record: &PredictionRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

/// Listener that collects every published event.
pub struct CollectingListener {
    events: std::sync::Mutex<Vec<EngineEvent>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for CollectingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListener for CollectingListener {
    fn on_event(&self, event: &EngineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
