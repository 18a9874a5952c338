use crate::domain::features::{InferenceWindow, TrainingSet};
use crate::domain::types::{Bar, Channel, PredictionRecord, SessionKey};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Artifact slot the trained model is stored under. The five normalizer
/// slots come from `Channel::artifact_slot`.
pub const MODEL_SLOT: &str = "model";

/// Read side of the exchange. Failures are transient by contract; callers
/// log and retry on their next scheduled cycle.
#[async_trait]
pub trait MarketDataFetcher: Send + Sync {
    /// Up to `limit` most recent bars for the key, ordered oldest to newest.
    async fn fetch_history(&self, key: &SessionKey, limit: usize) -> Result<Vec<Bar>>;

    /// The newest bar for the key. May still be forming; its timestamp only
    /// changes when a new bar opens.
    async fn fetch_latest_bar(&self, key: &SessionKey) -> Result<Bar>;

    /// Last traded price for a symbol.
    async fn fetch_ticker(&self, symbol: &str) -> Result<f64>;
}

/// A trained next-bar regressor. Input is one normalized
/// (lookback, channels) window; output is the next normalized price.
pub trait PredictionModel: Send + Sync {
    fn predict(&self, window: &InferenceWindow) -> Result<f64>;

    /// Window length this model was trained on.
    fn lookback(&self) -> usize;

    /// Opaque serialized form, persisted through the ArtifactStore.
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Model construction capability. The engine never looks inside: it hands
/// over a training set and gets back something that predicts.
#[async_trait]
pub trait ModelTrainer: Send + Sync {
    async fn train(&self, set: &TrainingSet) -> Result<Arc<dyn PredictionModel>>;

    /// Rebuild a model from the payload `PredictionModel::to_bytes` produced.
    fn load(&self, payload: &[u8]) -> Result<Arc<dyn PredictionModel>>;

    /// Chronological train/holdout split. The trainer owns the policy; the
    /// accuracy refresh never invents its own.
    fn holdout_split(&self, set: TrainingSet) -> (TrainingSet, TrainingSet);
}

/// Durable blob store for fitted normalizers and trained models, addressed
/// by (session key, slot).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Ok(None) means the artifact is absent, which is a miss, not an error.
    async fn load(&self, key: &SessionKey, slot: &str) -> Result<Option<Vec<u8>>>;

    async fn save(&self, key: &SessionKey, slot: &str, bytes: &[u8]) -> Result<()>;
}

/// Append-only sink for prediction records.
#[async_trait]
pub trait PredictionLog: Send + Sync {
    async fn append(&self, record: &PredictionRecord) -> Result<()>;
}

/// Consistency tag persisted with a trained model: the window shape it was
/// trained on plus the normalizer ranges its inputs were scaled with. A
/// stored model whose tag does not match the current session is retrained
/// instead of loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTag {
    pub lookback: usize,
    pub channels: usize,
    pub fingerprint: [(f64, f64); Channel::COUNT],
}

/// Envelope written to the model artifact slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub tag: ModelTag,
    pub payload: Vec<u8>,
}
