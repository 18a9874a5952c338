use crate::domain::features::FeatureBuilder;
use crate::domain::normalizer::NormalizerSet;
use crate::domain::ports::PredictionModel;
use crate::domain::series::SlidingSeries;
use crate::domain::types::SessionKey;
use anyhow::Result;
use std::sync::Arc;

/// Everything needed to predict for one (symbol, time frame): the fitted
/// normalizers, the trained model and the rolling bar history.
///
/// Sessions are built and installed only by the `SessionCache`; everyone
/// else holds an `Arc` plus the generation they observed it at. Normalizers
/// and model never change after installation, so a prediction made against
/// a session is internally consistent by construction.
pub struct Session {
    pub key: SessionKey,
    /// Monotonic per-key build counter, used for staleness checks.
    pub generation: u64,
    pub normalizers: NormalizerSet,
    pub model: Arc<dyn PredictionModel>,
    pub series: SlidingSeries,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Run one inference over the newest `lookback` bars and return the
    /// denormalized next-bar price.
    pub fn predict_next_price(&self, lookback: usize) -> Result<f64> {
        let window = FeatureBuilder::build_inference_window(&self.series, &self.normalizers, lookback)?;
        let normalized = self.model.predict(&window)?;
        Ok(self.normalizers.price().inverse(normalized))
    }
}
