use crate::domain::errors::ModelError;
use crate::domain::features::{InferenceWindow, TrainingSet};
use crate::domain::ports::{ModelTrainer, PredictionModel};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::sync::Arc;
use tracing::{debug, info};

type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Random-forest regressor over flattened (lookback, channels) windows.
/// Serializes together with the lookback it was trained on so a reloaded
/// model can refuse inputs of the wrong shape.
#[derive(Serialize, Deserialize)]
pub struct ForestModel {
    forest: Forest,
    lookback: usize,
}

impl PredictionModel for ForestModel {
    fn predict(&self, window: &InferenceWindow) -> Result<f64> {
        if window.lookback() != self.lookback {
            return Err(ModelError::WindowMismatch {
                expected: self.lookback,
                actual: window.lookback(),
            }
            .into());
        }

        let matrix = DenseMatrix::from_2d_vec(&vec![window.flattened()])
            .map_err(|e| anyhow!("Failed to build feature matrix: {}", e))?;
        let predictions = self
            .forest
            .predict(&matrix)
            .map_err(|e| anyhow!("Forest prediction failed: {}", e))?;
        predictions
            .first()
            .copied()
            .ok_or_else(|| anyhow!("Forest returned no prediction"))
    }

    fn lookback(&self) -> usize {
        self.lookback
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            ModelError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Trains one forest per configured tree count and keeps the candidate with
/// the lowest holdout MSE. Fitting runs on the blocking pool; tree training
/// can take seconds on a full history.
pub struct SmartcoreTrainer {
    candidates: Vec<usize>,
    holdout_fraction: f64,
}

impl SmartcoreTrainer {
    pub fn new(candidates: Vec<usize>, holdout_fraction: f64) -> Self {
        Self {
            candidates,
            holdout_fraction,
        }
    }
}

#[async_trait]
impl ModelTrainer for SmartcoreTrainer {
    async fn train(&self, set: &TrainingSet) -> Result<Arc<dyn PredictionModel>> {
        let lookback = set.lookback();
        let (fit_set, holdout) = self.holdout_split(set.clone());
        let candidates = self.candidates.clone();

        let model = tokio::task::spawn_blocking(move || -> Result<ForestModel> {
            let features = DenseMatrix::from_2d_vec(&fit_set.flattened())
                .map_err(|e| anyhow!("Failed to build training matrix: {}", e))?;
            let targets = fit_set.targets().to_vec();

            let mut best: Option<(f64, usize, ForestModel)> = None;
            for n_trees in candidates {
                let params = RandomForestRegressorParameters::default()
                    .with_n_trees(n_trees)
                    .with_max_depth(10)
                    .with_min_samples_split(5);
                let forest = RandomForestRegressor::fit(&features, &targets, params)
                    .map_err(|e| anyhow!("Forest training failed: {}", e))?;
                let candidate = ForestModel { forest, lookback };

                // Tiny histories can leave the holdout empty; score on the
                // fit set then rather than skipping selection.
                let score_set = if holdout.is_empty() { &fit_set } else { &holdout };
                let mse = score_set.mean_squared_error(&candidate)?;
                debug!("SmartcoreTrainer: {} trees scored MSE {:.6}", n_trees, mse);

                let improves = best
                    .as_ref()
                    .map(|(best_mse, _, _)| mse < *best_mse)
                    .unwrap_or(true);
                if improves {
                    best = Some((mse, n_trees, candidate));
                }
            }

            let (mse, n_trees, model) =
                best.ok_or_else(|| anyhow!("No forest candidates configured"))?;
            info!(
                "SmartcoreTrainer: Selected {} trees (holdout MSE {:.6})",
                n_trees, mse
            );
            Ok(model)
        })
        .await
        .context("Forest training task panicked")??;

        Ok(Arc::new(model))
    }

    fn load(&self, payload: &[u8]) -> Result<Arc<dyn PredictionModel>> {
        let model: ForestModel = serde_json::from_slice(payload).map_err(|e| {
            ModelError::Serialization {
                reason: e.to_string(),
            }
        })?;
        Ok(Arc::new(model))
    }

    fn holdout_split(&self, set: TrainingSet) -> (TrainingSet, TrainingSet) {
        let train_len = (set.len() as f64 * (1.0 - self.holdout_fraction)).floor() as usize;
        set.split_at(train_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::features::FeatureBuilder;
    use crate::domain::normalizer::NormalizerSet;
    use crate::domain::series::SeriesSnapshot;
    use crate::domain::types::Bar;

    fn wavy_bars(count: usize) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let base = 100.0 + i as f64 + (i as f64 * 0.7).sin() * 3.0;
                Bar {
                    timestamp: i as i64 * 60_000,
                    open: base - 0.4,
                    high: base + 1.2,
                    low: base - 1.1,
                    close: base,
                    volume: 900.0 + (i as f64 * 1.3).cos().abs() * 200.0,
                }
            })
            .collect()
    }

    fn training_set(count: usize, lookback: usize) -> (TrainingSet, NormalizerSet) {
        let bars = wavy_bars(count);
        let snapshot = SeriesSnapshot::from_bars(&bars);
        let normalizers = NormalizerSet::fit(&snapshot).unwrap();
        let set = FeatureBuilder::build_training_set(&snapshot, &normalizers, lookback).unwrap();
        (set, normalizers)
    }

    #[test]
    fn test_holdout_split_is_chronological_and_proportional() {
        let (set, _) = training_set(24, 4);
        assert_eq!(set.len(), 20);

        let trainer = SmartcoreTrainer::new(vec![8], 0.2);
        let (train, holdout) = trainer.holdout_split(set.clone());
        assert_eq!(train.len(), 16);
        assert_eq!(holdout.len(), 4);
        assert_eq!(train.target(15), set.target(15));
        assert_eq!(holdout.target(0), set.target(16));
    }

    #[tokio::test]
    async fn test_trained_forest_predicts_in_normalized_range() {
        let (set, _) = training_set(40, 5);
        let trainer = SmartcoreTrainer::new(vec![8], 0.2);

        let model = trainer.train(&set).await.unwrap();
        assert_eq!(model.lookback(), 5);

        let predicted = model.predict(&set.example(0)).unwrap();
        assert!(predicted.is_finite());
        // Forest outputs average training labels, which all sit in [0, 1].
        assert!((-0.5..=1.5).contains(&predicted));
    }

    #[tokio::test]
    async fn test_serialized_model_reloads_identically() {
        let (set, _) = training_set(40, 5);
        let trainer = SmartcoreTrainer::new(vec![8], 0.2);

        let model = trainer.train(&set).await.unwrap();
        let payload = model.to_bytes().unwrap();
        let reloaded = trainer.load(&payload).unwrap();

        assert_eq!(reloaded.lookback(), 5);
        let window = set.example(3);
        assert_eq!(
            model.predict(&window).unwrap(),
            reloaded.predict(&window).unwrap()
        );
    }

    #[tokio::test]
    async fn test_predict_rejects_wrong_window_shape() {
        let (set, _) = training_set(40, 5);
        let trainer = SmartcoreTrainer::new(vec![8], 0.2);
        let model = trainer.train(&set).await.unwrap();

        let (short_set, _) = training_set(40, 3);
        let err = model.predict(&short_set.example(0)).unwrap_err();
        match err.downcast_ref::<ModelError>() {
            Some(ModelError::WindowMismatch { expected, actual }) => {
                assert_eq!(*expected, 5);
                assert_eq!(*actual, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
