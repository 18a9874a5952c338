use crate::domain::errors::SeriesError;
use crate::domain::normalizer::NormalizerSet;
use crate::domain::ports::PredictionModel;
use crate::domain::series::{SeriesSnapshot, SlidingSeries};
use crate::domain::types::Channel;
use anyhow::Result;
use ndarray::{Array1, Array2, Array3, Axis, s};

/// One normalized model input of shape (lookback, channels).
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceWindow {
    data: Array2<f64>,
}

impl InferenceWindow {
    pub fn lookback(&self) -> usize {
        self.data.nrows()
    }

    pub fn channels(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Row-major flattening (bar by bar, channels within a bar) for
    /// regressors that take a flat feature vector.
    pub fn flattened(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }
}

/// Normalized training windows plus their next-bar price labels.
///
/// `windows` has shape (examples, lookback, channels) and label `i` is the
/// normalized price immediately after window `i`, so examples are in
/// chronological order and example count is `history length - lookback`.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    windows: Array3<f64>,
    targets: Array1<f64>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.windows.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookback(&self) -> usize {
        self.windows.shape()[1]
    }

    pub fn windows(&self) -> &Array3<f64> {
        &self.windows
    }

    pub fn targets(&self) -> &Array1<f64> {
        &self.targets
    }

    pub fn example(&self, index: usize) -> InferenceWindow {
        InferenceWindow {
            data: self.windows.index_axis(Axis(0), index).to_owned(),
        }
    }

    pub fn target(&self, index: usize) -> f64 {
        self.targets[index]
    }

    /// Flatten every window into one row, for matrix-based trainers.
    pub fn flattened(&self) -> Vec<Vec<f64>> {
        (0..self.len())
            .map(|i| self.windows.index_axis(Axis(0), i).iter().copied().collect())
            .collect()
    }

    /// Split chronologically: the first `count` examples and the rest.
    pub fn split_at(&self, count: usize) -> (TrainingSet, TrainingSet) {
        let count = count.min(self.len());
        let head = TrainingSet {
            windows: self.windows.slice(s![..count, .., ..]).to_owned(),
            targets: self.targets.slice(s![..count]).to_owned(),
        };
        let tail = TrainingSet {
            windows: self.windows.slice(s![count.., .., ..]).to_owned(),
            targets: self.targets.slice(s![count..]).to_owned(),
        };
        (head, tail)
    }

    /// Mean squared error of a model's predictions over this set, in
    /// normalized price space.
    pub fn mean_squared_error(&self, model: &dyn PredictionModel) -> Result<f64> {
        if self.is_empty() {
            return Err(SeriesError::InsufficientData { have: 0, need: 1 }.into());
        }

        let mut squared_error = 0.0;
        for i in 0..self.len() {
            let predicted = model.predict(&self.example(i))?;
            squared_error += (predicted - self.target(i)).powi(2);
        }
        Ok(squared_error / self.len() as f64)
    }
}

/// Builds fixed-shape model inputs from a history snapshot and the session's
/// fitted normalizers. Channel order is fixed by `Channel::ALL`.
pub struct FeatureBuilder;

impl FeatureBuilder {
    /// Every complete (window, next price) pair in the snapshot.
    pub fn build_training_set(
        snapshot: &SeriesSnapshot,
        normalizers: &NormalizerSet,
        lookback: usize,
    ) -> Result<TrainingSet, SeriesError> {
        let length = snapshot.len();
        if length <= lookback {
            return Err(SeriesError::InsufficientData {
                have: length,
                need: lookback + 1,
            });
        }

        let normalized = Self::normalize_channels(snapshot, normalizers);
        let examples = length - lookback;

        let mut windows = Array3::zeros((examples, lookback, Channel::COUNT));
        let mut targets = Array1::zeros(examples);
        for e in 0..examples {
            for (c, channel_values) in normalized.iter().enumerate() {
                for (r, &value) in channel_values[e..e + lookback].iter().enumerate() {
                    windows[[e, r, c]] = value;
                }
            }
            targets[e] = normalized[Channel::Price.index()][e + lookback];
        }

        Ok(TrainingSet { windows, targets })
    }

    /// The newest `lookback` bars as one normalized inference input.
    pub fn build_inference_window(
        series: &SlidingSeries,
        normalizers: &NormalizerSet,
        lookback: usize,
    ) -> Result<InferenceWindow, SeriesError> {
        let snapshot = series.snapshot_window(lookback)?;
        let normalized = Self::normalize_channels(&snapshot, normalizers);

        let mut data = Array2::zeros((lookback, Channel::COUNT));
        for (c, channel_values) in normalized.iter().enumerate() {
            for (r, &value) in channel_values.iter().enumerate() {
                data[[r, c]] = value;
            }
        }
        Ok(InferenceWindow { data })
    }

    fn normalize_channels(
        snapshot: &SeriesSnapshot,
        normalizers: &NormalizerSet,
    ) -> [Vec<f64>; Channel::COUNT] {
        Channel::ALL.map(|channel| {
            let normalizer = normalizers.get(channel);
            snapshot
                .channel(channel)
                .iter()
                .map(|&v| normalizer.forward(v))
                .collect()
        })
    }
}
