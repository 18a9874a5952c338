use crate::domain::errors::FitError;
use crate::domain::series::SeriesSnapshot;
use crate::domain::types::Channel;
use serde::{Deserialize, Serialize};

/// A fitted min-max transform for one feature channel.
///
/// Construction goes through `fit` (or a persisted artifact), and a fitted
/// normalizer is never mutated: a session keeps the ranges it was built with
/// until the whole session is replaced. `max > min` holds by construction,
/// so `forward` maps the fitted range onto [0, 1] and `inverse` is its exact
/// algebraic inverse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeNormalizer {
    min: f64,
    max: f64,
}

impl RangeNormalizer {
    /// Fit over one channel of a history snapshot.
    pub fn fit(channel: Channel, values: &[f64]) -> Result<Self, FitError> {
        if values.is_empty() {
            return Err(FitError::EmptyChannel { channel });
        }

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &value in values {
            if value < min {
                min = value;
            }
            if value > max {
                max = value;
            }
        }

        // Catches constant channels and non-finite poisoned bounds alike.
        if !(max > min) {
            return Err(FitError::DegenerateRange { channel, min, max });
        }

        Ok(Self { min, max })
    }

    /// Map a raw value into normalized space.
    pub fn forward(&self, value: f64) -> f64 {
        (value - self.min) / (self.max - self.min)
    }

    /// Map a normalized value back into the raw scale.
    pub fn inverse(&self, normalized: f64) -> f64 {
        normalized * (self.max - self.min) + self.min
    }

    /// The fitted (min, max) bounds.
    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

/// The five per-channel normalizers of one session, in pipeline order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerSet {
    normalizers: [RangeNormalizer; Channel::COUNT],
}

impl NormalizerSet {
    /// Assemble from five already-fitted normalizers in `Channel::ALL` order.
    pub fn from_parts(normalizers: [RangeNormalizer; Channel::COUNT]) -> Self {
        Self { normalizers }
    }

    /// Fit every channel over the same snapshot.
    pub fn fit(snapshot: &SeriesSnapshot) -> Result<Self, FitError> {
        let mut fitted = Vec::with_capacity(Channel::COUNT);
        for channel in Channel::ALL {
            fitted.push(RangeNormalizer::fit(channel, snapshot.channel(channel))?);
        }
        // Infallible: the loop pushes exactly Channel::COUNT entries.
        let normalizers = fitted.try_into().map_err(|_| FitError::EmptyChannel {
            channel: Channel::Price,
        })?;
        Ok(Self { normalizers })
    }

    pub fn get(&self, channel: Channel) -> &RangeNormalizer {
        &self.normalizers[channel.index()]
    }

    /// The price normalizer, used to denormalize model output.
    pub fn price(&self) -> &RangeNormalizer {
        self.get(Channel::Price)
    }

    /// Fitted (min, max) bounds in channel order. Persisted alongside the
    /// trained model so a model paired with foreign normalizers is rejected
    /// before it ever predicts.
    pub fn fingerprint(&self) -> [(f64, f64); Channel::COUNT] {
        [
            self.normalizers[0].range(),
            self.normalizers[1].range(),
            self.normalizers[2].range(),
            self.normalizers[3].range(),
            self.normalizers[4].range(),
        ]
    }
}
