use crate::domain::types::Channel;
use thiserror::Error;

/// Errors raised while fitting a normalizer over a history snapshot
#[derive(Debug, Clone, Error)]
pub enum FitError {
    #[error("Cannot fit {channel} normalizer: no samples")]
    EmptyChannel { channel: Channel },

    #[error("Degenerate {channel} range: min {min} equals max {max}")]
    DegenerateRange { channel: Channel, min: f64, max: f64 },
}

/// Errors raised when a window asks for more bars than the series holds
#[derive(Debug, Clone, Error)]
pub enum SeriesError {
    #[error("Insufficient data: have {have} bars, need {need}")]
    InsufficientData { have: usize, need: usize },
}

/// Errors raised by a trained model at inference or serialization time
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Inference window is {actual} bars long, model was trained on {expected}")]
    WindowMismatch { expected: usize, actual: usize },

    #[error("Model serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors surfaced by session construction.
///
/// Clone-able so one build outcome can be handed to every caller that was
/// waiting on the same in-flight build.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session build failed for {key}: {reason}")]
    BuildFailed { key: String, reason: String },

    #[error("Inconsistent artifact for {key}: {reason}")]
    InconsistentArtifact { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_error_formatting() {
        let err = FitError::DegenerateRange {
            channel: Channel::Volume,
            min: 3.0,
            max: 3.0,
        };

        let msg = err.to_string();
        assert!(msg.contains("volume"));
        assert!(msg.contains("3"));
    }

    #[test]
    fn test_series_error_formatting() {
        let err = SeriesError::InsufficientData { have: 40, need: 94 };

        let msg = err.to_string();
        assert!(msg.contains("40"));
        assert!(msg.contains("94"));
    }

    #[test]
    fn test_session_error_formatting() {
        let err = SessionError::InconsistentArtifact {
            key: "ETH/USDT 5m".to_string(),
            reason: "normalizer ranges changed".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("ETH/USDT 5m"));
        assert!(msg.contains("normalizer ranges changed"));
    }
}
