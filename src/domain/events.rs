use crate::domain::types::{Direction, SessionKey};
use tracing::info;

/// Structured results the engine publishes across the presentation boundary.
///
/// Session-scoped events carry the key and generation they were computed
/// against, so a subscriber can drop output belonging to a session it no
/// longer shows.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A session build has started for the key.
    SessionLoading { key: SessionKey },

    /// The key's session is installed and refresh tasks are running.
    SessionReady { key: SessionKey, generation: u64 },

    /// One prediction cycle completed.
    PredictionUpdated {
        key: SessionKey,
        generation: u64,
        predicted_price: f64,
        direction: Direction,
        /// Open time of the bar the prediction was made against, epoch ms.
        bar_timestamp: i64,
    },

    /// The periodic holdout evaluation produced a fresh error figure.
    AccuracyUpdated {
        key: SessionKey,
        generation: u64,
        mse: f64,
    },

    /// A watched symbol's spot price was refreshed.
    TickerUpdated { symbol: String, price: f64 },
}

/// Listener interface for engine events
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Listener that renders events as log lines. This is the whole presentation
/// layer of the headless binary.
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::SessionLoading { key } => {
                info!("{}: Loading session...", key);
            }
            EngineEvent::SessionReady { key, generation } => {
                info!("{}: Session ready (generation {})", key, generation);
            }
            EngineEvent::PredictionUpdated {
                key,
                predicted_price,
                direction,
                ..
            } => {
                info!(
                    "{}: Predicted price for the next {}: ${:.2} {}",
                    key.symbol, key.time_frame, predicted_price, direction
                );
            }
            EngineEvent::AccuracyUpdated { key, mse, .. } => {
                info!("{}: Holdout MSE {:.6}", key, mse);
            }
            EngineEvent::TickerUpdated { symbol, price } => {
                info!("{}: ${:.2}", symbol, price);
            }
        }
    }
}
