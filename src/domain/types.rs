use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one tracked market: a trading pair plus a candle granularity.
///
/// The engine treats both parts as opaque strings; they are only interpreted
/// by the exchange adapter and the artifact file naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub symbol: String,
    pub time_frame: String,
}

impl SessionKey {
    pub fn new(symbol: impl Into<String>, time_frame: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            time_frame: time_frame.into(),
        }
    }

    /// Filesystem-safe stem for artifact file names ("ETH/USDT" 5m -> "ETH_USDT_5m").
    pub fn artifact_stem(&self) -> String {
        format!("{}_{}", self.symbol.replace('/', "_"), self.time_frame)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.time_frame)
    }
}

/// One OHLCV candle. `timestamp` is the bar open time in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// The five feature channels, in their fixed pipeline order.
///
/// Every window, training example and normalizer set uses this order; the
/// price channel reads the close and doubles as the prediction target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Price,
    Volume,
    Open,
    High,
    Low,
}

impl Channel {
    pub const COUNT: usize = 5;

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::Price,
        Channel::Volume,
        Channel::Open,
        Channel::High,
        Channel::Low,
    ];

    /// Position of this channel in windows and normalizer sets.
    pub fn index(&self) -> usize {
        match self {
            Channel::Price => 0,
            Channel::Volume => 1,
            Channel::Open => 2,
            Channel::High => 3,
            Channel::Low => 4,
        }
    }

    /// Artifact slot this channel's normalizer is persisted under.
    pub fn artifact_slot(&self) -> &'static str {
        match self {
            Channel::Price => "price_scaler",
            Channel::Volume => "volume_scaler",
            Channel::Open => "open_scaler",
            Channel::High => "high_scaler",
            Channel::Low => "low_scaler",
        }
    }

    /// This channel's value in a bar.
    pub fn extract(&self, bar: &Bar) -> f64 {
        match self {
            Channel::Price => bar.close,
            Channel::Volume => bar.volume,
            Channel::Open => bar.open,
            Channel::High => bar.high,
            Channel::Low => bar.low,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Price => "price",
            Channel::Volume => "volume",
            Channel::Open => "open",
            Channel::High => "high",
            Channel::Low => "low",
        };
        write!(f, "{}", name)
    }
}

/// Direction of the predicted move relative to the latest close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

/// One durable prediction entry. Exactly one record is appended per distinct
/// bar timestamp, regardless of how many refresh cycles observe that bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Open time of the bar the prediction was made against, epoch ms.
    pub timestamp: i64,
    pub symbol: String,
    pub time_frame: String,
    pub predicted_price: f64,
}

impl PredictionRecord {
    pub fn new(key: &SessionKey, timestamp: i64, predicted_price: f64) -> Self {
        Self {
            timestamp,
            symbol: key.symbol.clone(),
            time_frame: key.time_frame.clone(),
            predicted_price,
        }
    }

    /// The line format written to the prediction log file.
    pub fn to_line(&self) -> String {
        let when = match Utc.timestamp_millis_opt(self.timestamp).single() {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => self.timestamp.to_string(),
        };
        format!(
            "{}: {} predicted price for the next {}: ${:.2}",
            when, self.symbol, self.time_frame, self.predicted_price
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_stem_replaces_slash() {
        let key = SessionKey::new("ETH/USDT", "5m");
        assert_eq!(key.artifact_stem(), "ETH_USDT_5m");
        assert_eq!(key.to_string(), "ETH/USDT 5m");
    }

    #[test]
    fn test_channel_order_is_stable() {
        let indexes: Vec<usize> = Channel::ALL.iter().map(|c| c.index()).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
        assert_eq!(Channel::ALL[0], Channel::Price);
    }

    #[test]
    fn test_channel_extract_reads_close_for_price() {
        let bar = Bar {
            timestamp: 1_700_000_000_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 42.0,
        };
        assert_eq!(Channel::Price.extract(&bar), 1.5);
        assert_eq!(Channel::Volume.extract(&bar), 42.0);
        assert_eq!(Channel::Open.extract(&bar), 1.0);
        assert_eq!(Channel::High.extract(&bar), 2.0);
        assert_eq!(Channel::Low.extract(&bar), 0.5);
    }

    #[test]
    fn test_record_line_format() {
        let key = SessionKey::new("ETH/USDT", "5m");
        // 2024-01-01 00:00:00 UTC
        let record = PredictionRecord::new(&key, 1_704_067_200_000, 2345.6789);
        assert_eq!(
            record.to_line(),
            "2024-01-01 00:00:00: ETH/USDT predicted price for the next 5m: $2345.68"
        );
    }
}
