use crate::domain::errors::SeriesError;
use crate::domain::types::{Bar, Channel};
use std::collections::VecDeque;
use std::sync::RwLock;
use tracing::debug;

/// Owned, aligned copy of the five channel sequences at one point in time.
///
/// Snapshots never alias the live buffers, so readers cannot observe an
/// append half-applied and long computations run without holding any lock.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    channels: [Vec<f64>; Channel::COUNT],
}

impl SeriesSnapshot {
    /// Columnar snapshot of a bar slice, in channel order.
    pub fn from_bars(bars: &[Bar]) -> Self {
        Self {
            channels: [
                bars.iter().map(|b| Channel::Price.extract(b)).collect(),
                bars.iter().map(|b| Channel::Volume.extract(b)).collect(),
                bars.iter().map(|b| Channel::Open.extract(b)).collect(),
                bars.iter().map(|b| Channel::High.extract(b)).collect(),
                bars.iter().map(|b| Channel::Low.extract(b)).collect(),
            ],
        }
    }

    pub fn channel(&self, channel: Channel) -> &[f64] {
        &self.channels[channel.index()]
    }

    /// Number of bars in the snapshot. All channels share this length.
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SeriesInner {
    price: VecDeque<f64>,
    volume: VecDeque<f64>,
    open: VecDeque<f64>,
    high: VecDeque<f64>,
    low: VecDeque<f64>,
    last_timestamp: Option<i64>,
}

impl SeriesInner {
    fn with_capacity(limit: usize) -> Self {
        Self {
            price: VecDeque::with_capacity(limit),
            volume: VecDeque::with_capacity(limit),
            open: VecDeque::with_capacity(limit),
            high: VecDeque::with_capacity(limit),
            low: VecDeque::with_capacity(limit),
            last_timestamp: None,
        }
    }

    fn len(&self) -> usize {
        self.price.len()
    }

    fn push(&mut self, bar: &Bar) {
        self.price.push_back(Channel::Price.extract(bar));
        self.volume.push_back(Channel::Volume.extract(bar));
        self.open.push_back(Channel::Open.extract(bar));
        self.high.push_back(Channel::High.extract(bar));
        self.low.push_back(Channel::Low.extract(bar));
        self.last_timestamp = Some(bar.timestamp);
    }

    fn evict_oldest(&mut self) {
        self.price.pop_front();
        self.volume.pop_front();
        self.open.pop_front();
        self.high.pop_front();
        self.low.pop_front();
    }
}

/// Bounded rolling history of the five feature channels for one session.
///
/// Appends are atomic with respect to snapshots: a bar lands in all five
/// channels or in none, and every channel always has the same length. A bar
/// whose timestamp equals the last recorded one is ignored, which makes the
/// append return value the single authority on "is this a new bar".
pub struct SlidingSeries {
    limit: usize,
    inner: RwLock<SeriesInner>,
}

impl SlidingSeries {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: RwLock::new(SeriesInner::with_capacity(limit)),
        }
    }

    /// Build a series pre-filled from fetched history. Keeps the newest
    /// `limit` bars when the slice is longer than the capacity.
    pub fn seeded(limit: usize, bars: &[Bar]) -> Self {
        let series = Self::new(limit);
        {
            let mut inner = series.write_inner();
            let skip = bars.len().saturating_sub(limit);
            for bar in &bars[skip..] {
                inner.push(bar);
            }
        }
        series
    }

    /// Append one bar. Returns false without modifying anything when the
    /// bar's timestamp matches the last recorded one.
    pub fn append(&self, bar: Bar) -> bool {
        let mut inner = self.write_inner();

        if inner.last_timestamp == Some(bar.timestamp) {
            debug!(
                "SlidingSeries: Ignoring bar with duplicate timestamp {}",
                bar.timestamp
            );
            return false;
        }

        if inner.len() == self.limit {
            inner.evict_oldest();
        }
        inner.push(&bar);
        true
    }

    /// Owned copy of the full history.
    pub fn snapshot(&self) -> SeriesSnapshot {
        let inner = self.read_inner();
        SeriesSnapshot {
            channels: [
                inner.price.iter().copied().collect(),
                inner.volume.iter().copied().collect(),
                inner.open.iter().copied().collect(),
                inner.high.iter().copied().collect(),
                inner.low.iter().copied().collect(),
            ],
        }
    }

    /// Owned copy of the newest `count` bars.
    pub fn snapshot_window(&self, count: usize) -> Result<SeriesSnapshot, SeriesError> {
        let inner = self.read_inner();
        let have = inner.len();
        if have < count {
            return Err(SeriesError::InsufficientData { have, need: count });
        }

        let skip = have - count;
        Ok(SeriesSnapshot {
            channels: [
                inner.price.iter().skip(skip).copied().collect(),
                inner.volume.iter().skip(skip).copied().collect(),
                inner.open.iter().skip(skip).copied().collect(),
                inner.high.iter().skip(skip).copied().collect(),
                inner.low.iter().skip(skip).copied().collect(),
            ],
        })
    }

    /// The most recent bar, reassembled from the channel tails.
    pub fn latest(&self) -> Option<Bar> {
        let inner = self.read_inner();
        let timestamp = inner.last_timestamp?;
        Some(Bar {
            timestamp,
            open: *inner.open.back()?,
            high: *inner.high.back()?,
            low: *inner.low.back()?,
            close: *inner.price.back()?,
            volume: *inner.volume.back()?,
        })
    }

    pub fn len(&self) -> usize {
        self.read_inner().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, SeriesInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, SeriesInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(timestamp: i64, close: f64) -> Bar {
        Bar {
            timestamp,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 1000.0 + close,
        }
    }

    #[test]
    fn test_append_keeps_channels_equal_length() {
        let series = SlidingSeries::new(10);
        for i in 0..7 {
            assert!(series.append(bar(i, 100.0 + i as f64)));
            let snapshot = series.snapshot();
            for channel in Channel::ALL {
                assert_eq!(snapshot.channel(channel).len(), (i + 1) as usize);
            }
        }
    }

    #[test]
    fn test_append_at_capacity_evicts_oldest() {
        let series = SlidingSeries::new(3);
        for i in 0..5 {
            series.append(bar(i, i as f64));
        }

        assert_eq!(series.len(), 3);
        let snapshot = series.snapshot();
        assert_eq!(snapshot.channel(Channel::Price), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_duplicate_timestamp_is_a_no_op() {
        let series = SlidingSeries::new(10);
        assert!(series.append(bar(100, 1.0)));
        assert!(!series.append(bar(100, 99.0)));

        assert_eq!(series.len(), 1);
        // The duplicate's payload must not overwrite the stored bar.
        assert_eq!(series.latest().unwrap().close, 1.0);

        assert!(series.append(bar(101, 2.0)));
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_seeded_trims_to_limit() {
        let bars: Vec<Bar> = (0..20).map(|i| bar(i, i as f64)).collect();
        let series = SlidingSeries::seeded(5, &bars);

        assert_eq!(series.len(), 5);
        assert_eq!(series.latest().unwrap().timestamp, 19);
        assert_eq!(series.snapshot().channel(Channel::Price), &[15.0, 16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn test_snapshot_window_requires_enough_bars() {
        let series = SlidingSeries::seeded(10, &(0..4).map(|i| bar(i, i as f64)).collect::<Vec<_>>());

        let err = series.snapshot_window(5).unwrap_err();
        assert!(matches!(err, SeriesError::InsufficientData { have: 4, need: 5 }));

        let window = series.snapshot_window(3).unwrap();
        assert_eq!(window.channel(Channel::Price), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_latest_reassembles_the_newest_bar() {
        let series = SlidingSeries::new(4);
        assert!(series.latest().is_none());

        let newest = bar(7, 42.0);
        series.append(bar(6, 41.0));
        series.append(newest);
        assert_eq!(series.latest(), Some(newest));
    }
}
