//! Rolling candle series per subscription.

use crate::market::types::{
    candle_bucket_open_time, Candle, CandleFeed, CandleTick, Interval, SubscriptionKey,
};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub enum CandleUpdate {
    /// A later bucket started; the previous candle is archived.
    Opened(Candle),
    /// The current candle was mutated in place.
    Updated(Candle),
    /// The tick belongs to a bucket older than the current candle.
    Stale { bucket: i64, current: i64 },
    /// The tick's source does not match the series' volume policy.
    FeedMismatch { expected: CandleFeed, found: CandleFeed },
    Untracked,
}

impl CandleUpdate {
    pub fn candle(&self) -> Option<&Candle> {
        match self {
            Self::Opened(candle) | Self::Updated(candle) => Some(candle),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct CandleSeries {
    interval: Interval,
    feed: CandleFeed,
    candles: VecDeque<Candle>,
}

impl CandleSeries {
    /// Klines carry the exchange's bar-open time, which is calendar aligned
    /// for weeks and months; only trades are floored onto the interval grid.
    fn bucket_for(&self, tick: &CandleTick) -> i64 {
        match (self.feed, tick.period_start) {
            (CandleFeed::Kline, Some(period_start)) => period_start,
            _ => candle_bucket_open_time(tick.event_time, self.interval.duration_ms()),
        }
    }

    fn current_period(&self) -> Option<i64> {
        self.candles.back().map(|candle| candle.period_start)
    }

    fn evict(&mut self, retention: usize) {
        // The open candle is the back element and is never evicted.
        while self.candles.len() > retention.max(1) {
            self.candles.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct CandleAggregator {
    retention: usize,
    series: HashMap<SubscriptionKey, CandleSeries>,
}

impl CandleAggregator {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            series: HashMap::new(),
        }
    }

    /// Starts a series for `key`. The volume policy is fixed by the interval;
    /// re-tracking an existing key keeps its candles.
    pub fn track(&mut self, key: SubscriptionKey) {
        let interval = key.interval;
        self.series.entry(key).or_insert_with(|| CandleSeries {
            interval,
            feed: interval.feed(),
            candles: VecDeque::new(),
        });
    }

    pub fn untrack(&mut self, key: &SubscriptionKey) {
        self.series.remove(key);
    }

    pub fn apply(&mut self, key: &SubscriptionKey, tick: &CandleTick) -> CandleUpdate {
        let Some(series) = self.series.get_mut(key) else {
            return CandleUpdate::Untracked;
        };
        if tick.source != series.feed {
            return CandleUpdate::FeedMismatch {
                expected: series.feed,
                found: tick.source,
            };
        }

        let feed = series.feed;
        let bucket = series.bucket_for(tick);

        match series.candles.back_mut() {
            Some(current) if bucket < current.period_start => CandleUpdate::Stale {
                bucket,
                current: current.period_start,
            },
            Some(current) if bucket == current.period_start => {
                current.apply_tick(tick, feed);
                CandleUpdate::Updated(current.clone())
            }
            _ => {
                let next = Candle::from_tick(bucket, tick);
                series.candles.push_back(next.clone());
                series.evict(self.retention);
                CandleUpdate::Opened(next)
            }
        }
    }

    /// Merges a REST history snapshot under the live series. Live candles at
    /// or after the snapshot's last bar win; older history is prepended.
    /// Returns false when `key` is not tracked.
    pub fn seed(&mut self, key: &SubscriptionKey, history: &[Candle]) -> bool {
        let Some(series) = self.series.get_mut(key) else {
            return false;
        };
        let interval_ms = series.interval.duration_ms();
        let feed = series.feed;

        let mut merged: Vec<Candle> = history
            .iter()
            .filter(|candle| {
                feed == CandleFeed::Kline
                    || candle.period_start == candle_bucket_open_time(candle.period_start, interval_ms)
            })
            .cloned()
            .collect();
        merged.sort_by_key(|candle| candle.period_start);
        merged.dedup_by_key(|candle| candle.period_start);

        if let Some(first_live) = series.candles.front().map(|candle| candle.period_start) {
            merged.retain(|candle| candle.period_start < first_live);
            merged.extend(series.candles.drain(..));
        }

        series.candles = merged.into();
        series.evict(self.retention);
        true
    }

    pub fn candles(&self, key: &SubscriptionKey) -> Vec<Candle> {
        self.series
            .get(key)
            .map(|series| series.candles.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn current_period(&self, key: &SubscriptionKey) -> Option<i64> {
        self.series.get(key).and_then(CandleSeries::current_period)
    }
}
