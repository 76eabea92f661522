use crate::error::MarketError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Multiplexed,
    PerTopic,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub mode: ConnectionMode,
    pub topics: Vec<String>,
    pub reconnect_attempt: u32,
    pub generation: u64,
    pub last_connected_at_ms: Option<i64>,
    pub connect_in_flight: bool,
}

impl ConnectionSnapshot {
    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            mode: ConnectionMode::Multiplexed,
            topics: Vec::new(),
            reconnect_attempt: 0,
            generation: 0,
            last_connected_at_ms: None,
            connect_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Self::S1,
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::S1 => 1_000,
            Self::M1 => 60_000,
            Self::M3 => 180_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H2 => 7_200_000,
            Self::H4 => 14_400_000,
            Self::H6 => 21_600_000,
            Self::H8 => 28_800_000,
            Self::H12 => 43_200_000,
            Self::D1 => 86_400_000,
            Self::D3 => 259_200_000,
            Self::W1 => 604_800_000,
            Self::Mo1 => 2_592_000_000,
        }
    }

    /// Second-granularity charts follow individual trades; everything else
    /// follows the exchange's own kline stream.
    pub fn feed(self) -> CandleFeed {
        match self {
            Self::S1 => CandleFeed::Trade,
            _ => CandleFeed::Kline,
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, MarketError> {
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str() == value.trim())
            .ok_or_else(|| MarketError::InvalidArgument(format!("unsupported interval '{value}'")))
    }
}

impl FromStr for Interval {
    type Err = MarketError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse_str(value)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a subscription's candle ticks come from. Fixed for the lifetime of
/// the subscription; the two volume policies never meet on one series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CandleFeed {
    /// Kline snapshots report cumulative bucket volume: keep the maximum.
    Kline,
    /// Trades report incremental volume: sum it.
    Trade,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub interval: Interval,
}

impl SubscriptionKey {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub period_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Opens a bar from the first tick of a period.
    pub fn from_tick(period_start: i64, tick: &CandleTick) -> Self {
        let close = tick.close;
        let open = tick.open.unwrap_or(close);
        let high = tick.high.unwrap_or(close).max(open).max(close);
        let low = tick.low.unwrap_or(close).min(open).min(close);
        Self {
            period_start,
            open,
            high,
            low,
            close,
            volume: tick.volume.max(0.0),
        }
    }

    /// Merges a same-period tick in place. `open` never changes.
    pub fn apply_tick(&mut self, tick: &CandleTick, feed: CandleFeed) {
        let close = tick.close;
        self.high = self.high.max(tick.high.unwrap_or(close)).max(close);
        self.low = self.low.min(tick.low.unwrap_or(close)).min(close);
        self.close = close;
        match feed {
            CandleFeed::Kline => self.volume = self.volume.max(tick.volume),
            CandleFeed::Trade => self.volume += tick.volume.max(0.0),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.volume >= 0.0
    }
}

/// A normalized price update on its way into the aggregator.
///
/// Kline ticks carry the exchange's bar-open time in `period_start`; trade
/// ticks leave it empty and are bucketed by `event_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleTick {
    pub source: CandleFeed,
    pub event_time: i64,
    pub period_start: Option<i64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: f64,
}

impl CandleTick {
    pub fn trade(event_time: i64, price: f64, quantity: f64) -> Self {
        Self {
            source: CandleFeed::Trade,
            event_time,
            period_start: None,
            open: Some(price),
            high: Some(price),
            low: Some(price),
            close: price,
            volume: quantity,
        }
    }

    pub fn kline(period_start: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            source: CandleFeed::Kline,
            event_time: period_start,
            period_start: Some(period_start),
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close,
            volume,
        }
    }
}

/// Rolling 24h statistics pushed on ticker-class streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TickerSummary {
    pub symbol: String,
    pub event_time: i64,
    pub last_price: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DepthUpdate {
    pub symbol: String,
    pub event_time: i64,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Point-in-time 24h statistics loaded over REST.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketSummary {
    pub symbol: String,
    pub last_price: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub open_time: i64,
    pub close_time: i64,
    pub trade_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryWire {
    pub symbol: String,
    pub price_change: String,
    pub price_change_percent: String,
    pub last_price: String,
    pub open_price: String,
    pub high_price: String,
    pub low_price: String,
    pub volume: String,
    pub quote_volume: String,
    pub open_time: i64,
    pub close_time: i64,
    #[serde(default)]
    pub count: u64,
}

impl TryFrom<SummaryWire> for MarketSummary {
    type Error = MarketError;

    fn try_from(value: SummaryWire) -> Result<Self, Self::Error> {
        let fields = [
            value.last_price.parse::<f64>()?,
            value.open_price.parse::<f64>()?,
            value.high_price.parse::<f64>()?,
            value.low_price.parse::<f64>()?,
            value.price_change.parse::<f64>()?,
            value.price_change_percent.parse::<f64>()?,
            value.volume.parse::<f64>()?,
            value.quote_volume.parse::<f64>()?,
        ];
        if fields.iter().any(|field| !field.is_finite()) {
            return Err(MarketError::InvalidResponse(
                "24hr summary values must be finite".to_string(),
            ));
        }
        let [last_price, open_price, high_price, low_price, price_change, price_change_percent, volume, quote_volume] =
            fields;

        Ok(Self {
            symbol: value.symbol,
            last_price,
            open_price,
            high_price,
            low_price,
            price_change,
            price_change_percent,
            volume: volume.max(0.0),
            quote_volume: quote_volume.max(0.0),
            open_time: value.open_time,
            close_time: value.close_time,
            trade_count: value.count,
        })
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl TryFrom<KlineWire> for Candle {
    type Error = MarketError;

    fn try_from(value: KlineWire) -> Result<Self, Self::Error> {
        let open = value.1.parse::<f64>()?;
        let high = value.2.parse::<f64>()?;
        let low = value.3.parse::<f64>()?;
        let close = value.4.parse::<f64>()?;
        let volume = value.5.parse::<f64>()?;

        if !open.is_finite()
            || !high.is_finite()
            || !low.is_finite()
            || !close.is_finite()
            || !volume.is_finite()
        {
            return Err(MarketError::InvalidResponse(
                "kline values must be finite".to_string(),
            ));
        }

        Ok(Self {
            period_start: value.0,
            open,
            high: high.max(open).max(close),
            low: low.min(open).min(close),
            close,
            volume: volume.max(0.0),
        })
    }
}

pub fn normalize_symbol(symbol: &str) -> Result<String, MarketError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(MarketError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

pub fn candle_bucket_open_time(timestamp_ms: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(interval_ms)
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_labels_round_trip_through_parse() {
        for interval in Interval::ALL {
            assert_eq!(Interval::parse_str(interval.as_str()).ok(), Some(interval));
        }
        assert!(Interval::parse_str("7m").is_err());
    }

    #[test]
    fn month_and_minute_labels_are_case_sensitive() {
        assert_eq!("1M".parse::<Interval>().ok(), Some(Interval::Mo1));
        assert_eq!("1m".parse::<Interval>().ok(), Some(Interval::M1));
    }

    #[test]
    fn only_second_interval_is_trade_fed() {
        assert_eq!(Interval::S1.feed(), CandleFeed::Trade);
        assert_eq!(Interval::M1.feed(), CandleFeed::Kline);
        assert_eq!(Interval::D1.feed(), CandleFeed::Kline);
    }

    #[test]
    fn bucket_open_time_floors_to_interval() {
        assert_eq!(candle_bucket_open_time(125_000, 60_000), 120_000);
        assert_eq!(candle_bucket_open_time(60_000, 60_000), 60_000);
        assert_eq!(candle_bucket_open_time(-1, 60_000), -60_000);
    }

    #[test]
    fn normalizes_symbol_to_uppercase() {
        assert_eq!(normalize_symbol(" btcusdt ").ok().as_deref(), Some("BTCUSDT"));
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("BTC/USDT").is_err());
    }

    #[test]
    fn kline_tick_merge_keeps_open_and_max_volume() {
        let mut candle = Candle::from_tick(
            60_000,
            &CandleTick::kline(60_000, 100.0, 110.0, 95.0, 105.0, 10.0),
        );
        candle.apply_tick(
            &CandleTick::kline(60_000, 100.0, 112.0, 95.0, 108.0, 14.0),
            CandleFeed::Kline,
        );
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 112.0);
        assert_eq!(candle.close, 108.0);
        assert_eq!(candle.volume, 14.0);
        assert!(candle.is_consistent());
    }

    #[test]
    fn seeding_repairs_inconsistent_extremes() {
        let candle = Candle::from_tick(0, &CandleTick::kline(0, 10.0, 9.0, 11.0, 10.5, 1.0));
        assert!(candle.is_consistent());
        assert_eq!(candle.high, 10.5);
        assert_eq!(candle.low, 10.0);
    }

    #[test]
    fn rejects_non_finite_kline_rows() {
        let wire = KlineWire(
            0,
            "1".to_string(),
            "NaN".to_string(),
            "1".to_string(),
            "1".to_string(),
            "1".to_string(),
            59_999,
            "0".to_string(),
            0,
            "0".to_string(),
            "0".to_string(),
            "0".to_string(),
        );
        assert!(Candle::try_from(wire).is_err());
    }
}
