//! Inbound frame decoding.
//!
//! One text frame becomes at most one [`DecodedFrame`]. Frames that are not
//! JSON, or JSON without an `"e"` discriminator, are dropped here and never
//! reach a consumer.

use crate::market::topics::{topic_for, Topic, TopicKind};
use crate::market::types::{CandleTick, DepthUpdate, TickerSummary};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

const RAW_LOG_MAX_BYTES: usize = 256;

/// Exchange decimal that arrives as a string (or occasionally a number).
/// Anything unparseable or non-finite reads as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Decimal(f64);

impl Decimal {
    fn parse(value: &str) -> Self {
        Self::finite(value.trim().parse::<f64>().unwrap_or(0.0))
    }

    fn finite(value: f64) -> Self {
        if value.is_finite() {
            Self(value)
        } else {
            Self(0.0)
        }
    }

    fn non_negative(self) -> f64 {
        self.0.max(0.0)
    }
}

struct DecimalVisitor;

impl<'de> Visitor<'de> for DecimalVisitor {
    type Value = Decimal;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a decimal string or number")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Decimal, E> {
        Ok(Decimal::parse(value))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Decimal, E> {
        Ok(Decimal::finite(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Decimal, E> {
        Ok(Decimal(value as f64))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Decimal, E> {
        Ok(Decimal(value as f64))
    }

    fn visit_bool<E: de::Error>(self, _value: bool) -> Result<Decimal, E> {
        Ok(Decimal::default())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Decimal, E> {
        Ok(Decimal::default())
    }

    fn visit_none<E: de::Error>(self) -> Result<Decimal, E> {
        Ok(Decimal::default())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DecimalVisitor)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FrameWire {
    Combined(CombinedWire),
    Bare(EventWire),
}

#[derive(Debug, Deserialize)]
struct CombinedWire {
    stream: String,
    data: EventWire,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum EventWire {
    #[serde(rename = "kline")]
    Kline(KlineEventWire),
    #[serde(rename = "trade")]
    Trade(TradeEventWire),
    #[serde(rename = "aggTrade")]
    AggTrade(AggTradeEventWire),
    #[serde(rename = "24hrTicker")]
    Ticker(TickerEventWire),
    #[serde(rename = "24hrMiniTicker")]
    MiniTicker(MiniTickerEventWire),
    #[serde(rename = "depthUpdate")]
    Depth(DepthEventWire),
    #[serde(other)]
    Unhandled,
}

#[derive(Debug, Deserialize)]
struct KlineEventWire {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayloadWire,
}

#[derive(Debug, Deserialize)]
struct KlinePayloadWire {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T", default)]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o", default)]
    open: Decimal,
    #[serde(rename = "h", default)]
    high: Decimal,
    #[serde(rename = "l", default)]
    low: Decimal,
    #[serde(rename = "c", default)]
    close: Decimal,
    #[serde(rename = "v", default)]
    volume: Decimal,
    #[serde(rename = "x", default)]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct TradeEventWire {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t", default)]
    trade_id: u64,
    #[serde(rename = "p", default)]
    price: Decimal,
    #[serde(rename = "q", default)]
    quantity: Decimal,
    #[serde(rename = "T", default)]
    trade_time: i64,
    #[serde(rename = "m", default)]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct AggTradeEventWire {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a", default)]
    aggregate_trade_id: u64,
    #[serde(rename = "p", default)]
    price: Decimal,
    #[serde(rename = "q", default)]
    quantity: Decimal,
    #[serde(rename = "T", default)]
    trade_time: i64,
    #[serde(rename = "m", default)]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct TickerEventWire {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p", default)]
    price_change: Decimal,
    #[serde(rename = "P", default)]
    price_change_percent: Decimal,
    #[serde(rename = "c", default)]
    last_price: Decimal,
    #[serde(rename = "o", default)]
    open_price: Decimal,
    #[serde(rename = "h", default)]
    high_price: Decimal,
    #[serde(rename = "l", default)]
    low_price: Decimal,
    #[serde(rename = "v", default)]
    volume: Decimal,
    #[serde(rename = "q", default)]
    quote_volume: Decimal,
}

#[derive(Debug, Deserialize)]
struct MiniTickerEventWire {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", default)]
    last_price: Decimal,
    #[serde(rename = "o", default)]
    open_price: Decimal,
    #[serde(rename = "h", default)]
    high_price: Decimal,
    #[serde(rename = "l", default)]
    low_price: Decimal,
    #[serde(rename = "v", default)]
    volume: Decimal,
    #[serde(rename = "q", default)]
    quote_volume: Decimal,
}

#[derive(Debug, Deserialize)]
struct DepthEventWire {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U", default)]
    first_update_id: u64,
    #[serde(rename = "u", default)]
    final_update_id: u64,
    #[serde(rename = "b", default)]
    bids: Vec<Vec<Decimal>>,
    #[serde(rename = "a", default)]
    asks: Vec<Vec<Decimal>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub symbol: String,
    pub interval: String,
    pub close_time: i64,
    pub is_closed: bool,
    pub tick: CandleTick,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    pub symbol: String,
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub event_time: i64,
    pub trade_time: i64,
    pub is_buyer_maker: bool,
}

impl TradeUpdate {
    /// Degenerate single-price candle input, bucketed by execution time.
    pub fn tick(&self) -> CandleTick {
        let time = if self.trade_time > 0 {
            self.trade_time
        } else {
            self.event_time
        };
        CandleTick::trade(time, self.price, self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Kline(KlineUpdate),
    Trade(TradeUpdate),
    Ticker(TickerSummary),
    Depth(DepthUpdate),
    Unhandled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Wrapper stream name on multiplexed connections.
    pub stream: Option<String>,
    /// Routing topic derived from the event itself.
    pub topic: Option<Topic>,
    pub event: MarketEvent,
}

pub fn decode_frame(raw: &str) -> Option<DecodedFrame> {
    let mut payload = raw.as_bytes().to_vec();
    let wire = match simd_json::serde::from_slice::<FrameWire>(payload.as_mut_slice()) {
        Ok(wire) => wire,
        Err(error) => {
            debug!(
                error = %error,
                bytes = raw.len(),
                frame = %truncate_for_log(raw, RAW_LOG_MAX_BYTES),
                "dropping malformed frame"
            );
            return None;
        }
    };

    let (stream, event) = match wire {
        FrameWire::Combined(combined) => (Some(combined.stream), combined.data),
        FrameWire::Bare(event) => (None, event),
    };
    let (topic, event) = normalize_event(event);
    Some(DecodedFrame {
        stream,
        topic,
        event,
    })
}

fn normalize_event(event: EventWire) -> (Option<Topic>, MarketEvent) {
    match event {
        EventWire::Kline(wire) => {
            let kline = wire.kline;
            let topic = Topic::from_parts(&wire.symbol, &format!("kline_{}", kline.interval));
            let mut tick = CandleTick::kline(
                kline.open_time,
                kline.open.non_negative(),
                kline.high.non_negative(),
                kline.low.non_negative(),
                kline.close.non_negative(),
                kline.volume.non_negative(),
            );
            if wire.event_time > 0 {
                tick.event_time = wire.event_time;
            }
            let update = KlineUpdate {
                symbol: wire.symbol.to_ascii_uppercase(),
                interval: kline.interval,
                close_time: kline.close_time,
                is_closed: kline.is_closed,
                tick,
            };
            (Some(topic), MarketEvent::Kline(update))
        }
        EventWire::Trade(wire) => {
            let topic = topic_for(&wire.symbol, TopicKind::Trade);
            let update = TradeUpdate {
                symbol: wire.symbol.to_ascii_uppercase(),
                trade_id: wire.trade_id,
                price: wire.price.non_negative(),
                quantity: wire.quantity.non_negative(),
                event_time: wire.event_time,
                trade_time: wire.trade_time,
                is_buyer_maker: wire.is_buyer_maker,
            };
            (Some(topic), MarketEvent::Trade(update))
        }
        EventWire::AggTrade(wire) => {
            let topic = topic_for(&wire.symbol, TopicKind::AggTrade);
            let update = TradeUpdate {
                symbol: wire.symbol.to_ascii_uppercase(),
                trade_id: wire.aggregate_trade_id,
                price: wire.price.non_negative(),
                quantity: wire.quantity.non_negative(),
                event_time: wire.event_time,
                trade_time: wire.trade_time,
                is_buyer_maker: wire.is_buyer_maker,
            };
            (Some(topic), MarketEvent::Trade(update))
        }
        EventWire::Ticker(wire) => {
            let topic = topic_for(&wire.symbol, TopicKind::Ticker);
            let summary = TickerSummary {
                symbol: wire.symbol.to_ascii_uppercase(),
                event_time: wire.event_time,
                last_price: wire.last_price.non_negative(),
                open_price: wire.open_price.non_negative(),
                high_price: wire.high_price.non_negative(),
                low_price: wire.low_price.non_negative(),
                price_change: wire.price_change.0,
                price_change_percent: wire.price_change_percent.0,
                volume: wire.volume.non_negative(),
                quote_volume: wire.quote_volume.non_negative(),
            };
            (Some(topic), MarketEvent::Ticker(summary))
        }
        EventWire::MiniTicker(wire) => {
            let topic = topic_for(&wire.symbol, TopicKind::MiniTicker);
            let last_price = wire.last_price.non_negative();
            let open_price = wire.open_price.non_negative();
            let price_change = last_price - open_price;
            let price_change_percent = if open_price > 0.0 {
                price_change / open_price * 100.0
            } else {
                0.0
            };
            let summary = TickerSummary {
                symbol: wire.symbol.to_ascii_uppercase(),
                event_time: wire.event_time,
                last_price,
                open_price,
                high_price: wire.high_price.non_negative(),
                low_price: wire.low_price.non_negative(),
                price_change,
                price_change_percent,
                volume: wire.volume.non_negative(),
                quote_volume: wire.quote_volume.non_negative(),
            };
            (Some(topic), MarketEvent::Ticker(summary))
        }
        EventWire::Depth(wire) => {
            let topic = topic_for(&wire.symbol, TopicKind::Depth);
            let update = DepthUpdate {
                symbol: wire.symbol.to_ascii_uppercase(),
                event_time: wire.event_time,
                first_update_id: wire.first_update_id,
                final_update_id: wire.final_update_id,
                bids: levels(wire.bids),
                asks: levels(wire.asks),
            };
            (Some(topic), MarketEvent::Depth(update))
        }
        EventWire::Unhandled => (None, MarketEvent::Unhandled),
    }
}

fn levels(rows: Vec<Vec<Decimal>>) -> Vec<(f64, f64)> {
    rows.into_iter()
        .filter_map(|row| match row.as_slice() {
            [price, quantity, ..] => Some((price.non_negative(), quantity.non_negative())),
            _ => None,
        })
        .collect()
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut cut = max_len;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + 3);
    out.push_str(&value[..cut]);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::CandleFeed;

    const KLINE_FRAME: &str = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":60500,"s":"BTCUSDT","k":{"t":60000,"T":119999,"s":"BTCUSDT","i":"1m","f":100,"L":200,"o":"100.0","c":"105.0","h":"110.0","l":"95.0","v":"10","n":100,"x":false,"q":"1.0","V":"5","Q":"0.5","B":"0"}}}"#;

    #[test]
    fn decodes_combined_kline_frame() {
        let frame = decode_frame(KLINE_FRAME).expect("kline frame should decode");

        assert_eq!(frame.stream.as_deref(), Some("btcusdt@kline_1m"));
        assert_eq!(frame.topic.as_ref().map(Topic::as_str), Some("btcusdt@kline_1m"));
        let MarketEvent::Kline(update) = frame.event else {
            panic!("expected kline event");
        };
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.interval, "1m");
        assert!(!update.is_closed);
        assert_eq!(update.tick.source, CandleFeed::Kline);
        assert_eq!(update.tick.period_start, Some(60_000));
        assert_eq!(update.tick.open, Some(100.0));
        assert_eq!(update.tick.high, Some(110.0));
        assert_eq!(update.tick.low, Some(95.0));
        assert_eq!(update.tick.close, 105.0);
        assert_eq!(update.tick.volume, 10.0);
    }

    #[test]
    fn decodes_bare_trade_frame_into_degenerate_tick() {
        let frame = decode_frame(
            r#"{"e":"trade","E":123456790,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":123456785,"m":true,"M":true}"#,
        )
        .expect("trade frame should decode");

        assert_eq!(frame.stream, None);
        assert_eq!(frame.topic.as_ref().map(Topic::as_str), Some("bnbbtc@trade"));
        let MarketEvent::Trade(update) = frame.event else {
            panic!("expected trade event");
        };
        let tick = update.tick();
        assert_eq!(tick.source, CandleFeed::Trade);
        assert_eq!(tick.event_time, 123_456_785);
        assert_eq!(tick.open, Some(0.001));
        assert_eq!(tick.high, Some(0.001));
        assert_eq!(tick.low, Some(0.001));
        assert_eq!(tick.close, 0.001);
        assert_eq!(tick.volume, 100.0);
    }

    #[test]
    fn decodes_agg_trade_on_its_own_topic() {
        let frame = decode_frame(
            r#"{"e":"aggTrade","E":123456790,"s":"BTCUSDT","a":55,"p":"1000.5","q":"0.25","f":1,"l":2,"T":123456789,"m":false}"#,
        )
        .expect("aggTrade frame should decode");

        assert_eq!(frame.topic.as_ref().map(Topic::as_str), Some("btcusdt@aggTrade"));
        let MarketEvent::Trade(update) = frame.event else {
            panic!("expected trade event");
        };
        assert_eq!(update.trade_id, 55);
        assert_eq!(update.price, 1000.5);
    }

    #[test]
    fn decodes_ticker_with_signed_change() {
        let frame = decode_frame(
            r#"{"stream":"ethusdt@ticker","data":{"e":"24hrTicker","E":1,"s":"ETHUSDT","p":"-12.5","P":"-0.40","c":"3100.0","o":"3112.5","h":"3200","l":"3050","v":"1000","q":"3100000"}}"#,
        )
        .expect("ticker frame should decode");

        assert_eq!(frame.topic.as_ref().map(Topic::as_str), Some("ethusdt@ticker"));
        let MarketEvent::Ticker(summary) = frame.event else {
            panic!("expected ticker event");
        };
        assert_eq!(summary.price_change, -12.5);
        assert_eq!(summary.price_change_percent, -0.40);
        assert_eq!(summary.last_price, 3100.0);
    }

    #[test]
    fn derives_change_for_mini_ticker() {
        let frame = decode_frame(
            r#"{"e":"24hrMiniTicker","E":1,"s":"ETHUSDT","c":"110","o":"100","h":"120","l":"90","v":"5","q":"550"}"#,
        )
        .expect("mini ticker frame should decode");

        assert_eq!(frame.topic.as_ref().map(Topic::as_str), Some("ethusdt@miniTicker"));
        let MarketEvent::Ticker(summary) = frame.event else {
            panic!("expected ticker event");
        };
        assert_eq!(summary.price_change, 10.0);
        assert!((summary.price_change_percent - 10.0).abs() < 1e-9);
    }

    #[test]
    fn decodes_depth_levels() {
        let frame = decode_frame(
            r#"{"e":"depthUpdate","E":123456789,"s":"BNBBTC","U":157,"u":160,"b":[["0.0024","10"]],"a":[["0.0026","100"],["bad"]]}"#,
        )
        .expect("depth frame should decode");

        assert_eq!(frame.topic.as_ref().map(Topic::as_str), Some("bnbbtc@depth"));
        let MarketEvent::Depth(update) = frame.event else {
            panic!("expected depth event");
        };
        assert_eq!(update.first_update_id, 157);
        assert_eq!(update.final_update_id, 160);
        assert_eq!(update.bids, vec![(0.0024, 10.0)]);
        assert_eq!(update.asks, vec![(0.0026, 100.0)]);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_zero() {
        let frame = decode_frame(
            r#"{"e":"trade","E":1,"s":"BTCUSDT","t":1,"p":"broken","q":"NaN","T":1,"m":false}"#,
        )
        .expect("frame with bad numerics should still decode");

        let MarketEvent::Trade(update) = frame.event else {
            panic!("expected trade event");
        };
        assert_eq!(update.price, 0.0);
        assert_eq!(update.quantity, 0.0);
    }

    #[test]
    fn unknown_discriminator_is_unhandled() {
        let frame = decode_frame(r#"{"e":"outboundAccountPosition","E":1}"#)
            .expect("known envelope with unknown kind should decode");

        assert_eq!(frame.topic, None);
        assert_eq!(frame.event, MarketEvent::Unhandled);
    }

    #[test]
    fn drops_malformed_frames() {
        assert!(decode_frame("not json").is_none());
        assert!(decode_frame("").is_none());
        assert!(decode_frame(r#"{"result":null,"id":1}"#).is_none());
        assert!(decode_frame(r#"{"stream":"btcusdt@trade","data":{"p":"1"}}"#).is_none());
        assert!(decode_frame(r#"{"e":"kline","s":"BTCUSDT"}"#).is_none());
    }

    #[test]
    fn truncates_long_log_previews() {
        let preview = truncate_for_log(&"x".repeat(300), 10);
        assert_eq!(preview, format!("{}...", "x".repeat(10)));
    }
}
