//! Consumer subscriptions and frame routing.
//!
//! The registry decides which topics must be open and pushes that set to a
//! [`TopicSink`] after every change, before releasing its lock, so the sink
//! sees sets in the order the registry produced them. Frames are routed by exact topic match;
//! handlers run after the registry lock is released so they may call back in.

use crate::error::MarketError;
use crate::market::aggregator::{CandleAggregator, CandleUpdate};
use crate::market::connection::TopicSink;
use crate::market::decoder::{decode_frame, MarketEvent};
use crate::market::topics::{topic_for, Topic, TopicKind};
use crate::market::types::{
    normalize_symbol, Candle, CandleFeed, CandleTick, DepthUpdate, Interval, SubscriptionKey,
    TickerSummary,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

pub type CandleHandler = Arc<dyn Fn(&Candle) + Send + Sync>;
pub type TickerHandler = Arc<dyn Fn(&TickerSummary) + Send + Sync>;
pub type DepthHandler = Arc<dyn Fn(&DepthUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub frames_seen: u64,
    pub frames_delivered: u64,
    pub malformed_dropped: u64,
    pub unrouted_dropped: u64,
    pub stale_ticks: u64,
}

/// Topic carrying candle ticks for a subscription, chosen by the interval's
/// feed.
pub fn candle_topic(symbol: &str, interval: Interval) -> Topic {
    match interval.feed() {
        CandleFeed::Trade => topic_for(symbol, TopicKind::Trade),
        CandleFeed::Kline => topic_for(symbol, TopicKind::Kline(interval)),
    }
}

struct CandleSubscription {
    id: u64,
    topic: Topic,
    handler: CandleHandler,
}

struct RegistryState {
    candles: HashMap<SubscriptionKey, CandleSubscription>,
    candle_routes: HashMap<Topic, SubscriptionKey>,
    tickers: HashMap<Topic, TickerHandler>,
    depth: HashMap<Topic, DepthHandler>,
    aggregator: CandleAggregator,
    next_id: u64,
    stats: RegistryStats,
}

impl RegistryState {
    fn remove_candle(&mut self, key: &SubscriptionKey) -> bool {
        let Some(subscription) = self.candles.remove(key) else {
            return false;
        };
        if self.candle_routes.get(&subscription.topic) == Some(key) {
            self.candle_routes.remove(&subscription.topic);
        }
        self.aggregator.untrack(key);
        true
    }

    fn required_topics(&self) -> BTreeSet<Topic> {
        self.candle_routes
            .keys()
            .chain(self.tickers.keys())
            .chain(self.depth.keys())
            .cloned()
            .collect()
    }

    fn route_tick(&mut self, topic: &Topic, tick: &CandleTick) -> Option<Delivery> {
        let key = self.candle_routes.get(topic)?.clone();
        let handler = Arc::clone(&self.candles.get(&key)?.handler);
        match self.aggregator.apply(&key, tick) {
            CandleUpdate::Opened(candle) | CandleUpdate::Updated(candle) => {
                Some(Delivery::Candle(handler, candle))
            }
            outcome => {
                debug!(subscription = %key, outcome = ?outcome, "tick not applied");
                self.stats.stale_ticks += 1;
                None
            }
        }
    }
}

enum Delivery {
    Candle(CandleHandler, Candle),
    Ticker(TickerHandler, TickerSummary),
    Depth(DepthHandler, DepthUpdate),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Self::Candle(handler, candle) => handler(&candle),
            Self::Ticker(handler, summary) => handler(&summary),
            Self::Depth(handler, update) => handler(&update),
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    state: Arc<Mutex<RegistryState>>,
    sink: Arc<dyn TopicSink>,
}

impl SubscriptionRegistry {
    pub fn new(sink: Arc<dyn TopicSink>, candle_retention: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                candles: HashMap::new(),
                candle_routes: HashMap::new(),
                tickers: HashMap::new(),
                depth: HashMap::new(),
                aggregator: CandleAggregator::new(candle_retention),
                next_id: 1,
                stats: RegistryStats::default(),
            })),
            sink,
        }
    }

    /// Binds `handler` to `(symbol, interval)` and returns the subscription id.
    ///
    /// Re-subscribing the same pair swaps the handler and keeps the id and
    /// candle series. Any other candle subscription for the same symbol is
    /// dropped first; other symbols are never touched.
    pub fn subscribe<F>(&self, symbol: &str, interval: Interval, handler: F) -> Result<u64, MarketError>
    where
        F: Fn(&Candle) + Send + Sync + 'static,
    {
        let symbol = normalize_symbol(symbol)?;
        let key = SubscriptionKey::new(symbol.clone(), interval);
        let topic = candle_topic(&symbol, interval);
        let handler: CandleHandler = Arc::new(handler);

        let mut state = self.state.lock();
        let stale: Vec<SubscriptionKey> = state
            .candles
            .keys()
            .filter(|existing| existing.symbol == symbol && existing.interval != interval)
            .cloned()
            .collect();
        for existing in &stale {
            debug!(subscription = %existing, "replacing same-symbol subscription");
            state.remove_candle(existing);
        }

        let id = match state.candles.get_mut(&key) {
            Some(subscription) => {
                subscription.handler = handler;
                subscription.id
            }
            None => {
                let id = state.next_id;
                state.next_id += 1;
                state.candles.insert(
                    key.clone(),
                    CandleSubscription {
                        id,
                        topic: topic.clone(),
                        handler,
                    },
                );
                state.candle_routes.insert(topic, key.clone());
                state.aggregator.track(key);
                id
            }
        };
        self.push_topics(&state)?;
        Ok(id)
    }

    /// No-op for pairs that are not subscribed.
    pub fn unsubscribe(&self, symbol: &str, interval: Interval) -> Result<(), MarketError> {
        let Ok(symbol) = normalize_symbol(symbol) else {
            return Ok(());
        };
        let key = SubscriptionKey::new(symbol, interval);
        let mut state = self.state.lock();
        if !state.remove_candle(&key) {
            return Ok(());
        }
        self.push_topics(&state)
    }

    /// Routes ticker summaries for every symbol to one handler.
    pub fn subscribe_bulk<S, F>(&self, symbols: &[S], handler: F) -> Result<(), MarketError>
    where
        S: AsRef<str>,
        F: Fn(&TickerSummary) + Send + Sync + 'static,
    {
        let symbols = normalize_symbols(symbols)?;
        let handler: TickerHandler = Arc::new(handler);
        let mut state = self.state.lock();
        for symbol in &symbols {
            state
                .tickers
                .insert(topic_for(symbol, TopicKind::Ticker), Arc::clone(&handler));
        }
        self.push_topics(&state)
    }

    pub fn unsubscribe_bulk<S>(&self, symbols: &[S]) -> Result<(), MarketError>
    where
        S: AsRef<str>,
    {
        let mut state = self.state.lock();
        let mut removed = false;
        for symbol in symbols {
            if let Ok(symbol) = normalize_symbol(symbol.as_ref()) {
                removed |= state
                    .tickers
                    .remove(&topic_for(&symbol, TopicKind::Ticker))
                    .is_some();
            }
        }
        if !removed {
            return Ok(());
        }
        self.push_topics(&state)
    }

    pub fn subscribe_depth<F>(&self, symbol: &str, handler: F) -> Result<(), MarketError>
    where
        F: Fn(&DepthUpdate) + Send + Sync + 'static,
    {
        let symbol = normalize_symbol(symbol)?;
        let mut state = self.state.lock();
        state
            .depth
            .insert(topic_for(&symbol, TopicKind::Depth), Arc::new(handler));
        self.push_topics(&state)
    }

    pub fn unsubscribe_depth(&self, symbol: &str) -> Result<(), MarketError> {
        let Ok(symbol) = normalize_symbol(symbol) else {
            return Ok(());
        };
        let mut state = self.state.lock();
        if state
            .depth
            .remove(&topic_for(&symbol, TopicKind::Depth))
            .is_none()
        {
            return Ok(());
        }
        self.push_topics(&state)
    }

    /// Decodes one frame and hands the result to its subscriber, if any.
    pub fn dispatch(&self, raw: &str) {
        let frame = decode_frame(raw);
        let delivery = {
            let mut state = self.state.lock();
            state.stats.frames_seen += 1;
            let Some(frame) = frame else {
                state.stats.malformed_dropped += 1;
                return;
            };
            let Some(topic) = frame.topic else {
                debug!(stream = ?frame.stream, "dropping unhandled event kind");
                state.stats.unrouted_dropped += 1;
                return;
            };

            let delivery = match frame.event {
                MarketEvent::Kline(update) => Some(state.route_tick(&topic, &update.tick)),
                MarketEvent::Trade(update) => Some(state.route_tick(&topic, &update.tick())),
                MarketEvent::Ticker(summary) => state.tickers.get(&topic).map(|handler| {
                    Some(Delivery::Ticker(Arc::clone(handler), summary))
                }),
                MarketEvent::Depth(update) => state
                    .depth
                    .get(&topic)
                    .map(|handler| Some(Delivery::Depth(Arc::clone(handler), update))),
                MarketEvent::Unhandled => None,
            };

            // Some(None) is a routed tick the aggregator declined.
            let is_candle_route = state.candle_routes.contains_key(&topic);
            match delivery {
                Some(Some(delivery)) => {
                    state.stats.frames_delivered += 1;
                    delivery
                }
                Some(None) if is_candle_route => return,
                _ => {
                    debug!(topic = %topic, "no subscriber for topic; dropping frame");
                    state.stats.unrouted_dropped += 1;
                    return;
                }
            }
        };

        delivery.deliver();
    }

    pub fn subscription_id(&self, symbol: &str, interval: Interval) -> Option<u64> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.state
            .lock()
            .candles
            .get(&SubscriptionKey::new(symbol, interval))
            .map(|subscription| subscription.id)
    }

    /// Seeds history only while subscription `id` is still the live one for
    /// `key`.
    pub fn seed_history(&self, key: &SubscriptionKey, id: u64, history: &[Candle]) -> bool {
        let mut state = self.state.lock();
        match state.candles.get(key) {
            Some(subscription) if subscription.id == id => state.aggregator.seed(key, history),
            _ => false,
        }
    }

    pub fn candles(&self, symbol: &str, interval: Interval) -> Vec<Candle> {
        let Ok(symbol) = normalize_symbol(symbol) else {
            return Vec::new();
        };
        self.state
            .lock()
            .aggregator
            .candles(&SubscriptionKey::new(symbol, interval))
    }

    pub fn required_topics(&self) -> BTreeSet<Topic> {
        self.state.lock().required_topics()
    }

    pub fn stats(&self) -> RegistryStats {
        self.state.lock().stats
    }

    /// Called with the state lock held. Sinks only enqueue, never call back.
    fn push_topics(&self, state: &RegistryState) -> Result<(), MarketError> {
        let topics = state.required_topics();
        if topics.is_empty() {
            self.sink.disconnect()
        } else {
            self.sink.ensure_topics(topics)
        }
    }
}

fn normalize_symbols<S: AsRef<str>>(symbols: &[S]) -> Result<Vec<String>, MarketError> {
    symbols
        .iter()
        .map(|symbol| normalize_symbol(symbol.as_ref()))
        .collect()
}
