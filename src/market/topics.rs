//! Exchange stream names.
//!
//! Topics are lowercase `{symbol}@{channel}` strings; set membership of these
//! names is what decides which sockets are open.

use crate::market::types::Interval;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Kline(Interval),
    Trade,
    AggTrade,
    Ticker,
    MiniTicker,
    Depth,
}

impl TopicKind {
    fn channel(self) -> String {
        match self {
            Self::Kline(interval) => format!("kline_{}", interval.as_str()),
            Self::Trade => "trade".to_string(),
            Self::AggTrade => "aggTrade".to_string(),
            Self::Ticker => "ticker".to_string(),
            Self::MiniTicker => "miniTicker".to_string(),
            Self::Depth => "depth".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds a topic from already-derived parts without validation. Used by
    /// the decoder, whose interval label comes straight off the wire.
    pub fn from_parts(symbol: &str, channel: &str) -> Self {
        Self(format!("{}@{channel}", symbol.to_ascii_lowercase()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn topic_for(symbol: &str, kind: TopicKind) -> Topic {
    Topic::from_parts(symbol, &kind.channel())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub symbol: String,
    pub channel: String,
}

/// Splits a topic back into an uppercase symbol and its channel label.
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let (symbol, channel) = topic.split_once('@')?;
    if symbol.is_empty() || channel.is_empty() {
        return None;
    }
    Some(ParsedTopic {
        symbol: symbol.to_ascii_uppercase(),
        channel: channel.to_string(),
    })
}

/// Joins topics into one multiplexed stream URL.
pub fn multiplexed_url<'a>(ws_base_url: &str, topics: impl IntoIterator<Item = &'a Topic>) -> String {
    let joined = topics
        .into_iter()
        .map(Topic::as_str)
        .collect::<Vec<_>>()
        .join("/");
    format!("{ws_base_url}/stream?streams={joined}")
}

pub fn single_topic_url(ws_base_url: &str, topic: &Topic) -> String {
    format!("{ws_base_url}/ws/{topic}")
}
