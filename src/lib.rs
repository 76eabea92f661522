mod client;
pub mod config;
pub mod error;
pub mod market;

pub use client::{MarketDataClient, PrimedHistory};
pub use config::{MarketStreamArgs, MarketStreamConfig};
pub use error::{MarketError, RestError};
pub use market::backoff::{backoff_delay, BackoffPolicy};
pub use market::binance::SnapshotLoader;
pub use market::connection::{ConnectionManager, InboundFrame, StatusListener, TopicSink};
pub use market::registry::{RegistryStats, SubscriptionRegistry};
pub use market::topics::{parse_topic, topic_for, Topic, TopicKind};
pub use market::transport::{Connector, FrameStream, SocketEvent, TungsteniteConnector};
pub use market::types::{
    Candle, CandleFeed, ConnectionMode, ConnectionSnapshot, ConnectionStatus, DepthUpdate,
    Interval, MarketSummary, SubscriptionKey, TickerSummary,
};
