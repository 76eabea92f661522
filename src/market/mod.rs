pub mod aggregator;
pub mod backoff;
pub mod binance;
pub mod connection;
pub mod decoder;
pub mod registry;
pub mod topics;
pub mod transport;
pub mod types;
