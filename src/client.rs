use crate::config::{MarketStreamArgs, MarketStreamConfig};
use crate::error::MarketError;
use crate::market::binance::SnapshotLoader;
use crate::market::connection::{ConnectionManager, InboundFrame, StatusListener};
use crate::market::registry::{RegistryStats, SubscriptionRegistry};
use crate::market::transport::{Connector, TungsteniteConnector};
use crate::market::types::{
    normalize_symbol, Candle, ConnectionSnapshot, ConnectionStatus, DepthUpdate, Interval,
    MarketSummary, SubscriptionKey, TickerSummary,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct DispatchHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// History returned by [`MarketDataClient::prime_history`].
#[derive(Debug, Clone, PartialEq)]
pub struct PrimedHistory {
    pub candles: Vec<Candle>,
    /// Whether the candles were merged into the live series.
    pub applied: bool,
}

/// Composition point for the live stream: owns the connection driver, the
/// subscription registry, the frame dispatch task and the REST loader.
pub struct MarketDataClient {
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    loader: SnapshotLoader,
    dispatch: Mutex<Option<DispatchHandle>>,
}

impl MarketDataClient {
    /// Must be called from within a tokio runtime.
    pub fn new(config: MarketStreamConfig) -> Result<Self, MarketError> {
        Self::with_connector(config, Arc::new(TungsteniteConnector::default()))
    }

    pub fn from_args(args: Option<MarketStreamArgs>) -> Result<Self, MarketError> {
        Self::new(args.unwrap_or_default().normalize()?)
    }

    pub fn with_connector(
        config: MarketStreamConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, MarketError> {
        let loader = SnapshotLoader::new(&config)?;
        let (connection, frames) = ConnectionManager::spawn(&config, connector);
        let registry = SubscriptionRegistry::new(Arc::new(connection.clone()), config.candle_retention);

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let task_registry = registry.clone();
        let join_handle = tokio::spawn(async move {
            run_dispatch(task_registry, frames, task_token).await;
        });

        Ok(Self {
            connection,
            registry,
            loader,
            dispatch: Mutex::new(Some(DispatchHandle {
                cancellation_token,
                join_handle,
            })),
        })
    }

    pub fn subscribe<F>(&self, symbol: &str, interval: Interval, on_candle: F) -> Result<u64, MarketError>
    where
        F: Fn(&Candle) + Send + Sync + 'static,
    {
        self.registry.subscribe(symbol, interval, on_candle)
    }

    pub fn unsubscribe(&self, symbol: &str, interval: Interval) -> Result<(), MarketError> {
        self.registry.unsubscribe(symbol, interval)
    }

    pub fn subscribe_bulk<S, F>(&self, symbols: &[S], on_summary: F) -> Result<(), MarketError>
    where
        S: AsRef<str>,
        F: Fn(&TickerSummary) + Send + Sync + 'static,
    {
        self.registry.subscribe_bulk(symbols, on_summary)
    }

    pub fn unsubscribe_bulk<S: AsRef<str>>(&self, symbols: &[S]) -> Result<(), MarketError> {
        self.registry.unsubscribe_bulk(symbols)
    }

    pub fn subscribe_depth<F>(&self, symbol: &str, on_depth: F) -> Result<(), MarketError>
    where
        F: Fn(&DepthUpdate) + Send + Sync + 'static,
    {
        self.registry.subscribe_depth(symbol, on_depth)
    }

    pub fn unsubscribe_depth(&self, symbol: &str) -> Result<(), MarketError> {
        self.registry.unsubscribe_depth(symbol)
    }

    pub fn on_connection_status_change<F>(&self, listener: F) -> StatusListener
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.connection.on_status_change(listener)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub async fn load_history(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketError> {
        self.loader.load_history(symbol, interval, limit).await
    }

    pub async fn load_summary(&self, symbol: &str) -> Result<MarketSummary, MarketError> {
        self.loader.load_summary(symbol).await
    }

    pub async fn load_spot_symbols(&self) -> Result<Vec<String>, MarketError> {
        self.loader.load_spot_symbols().await
    }

    /// Loads history and merges it into the live series, but only if the
    /// subscription that existed when the request started is still the
    /// active one when the response lands.
    pub async fn prime_history(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<PrimedHistory, MarketError> {
        let symbol = normalize_symbol(symbol)?;
        let subscription_id = self.registry.subscription_id(&symbol, interval);
        let candles = self.loader.load_history(&symbol, interval, limit).await?;

        let key = SubscriptionKey::new(symbol, interval);
        let applied = match subscription_id {
            Some(id) => self.registry.seed_history(&key, id, &candles),
            None => false,
        };
        if !applied {
            debug!(subscription = %key, "history loaded for an inactive subscription; not seeding");
        }
        Ok(PrimedHistory { candles, applied })
    }

    pub fn candles(&self, symbol: &str, interval: Interval) -> Vec<Candle> {
        self.registry.candles(symbol, interval)
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Closes every socket and stops the dispatch task. Idempotent.
    pub async fn shutdown(&self) {
        let existing_handle = {
            let mut dispatch_slot = self.dispatch.lock().await;
            dispatch_slot.take()
        };
        let _ = self.connection.shutdown();
        if let Some(handle) = existing_handle {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
        }
    }
}

impl Drop for MarketDataClient {
    fn drop(&mut self) {
        let _ = self.connection.shutdown();
        if let Some(handle) = self.dispatch.get_mut().take() {
            handle.cancellation_token.cancel();
        }
    }
}

async fn run_dispatch(
    registry: SubscriptionRegistry,
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => registry.dispatch(&frame.text),
                None => break,
            },
        }
    }
    debug!("frame dispatch stopped");
}
