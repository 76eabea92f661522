//! REST snapshots that prime the live stream.

use crate::config::MarketStreamConfig;
use crate::error::{MarketError, RestError};
use crate::market::backoff::BackoffPolicy;
use crate::market::types::{
    normalize_symbol, now_unix_ms, Candle, Interval, KlineWire, MarketSummary, SummaryWire,
};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const BINANCE_MAX_KLINES_PER_REQUEST: u32 = 1_000;

/// Exchange-side failure code used when a request never got a response.
const NETWORK_ERROR_CODE: i64 = -1;

fn klines_endpoint(base_url: &str, symbol: &str, interval: Interval, limit: u32) -> String {
    format!("{base_url}/api/v3/klines")
        + &format!(
            "?symbol={}&interval={}&limit={}",
            symbol.to_ascii_uppercase(),
            interval.as_str(),
            clamp_klines_limit(limit)
        )
}

fn summary_endpoint(base_url: &str, symbol: &str) -> String {
    format!("{base_url}/api/v3/ticker/24hr?symbol={}", symbol.to_ascii_uppercase())
}

fn spot_symbols_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/v3/exchangeInfo?permissions=SPOT")
}

pub fn clamp_klines_limit(limit: u32) -> u32 {
    limit.clamp(1, BINANCE_MAX_KLINES_PER_REQUEST)
}

#[derive(Debug, Deserialize)]
struct BinanceErrorWire {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfoWire {
    symbols: Vec<BinanceExchangeSymbolWire>,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeSymbolWire {
    symbol: String,
    status: String,
    #[serde(rename = "isSpotTradingAllowed")]
    is_spot_trading_allowed: bool,
}

/// Stateless loader for historical candles and 24h statistics.
#[derive(Debug, Clone)]
pub struct SnapshotLoader {
    client: Client,
    rest_base_url: String,
    retry: BackoffPolicy,
}

impl SnapshotLoader {
    pub fn new(config: &MarketStreamConfig) -> Result<Self, MarketError> {
        let client = Client::builder().timeout(config.rest_timeout).build()?;
        Ok(Self::with_client(client, &config.rest_base_url, config.rest_retry))
    }

    pub fn with_client(client: Client, rest_base_url: &str, retry: BackoffPolicy) -> Self {
        Self {
            client,
            rest_base_url: rest_base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    /// Loads up to `limit` candles, oldest first. `limit` is clamped to the
    /// exchange's per-request cap.
    pub async fn load_history(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketError> {
        let symbol = normalize_symbol(symbol)?;
        let endpoint = klines_endpoint(&self.rest_base_url, &symbol, interval, limit);
        let mut payload = self.get_json::<Vec<KlineWire>>(&endpoint).await?;

        payload.sort_unstable_by_key(|kline| kline.0);
        payload.dedup_by_key(|kline| kline.0);

        let mut candles: Vec<Candle> = Vec::with_capacity(payload.len());
        for kline in payload {
            candles.push(kline.try_into()?);
        }
        debug!(symbol = %symbol, interval = %interval, candles = candles.len(), "loaded candle history");
        Ok(candles)
    }

    pub async fn load_summary(&self, symbol: &str) -> Result<MarketSummary, MarketError> {
        let symbol = normalize_symbol(symbol)?;
        let endpoint = summary_endpoint(&self.rest_base_url, &symbol);
        let payload = self.get_json::<SummaryWire>(&endpoint).await?;
        payload.try_into()
    }

    /// Spot symbols currently trading, sorted and deduplicated.
    pub async fn load_spot_symbols(&self) -> Result<Vec<String>, MarketError> {
        let endpoint = spot_symbols_endpoint(&self.rest_base_url);
        let payload = self.get_json::<BinanceExchangeInfoWire>(&endpoint).await?;

        let mut symbols: Vec<String> = payload
            .symbols
            .into_iter()
            .filter(|entry| {
                entry.is_spot_trading_allowed && entry.status.eq_ignore_ascii_case("TRADING")
            })
            .map(|entry| entry.symbol)
            .collect();

        symbols.sort_unstable();
        symbols.dedup();
        Ok(symbols)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, MarketError> {
        let mut retries = 0_u32;
        loop {
            let (failure, retry_after) = match self.client.get(endpoint).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json::<T>().await?);
                }
                Ok(response) => {
                    let status = response.status();
                    let retry_after = retry_after_delay(&response);
                    let failure = rest_error_from_response(response).await;
                    if !is_transient_status(status) {
                        warn!(endpoint, error = %failure, "request rejected");
                        return Err(MarketError::Rejected(failure));
                    }
                    (failure, retry_after)
                }
                Err(error) if error.is_builder() => return Err(error.into()),
                Err(error) => (
                    RestError {
                        status: None,
                        code: NETWORK_ERROR_CODE,
                        message: error.to_string(),
                        timestamp: now_unix_ms(),
                    },
                    None,
                ),
            };

            retries += 1;
            if self.retry.is_exhausted(retries) {
                warn!(endpoint, retries = retries - 1, error = %failure, "request retries exhausted");
                return Err(MarketError::Exhausted(failure));
            }

            let delay = match retry_after {
                Some(delay) => delay.min(self.retry.cap),
                None => self.retry.delay_for(retries - 1),
            };
            warn!(
                endpoint,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retry_after_delay(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn rest_error_from_response(response: Response) -> RestError {
    let status = response.status();
    let body = response.bytes().await.map(|bytes| bytes.to_vec()).unwrap_or_default();
    rest_error_from_body(status, body)
}

fn rest_error_from_body(status: StatusCode, mut body: Vec<u8>) -> RestError {
    let timestamp = now_unix_ms();
    match simd_json::serde::from_slice::<BinanceErrorWire>(body.as_mut_slice()) {
        Ok(wire) => RestError {
            status: Some(status.as_u16()),
            code: wire.code,
            message: wire.msg,
            timestamp,
        },
        Err(_) => RestError {
            status: Some(status.as_u16()),
            code: i64::from(status.as_u16()),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
            timestamp,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_URL: &str = "https://api.binance.com";

    #[test]
    fn klines_endpoint_uses_interval_and_limit() {
        let endpoint = klines_endpoint(BASE_URL, "btcusdt", Interval::W1, 300);
        assert!(endpoint.starts_with("https://api.binance.com/api/v3/klines?"));
        assert!(endpoint.contains("symbol=BTCUSDT"));
        assert!(endpoint.contains("interval=1w"));
        assert!(endpoint.contains("limit=300"));
    }

    #[test]
    fn klines_limit_is_clamped_to_exchange_cap() {
        let endpoint = klines_endpoint(BASE_URL, "BTCUSDT", Interval::H1, 2_000);
        assert!(endpoint.ends_with("limit=1000"));
        assert_eq!(clamp_klines_limit(0), 1);
    }

    #[test]
    fn summary_endpoint_uses_uppercase_symbol() {
        let endpoint = summary_endpoint(BASE_URL, "ethusdt");
        assert_eq!(endpoint, "https://api.binance.com/api/v3/ticker/24hr?symbol=ETHUSDT");
    }

    #[test]
    fn spot_symbols_endpoint_requests_spot_permissions() {
        let endpoint = spot_symbols_endpoint(BASE_URL);
        assert!(endpoint.contains("/api/v3/exchangeInfo"));
        assert!(endpoint.contains("permissions=SPOT"));
    }

    #[test]
    fn only_server_errors_and_rate_limits_are_transient() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::IM_A_TEAPOT));
    }

    #[test]
    fn parses_exchange_error_body() {
        let error = rest_error_from_body(
            StatusCode::BAD_REQUEST,
            br#"{"code":-1121,"msg":"Invalid symbol."}"#.to_vec(),
        );
        assert_eq!(error.status, Some(400));
        assert_eq!(error.code, -1121);
        assert_eq!(error.message, "Invalid symbol.");
    }

    #[test]
    fn falls_back_to_status_when_body_is_not_an_exchange_error() {
        let error = rest_error_from_body(StatusCode::SERVICE_UNAVAILABLE, b"<html>".to_vec());
        assert_eq!(error.status, Some(503));
        assert_eq!(error.code, 503);
        assert_eq!(error.message, "Service Unavailable");
    }
}
