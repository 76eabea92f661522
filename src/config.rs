use crate::error::MarketError;
use crate::market::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_WS_BASE_URL: &str = "wss://stream.binance.com:9443";
pub const DEFAULT_REST_BASE_URL: &str = "https://api.binance.com";
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 250;
pub const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 250;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 8;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_FALLBACK_PER_TOPIC: bool = true;
pub const DEFAULT_CANDLE_RETENTION: u16 = 500;
pub const DEFAULT_REST_MAX_RETRIES: u32 = 3;
pub const DEFAULT_REST_RETRY_BASE_MS: u64 = 250;
pub const DEFAULT_REST_RETRY_CAP_MS: u64 = 4_000;
pub const DEFAULT_REST_TIMEOUT_MS: u64 = 10_000;
pub const MIN_RECONNECT_BASE_MS: u64 = 10;
pub const MAX_RECONNECT_BASE_MS: u64 = 10_000;
pub const MAX_RECONNECT_CAP_MS: u64 = 300_000;
pub const MAX_RECONNECT_JITTER_MS: u64 = 5_000;
pub const MIN_MAX_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_MAX_RECONNECT_ATTEMPTS: u32 = 100;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 100;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;
pub const MIN_CANDLE_RETENTION: u16 = 1;
pub const MAX_CANDLE_RETENTION: u16 = 10_000;
pub const MAX_REST_MAX_RETRIES: u32 = 10;
pub const MIN_REST_RETRY_BASE_MS: u64 = 1;
pub const MAX_REST_RETRY_CAP_MS: u64 = 60_000;
pub const MIN_REST_TIMEOUT_MS: u64 = 100;
pub const MAX_REST_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamArgs {
    pub ws_base_url: Option<String>,
    pub rest_base_url: Option<String>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_cap_ms: Option<u64>,
    pub reconnect_jitter_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub fallback_per_topic: Option<bool>,
    pub candle_retention: Option<u16>,
    pub rest_max_retries: Option<u32>,
    pub rest_retry_base_ms: Option<u64>,
    pub rest_retry_cap_ms: Option<u64>,
    pub rest_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MarketStreamConfig {
    pub ws_base_url: String,
    pub rest_base_url: String,
    pub reconnect: BackoffPolicy,
    pub connect_timeout: Duration,
    pub fallback_per_topic: bool,
    pub candle_retention: usize,
    pub rest_retry: BackoffPolicy,
    pub rest_timeout: Duration,
}

impl Default for MarketStreamConfig {
    fn default() -> Self {
        Self {
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
            reconnect: BackoffPolicy {
                base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
                cap: Duration::from_millis(DEFAULT_RECONNECT_CAP_MS),
                jitter: Duration::from_millis(DEFAULT_RECONNECT_JITTER_MS),
                max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            },
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            fallback_per_topic: DEFAULT_FALLBACK_PER_TOPIC,
            candle_retention: usize::from(DEFAULT_CANDLE_RETENTION),
            rest_retry: BackoffPolicy {
                base: Duration::from_millis(DEFAULT_REST_RETRY_BASE_MS),
                cap: Duration::from_millis(DEFAULT_REST_RETRY_CAP_MS),
                jitter: Duration::ZERO,
                max_attempts: DEFAULT_REST_MAX_RETRIES,
            },
            rest_timeout: Duration::from_millis(DEFAULT_REST_TIMEOUT_MS),
        }
    }
}

fn normalize_base_url(
    value: Option<String>,
    default: &str,
    schemes: &[&str],
    field: &str,
) -> Result<String, MarketError> {
    let url = value
        .unwrap_or_else(|| default.to_string())
        .trim()
        .trim_end_matches('/')
        .to_string();
    if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(MarketError::InvalidArgument(format!(
            "{field} must start with one of {}",
            schemes.join(", ")
        )));
    }
    Ok(url)
}

impl MarketStreamArgs {
    pub fn normalize(self) -> Result<MarketStreamConfig, MarketError> {
        let ws_base_url = normalize_base_url(
            self.ws_base_url,
            DEFAULT_WS_BASE_URL,
            &["ws://", "wss://"],
            "wsBaseUrl",
        )?;
        let rest_base_url = normalize_base_url(
            self.rest_base_url,
            DEFAULT_REST_BASE_URL,
            &["http://", "https://"],
            "restBaseUrl",
        )?;

        let reconnect_base_ms = self.reconnect_base_ms.unwrap_or(DEFAULT_RECONNECT_BASE_MS);
        if !(MIN_RECONNECT_BASE_MS..=MAX_RECONNECT_BASE_MS).contains(&reconnect_base_ms) {
            return Err(MarketError::InvalidArgument(format!(
                "reconnectBaseMs must be between {MIN_RECONNECT_BASE_MS} and {MAX_RECONNECT_BASE_MS}"
            )));
        }

        let reconnect_cap_ms = self.reconnect_cap_ms.unwrap_or(DEFAULT_RECONNECT_CAP_MS);
        if !(reconnect_base_ms..=MAX_RECONNECT_CAP_MS).contains(&reconnect_cap_ms) {
            return Err(MarketError::InvalidArgument(format!(
                "reconnectCapMs must be between reconnectBaseMs and {MAX_RECONNECT_CAP_MS}"
            )));
        }

        let reconnect_jitter_ms = self
            .reconnect_jitter_ms
            .unwrap_or(DEFAULT_RECONNECT_JITTER_MS);
        if reconnect_jitter_ms > MAX_RECONNECT_JITTER_MS {
            return Err(MarketError::InvalidArgument(format!(
                "reconnectJitterMs must be at most {MAX_RECONNECT_JITTER_MS}"
            )));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if !(MIN_MAX_RECONNECT_ATTEMPTS..=MAX_MAX_RECONNECT_ATTEMPTS)
            .contains(&max_reconnect_attempts)
        {
            return Err(MarketError::InvalidArgument(format!(
                "maxReconnectAttempts must be between {MIN_MAX_RECONNECT_ATTEMPTS} and {MAX_MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let connect_timeout_ms = self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_CONNECT_TIMEOUT_MS..=MAX_CONNECT_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(MarketError::InvalidArgument(format!(
                "connectTimeoutMs must be between {MIN_CONNECT_TIMEOUT_MS} and {MAX_CONNECT_TIMEOUT_MS}"
            )));
        }

        let fallback_per_topic = self.fallback_per_topic.unwrap_or(DEFAULT_FALLBACK_PER_TOPIC);

        let candle_retention = self.candle_retention.unwrap_or(DEFAULT_CANDLE_RETENTION);
        if !(MIN_CANDLE_RETENTION..=MAX_CANDLE_RETENTION).contains(&candle_retention) {
            return Err(MarketError::InvalidArgument(format!(
                "candleRetention must be between {MIN_CANDLE_RETENTION} and {MAX_CANDLE_RETENTION}"
            )));
        }

        let rest_max_retries = self.rest_max_retries.unwrap_or(DEFAULT_REST_MAX_RETRIES);
        if rest_max_retries > MAX_REST_MAX_RETRIES {
            return Err(MarketError::InvalidArgument(format!(
                "restMaxRetries must be at most {MAX_REST_MAX_RETRIES}"
            )));
        }

        let rest_retry_base_ms = self.rest_retry_base_ms.unwrap_or(DEFAULT_REST_RETRY_BASE_MS);
        let rest_retry_cap_ms = self.rest_retry_cap_ms.unwrap_or(DEFAULT_REST_RETRY_CAP_MS);
        if rest_retry_base_ms < MIN_REST_RETRY_BASE_MS
            || !(rest_retry_base_ms..=MAX_REST_RETRY_CAP_MS).contains(&rest_retry_cap_ms)
        {
            return Err(MarketError::InvalidArgument(format!(
                "restRetryBaseMs must be at least {MIN_REST_RETRY_BASE_MS} and restRetryCapMs between it and {MAX_REST_RETRY_CAP_MS}"
            )));
        }

        let rest_timeout_ms = self.rest_timeout_ms.unwrap_or(DEFAULT_REST_TIMEOUT_MS);
        if !(MIN_REST_TIMEOUT_MS..=MAX_REST_TIMEOUT_MS).contains(&rest_timeout_ms) {
            return Err(MarketError::InvalidArgument(format!(
                "restTimeoutMs must be between {MIN_REST_TIMEOUT_MS} and {MAX_REST_TIMEOUT_MS}"
            )));
        }

        Ok(MarketStreamConfig {
            ws_base_url,
            rest_base_url,
            reconnect: BackoffPolicy {
                base: Duration::from_millis(reconnect_base_ms),
                cap: Duration::from_millis(reconnect_cap_ms),
                jitter: Duration::from_millis(reconnect_jitter_ms),
                max_attempts: max_reconnect_attempts,
            },
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            fallback_per_topic,
            candle_retention: usize::from(candle_retention),
            rest_retry: BackoffPolicy {
                base: Duration::from_millis(rest_retry_base_ms),
                cap: Duration::from_millis(rest_retry_cap_ms),
                jitter: Duration::ZERO,
                max_attempts: rest_max_retries,
            },
            rest_timeout: Duration::from_millis(rest_timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = MarketStreamArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.ws_base_url, DEFAULT_WS_BASE_URL);
        assert_eq!(config.rest_base_url, DEFAULT_REST_BASE_URL);
        assert_eq!(
            config.reconnect.base,
            Duration::from_millis(DEFAULT_RECONNECT_BASE_MS)
        );
        assert_eq!(config.reconnect.max_attempts, DEFAULT_MAX_RECONNECT_ATTEMPTS);
        assert_eq!(config.fallback_per_topic, DEFAULT_FALLBACK_PER_TOPIC);
        assert_eq!(config.candle_retention, usize::from(DEFAULT_CANDLE_RETENTION));
        assert_eq!(config.rest_retry.max_attempts, DEFAULT_REST_MAX_RETRIES);
        assert_eq!(config.rest_retry.jitter, Duration::ZERO);
    }

    #[test]
    fn trims_trailing_slash_from_base_urls() {
        let config = MarketStreamArgs {
            ws_base_url: Some("ws://127.0.0.1:9000/".to_string()),
            rest_base_url: Some("http://127.0.0.1:9001/".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("local urls should be valid");

        assert_eq!(config.ws_base_url, "ws://127.0.0.1:9000");
        assert_eq!(config.rest_base_url, "http://127.0.0.1:9001");
    }

    #[test]
    fn rejects_wrong_url_scheme() {
        let result = MarketStreamArgs {
            ws_base_url: Some("https://stream.binance.com".to_string()),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_cap_below_base() {
        let result = MarketStreamArgs {
            reconnect_base_ms: Some(1_000),
            reconnect_cap_ms: Some(500),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_candle_retention_range() {
        let result = MarketStreamArgs {
            candle_retention: Some(0),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_max_reconnect_attempts_range() {
        let result = MarketStreamArgs {
            max_reconnect_attempts: Some(0),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn deserializes_camel_case_args() {
        let args: MarketStreamArgs = serde_json::from_str(
            r#"{"maxReconnectAttempts":3,"fallbackPerTopic":false,"candleRetention":200}"#,
        )
        .expect("args should deserialize");
        let config = args.normalize().expect("args should be valid");

        assert_eq!(config.reconnect.max_attempts, 3);
        assert!(!config.fallback_per_topic);
        assert_eq!(config.candle_retention, 200);
    }
}
