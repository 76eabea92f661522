use serde::ser::Serializer;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },
    #[error("connection driver is not running")]
    DriverStopped,
    #[error("request rejected: {0}")]
    Rejected(RestError),
    #[error("retries exhausted: {0}")]
    Exhausted(RestError),
}

impl MarketError {
    /// Transport-level failures that a caller may reasonably try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Reqwest(_) | Self::WebSocket(_) | Self::ConnectTimeout { .. } | Self::Exhausted(_)
        )
    }

    pub fn rest_error(&self) -> Option<&RestError> {
        match self {
            Self::Rejected(error) | Self::Exhausted(error) => Some(error),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl Serialize for MarketError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Structured failure surfaced by the REST loader.
///
/// `status` is the HTTP status when a response was received; `code` is the
/// exchange error code from the body when present, otherwise the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestError {
    pub status: Option<u16>,
    pub code: i64,
    pub message: String,
    pub timestamp: i64,
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "http {status} (code {}): {}", self.code, self.message),
            None => write!(f, "network (code {}): {}", self.code, self.message),
        }
    }
}
