use crate::error::MarketError;
use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub const CLOSE_NORMAL: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the connection driver sees of a socket. A stream always ends with
/// exactly one `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// `code` is `None` when the socket dropped without a close frame.
    Closed { code: Option<u16>, reason: String },
}

impl SocketEvent {
    pub fn is_normal_close(&self) -> bool {
        matches!(self, Self::Closed { code: Some(CLOSE_NORMAL), .. })
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = SocketEvent> + Send>>;

/// Opens one read-side socket for a stream URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<FrameStream, MarketError>;
}

#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    max_message_size: usize,
    max_frame_size: usize,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            max_message_size: 64 << 20,
            max_frame_size: 16 << 20,
        }
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, MarketError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_frame_size),
            ..Default::default()
        };

        let (ws, response) = connect_async_with_config(url, Some(ws_config), true).await?;
        debug!(url, status = %response.status(), "websocket handshake complete");
        Ok(Box::pin(socket_events(ws)))
    }
}

fn socket_events(ws: WsStream) -> impl Stream<Item = SocketEvent> + Send {
    stream::unfold(Some(ws), |state| async move {
        let mut ws = state?;
        loop {
            let event = match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some((SocketEvent::Text(text), Some(ws))),
                Some(Ok(Message::Binary(payload))) => match String::from_utf8(payload) {
                    Ok(text) => return Some((SocketEvent::Text(text), Some(ws))),
                    Err(_) => {
                        debug!("dropping non-utf8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    SocketEvent::Closed { code, reason }
                }
                Some(Ok(_)) => continue,
                Some(Err(error)) => SocketEvent::Closed {
                    code: None,
                    reason: error.to_string(),
                },
                None => SocketEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                },
            };
            return Some((event, None));
        }
    })
}
