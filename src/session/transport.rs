//! 常時接続の下位トランスポート
//!
//! 状態機械（`SessionConnection`）はこの2つのトレイト越しにしか通信しない。
//! 本番は `WsConnector`（tokio-tungstenite）、テストはスクリプト化した実装を使う。

use crate::error::ConnectionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// 受信イベント
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    /// 相手側からの切断。クローズフレームの理由があれば付く
    Closed { reason: Option<String> },
}

/// 確立済みの双方向チャネル
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError>;

    /// 次の受信イベント。切断後は常に `Closed` を返す
    async fn recv(&mut self) -> TransportEvent;

    async fn close(&mut self);
}

/// 接続を張るもの（再接続のたびに呼ばれる）
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// WebSocket接続
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    token: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(format!("{}: {}", self.url, e)))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ConnectionError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(Box::new(WsTransport {
            stream,
            closed: false,
        }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        if self.closed {
            return TransportEvent::Closed { reason: None };
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Text(text),
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    return TransportEvent::Closed { reason };
                }
                // Ping/Pong/Binaryは認識プロトコルでは使わない
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket read error");
                    self.closed = true;
                    return TransportEvent::Closed { reason: None };
                }
                None => {
                    self.closed = true;
                    return TransportEvent::Closed { reason: None };
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.close(None).await;
        }
    }
}
