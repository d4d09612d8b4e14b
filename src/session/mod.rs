//! 常時接続の状態管理
//!
//! 状態遷移:
//! - `Disconnected → Connecting → Connected`
//! - `Connected → Reconnecting`（予期しない切断）
//! - `Reconnecting → Connected`（成功）/ `Reconnecting → Error`（上限到達）
//! - レート制限による切断は `Disconnected` に直行し、再接続しない
//! - `disconnect()` はどの状態からでも `Disconnected` にし、待機中の再接続を取り消す
//!
//! 状態は `watch`、イベントは `broadcast` で購読する。書き込みは
//! 接続ごとの世代番号で守られ、`disconnect()` 後に古いタスクが状態を変えることはない。

mod transport;

pub use receipt_ingest_common::ConnectionState;
pub use transport::{Connector, Transport, TransportEvent, WsConnector};

use crate::config::SessionConfig;
use crate::error::ConnectionError;
use receipt_ingest_common::{is_rate_limit_message, parse_server_message, ClientMessage, ServerMessage};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// セッションイベント
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ReconnectAttempt { attempt: u32, max_attempts: u32 },
    /// 受信テキスト（未解釈）
    Message(String),
    /// セッションが終わった理由（利用者の `disconnect()` 以外）
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    RateLimited(String),
    ReconnectExhausted(u32),
}

/// 常時接続クライアント（複製は同じ接続を指す）
#[derive(Clone)]
pub struct SessionConnection {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
}

/// 接続中ループの終わり方
enum Exit {
    Cancelled,
    Lost,
    RateLimited(String),
}

impl SessionConnection {
    pub fn new(connector: Arc<dyn Connector>, config: &SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect_interval: config.reconnect_interval,
                max_reconnect_attempts: config.max_reconnect_attempts,
                state_tx,
                events,
                control: Mutex::new(Control::default()),
            }),
        }
    }

    /// WebSocketで接続するセッション
    pub fn websocket(config: &SessionConfig) -> Self {
        let connector = WsConnector::new(config.url.clone(), config.token.clone());
        Self::new(Arc::new(connector), config)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// 接続する
    ///
    /// 既に接続済みなら何もしない。初回接続の失敗は `Error` 状態にして返す
    /// （自動再接続は一度 `Connected` になった後だけ）。
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (generation, cancel) = {
            let mut control = self.inner.lock();
            if *self.inner.state_tx.borrow() == ConnectionState::Connected {
                return Ok(());
            }
            control.generation += 1;
            if let Some(previous) = control.cancel.take() {
                previous.cancel();
            }
            control.outbound = None;
            let cancel = CancellationToken::new();
            control.cancel = Some(cancel.clone());
            self.inner.apply_state(ConnectionState::Connecting);
            (control.generation, cancel)
        };

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ConnectionError::NotConnected(self.state()));
            }
            result = self.inner.connector.connect() => result,
        };

        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, "接続に失敗");
                self.inner.transition(generation, ConnectionState::Error);
                return Err(e);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut control = self.inner.lock();
            if control.generation != generation {
                drop(control);
                transport.close().await;
                return Err(ConnectionError::NotConnected(self.state()));
            }
            control.outbound = Some(outbound_tx);
            self.inner.apply_state(ConnectionState::Connected);
        }

        tokio::spawn(drive(
            self.inner.clone(),
            generation,
            transport,
            outbound_rx,
            cancel,
        ));
        Ok(())
    }

    /// 切断する（どの状態からでも有効）
    pub fn disconnect(&self) {
        let mut control = self.inner.lock();
        control.generation += 1;
        if let Some(cancel) = control.cancel.take() {
            cancel.cancel();
        }
        control.outbound = None;
        self.inner.apply_state(ConnectionState::Disconnected);
    }

    /// テキストを送信キューに積む
    pub fn send(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        let control = self.inner.lock();
        let state = *self.inner.state_tx.borrow();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(state));
        }
        let outbound = control
            .outbound
            .as_ref()
            .ok_or(ConnectionError::NotConnected(state))?;
        outbound
            .send(text.into())
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    pub fn send_message(&self, message: &ClientMessage) -> Result<(), ConnectionError> {
        let json = message
            .to_json()
            .map_err(|e| ConnectionError::Send(e.to_string()))?;
        self.send(json)
    }
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 呼び出し側はロックを保持していること
    fn apply_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "接続状態が変化");
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }

    /// 世代が一致するときだけ状態を変える
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        let control = self.lock();
        if control.generation != generation {
            return false;
        }
        self.apply_state(state);
        true
    }

    fn publish(&self, generation: u64, event: SessionEvent) -> bool {
        let control = self.lock();
        if control.generation != generation {
            return false;
        }
        drop(control);
        let _ = self.events.send(event);
        true
    }

    /// 状態を変えてから終了イベントを流す
    fn finish(&self, generation: u64, state: ConnectionState, reason: CloseReason) {
        let control = self.lock();
        if control.generation != generation {
            return;
        }
        self.apply_state(state);
        let _ = self.events.send(SessionEvent::Closed(reason));
    }
}

/// 接続ごとの駆動タスク
async fn drive(
    inner: Arc<Inner>,
    generation: u64,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        match run_connected(&inner, generation, transport.as_mut(), &mut outbound, &cancel).await {
            Exit::Cancelled => {
                transport.close().await;
                return;
            }
            Exit::RateLimited(reason) => {
                tracing::warn!(reason = %reason, "リクエスト制限により切断");
                transport.close().await;
                inner.finish(
                    generation,
                    ConnectionState::Disconnected,
                    CloseReason::RateLimited(reason),
                );
                return;
            }
            Exit::Lost => {
                tracing::warn!("接続が切れました");
            }
        }

        // 切断前に積まれた送信は捨てる
        while outbound.try_recv().is_ok() {}

        if !inner.transition(generation, ConnectionState::Reconnecting) {
            return;
        }
        transport = match reconnect(&inner, generation, &cancel).await {
            Some(next) => next,
            None => return,
        };
        if !inner.transition(generation, ConnectionState::Connected) {
            transport.close().await;
            return;
        }
    }
}

async fn run_connected(
    inner: &Inner,
    generation: u64,
    transport: &mut dyn Transport,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> Exit {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Exit::Cancelled,
            Some(text) = outbound.recv() => {
                if let Err(e) = transport.send(text).await {
                    tracing::warn!(error = %e, "送信に失敗");
                    return Exit::Lost;
                }
            }
            event = transport.recv() => match event {
                TransportEvent::Text(text) => {
                    let rate_limited = is_rate_limit_error(&text);
                    if !inner.publish(generation, SessionEvent::Message(text.clone())) {
                        return Exit::Cancelled;
                    }
                    if rate_limited {
                        return Exit::RateLimited(text);
                    }
                }
                TransportEvent::Closed { reason } => {
                    return match reason {
                        Some(reason) if is_rate_limit_message(&reason) => Exit::RateLimited(reason),
                        _ => Exit::Lost,
                    };
                }
            },
        }
    }
}

/// 受信テキストがレート制限エラーか
fn is_rate_limit_error(text: &str) -> bool {
    matches!(parse_server_message(text), Ok(ServerMessage::Error(err)) if err.is_rate_limited())
}

/// 固定間隔で最大 `max_reconnect_attempts` 回試す。上限到達で `Error`
async fn reconnect(
    inner: &Inner,
    generation: u64,
    cancel: &CancellationToken,
) -> Option<Box<dyn Transport>> {
    let max_attempts = inner.max_reconnect_attempts;
    for attempt in 1..=max_attempts {
        if !inner.publish(
            generation,
            SessionEvent::ReconnectAttempt {
                attempt,
                max_attempts,
            },
        ) {
            return None;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(inner.reconnect_interval) => {}
        }

        tracing::info!(attempt, max_attempts, "再接続を試行");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = inner.connector.connect() => result,
        };
        match result {
            Ok(transport) => return Some(transport),
            Err(e) => tracing::warn!(attempt, error = %e, "再接続に失敗"),
        }
    }

    inner.finish(
        generation,
        ConnectionState::Error,
        CloseReason::ReconnectExhausted(max_attempts),
    );
    None
}
