//! 認識リクエスト
//!
//! `Connected` のセッション上で `requestOcr` を送り、サーバーから届く
//! progress / result / error を1リクエスト単位の `RecognitionRequest` に振り分ける。
//!
//! - セッションあたり同時に1リクエストまで
//! - 進捗は0回以上、終端（結果かエラー）はちょうど1回で最後
//! - 接続が `Connected` を離れたら終端は合成せず `Abandoned` を返す

use crate::error::{ConnectionError, RecognitionError};
use crate::guard::InFlightGuard;
use crate::session::{CloseReason, ConnectionState, SessionConnection, SessionEvent};
use receipt_ingest_common::{
    parse_server_message, ClientMessage, RecognitionProgress, RecognitionResult, ServerMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// 1リクエスト分のイベント
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Progress(RecognitionProgress),
    Result(RecognitionResult),
}

/// 認識プロトコル
#[derive(Debug, Clone)]
pub struct RecognitionProtocol {
    session: SessionConnection,
    in_flight: Arc<AtomicBool>,
    timeout: Duration,
}

impl RecognitionProtocol {
    pub fn new(session: SessionConnection, timeout: Duration) -> Self {
        Self {
            session,
            in_flight: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn session(&self) -> &SessionConnection {
        &self.session
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// アップロード済み画像の認識を依頼する
    pub fn request_recognition(&self, image_url: &str) -> Result<RecognitionRequest, RecognitionError> {
        // 送信前に購読して、速い応答も取りこぼさない
        let events = self.session.subscribe();

        let state = self.session.state();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(state).into());
        }

        let guard =
            InFlightGuard::try_acquire(&self.in_flight).ok_or(RecognitionError::AlreadyInFlight)?;

        let json = ClientMessage::request_ocr(image_url)
            .to_json()
            .map_err(|e| RecognitionError::Encode(e.to_string()))?;
        self.session.send(json)?;

        tracing::info!(image_url, "認識をリクエスト");
        Ok(RecognitionRequest {
            events,
            guard: Some(guard),
            last_percentage: None,
            timeout: self.timeout,
        })
    }
}

/// 進行中の認識リクエスト
#[derive(Debug)]
pub struct RecognitionRequest {
    events: broadcast::Receiver<SessionEvent>,
    guard: Option<InFlightGuard>,
    last_percentage: Option<u8>,
    timeout: Duration,
}

impl RecognitionRequest {
    /// 終端イベントを受け取ったか
    pub fn is_finished(&self) -> bool {
        self.guard.is_none()
    }

    /// 次のイベント
    ///
    /// # Returns
    /// * `Ok(Some(Progress))` - 進捗（パーセンテージは非減少）
    /// * `Ok(Some(Result))` - 結果（終端）
    /// * `Ok(None)` - 終端後
    /// * `Err` - サーバーエラー（終端）・レート制限・接続断
    pub async fn next(&mut self) -> Result<Option<RecognitionEvent>, RecognitionError> {
        if self.is_finished() {
            return Ok(None);
        }

        loop {
            let event = match self.events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "セッションイベントを取りこぼしました");
                    continue;
                }
                Err(RecvError::Closed) => {
                    return Err(self.finish_with(RecognitionError::Abandoned(
                        ConnectionState::Disconnected,
                    )));
                }
            };

            match event {
                SessionEvent::Message(text) => {
                    if let Some(result) = self.handle_message(&text) {
                        return result;
                    }
                }
                SessionEvent::StateChanged(state) if state != ConnectionState::Connected => {
                    tracing::warn!(state = %state, "認識リクエストを中断");
                    return Err(self.finish_with(RecognitionError::Abandoned(state)));
                }
                SessionEvent::Closed(CloseReason::RateLimited(reason)) => {
                    return Err(self.finish_with(RecognitionError::RateLimited(reason)));
                }
                _ => {}
            }
        }
    }

    /// 受信メッセージを解釈する。呼び出し元に返すものがなければ `None`
    fn handle_message(
        &mut self,
        text: &str,
    ) -> Option<Result<Option<RecognitionEvent>, RecognitionError>> {
        let message = match parse_server_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "解釈できないメッセージを無視");
                return None;
            }
        };

        match message {
            ServerMessage::Progress(progress) => {
                if let Some(last) = self.last_percentage {
                    if progress.percentage < last {
                        tracing::warn!(
                            last,
                            received = progress.percentage,
                            "順序が逆転した進捗を破棄"
                        );
                        return None;
                    }
                }
                self.last_percentage = Some(progress.percentage);
                tracing::debug!(
                    step = progress.current_step,
                    total = progress.total_steps,
                    percentage = progress.percentage,
                    "認識の進捗"
                );
                Some(Ok(Some(RecognitionEvent::Progress(progress))))
            }
            ServerMessage::Result(result) => {
                self.finish();
                tracing::info!(structured = result.is_structured(), "認識結果を受信");
                Some(Ok(Some(RecognitionEvent::Result(result))))
            }
            ServerMessage::Error(err) => {
                let error = if err.is_rate_limited() {
                    let reason = if err.message.is_empty() {
                        err.code
                    } else {
                        err.message
                    };
                    RecognitionError::RateLimited(reason)
                } else {
                    RecognitionError::Server {
                        code: err.code,
                        message: err.message,
                    }
                };
                Some(Err(self.finish_with(error)))
            }
            ServerMessage::Other(kind) => {
                tracing::debug!(kind = %kind, "認識と無関係なメッセージ");
                None
            }
        }
    }

    /// 結果まで待つ。進捗はコールバックで受け取る
    pub async fn wait<F>(mut self, mut on_progress: F) -> Result<RecognitionResult, RecognitionError>
    where
        F: FnMut(&RecognitionProgress),
    {
        let timeout = self.timeout;
        let waiting = async {
            loop {
                match self.next().await? {
                    Some(RecognitionEvent::Progress(progress)) => on_progress(&progress),
                    Some(RecognitionEvent::Result(result)) => return Ok(result),
                    None => {
                        return Err(RecognitionError::Abandoned(ConnectionState::Disconnected))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, waiting).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(seconds = timeout.as_secs(), "認識結果の待機がタイムアウト");
                Err(RecognitionError::TimedOut(timeout.as_secs()))
            }
        }
    }

    fn finish(&mut self) {
        self.guard = None;
    }

    fn finish_with(&mut self, error: RecognitionError) -> RecognitionError {
        self.finish();
        error
    }
}
