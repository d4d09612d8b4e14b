//! WebSocketトランスポートの結合テスト
//!
//! ローカルに立てたtokio-tungsteniteサーバーに実際に接続する

use futures_util::{SinkExt, StreamExt};
use receipt_ingest::config::SessionConfig;
use receipt_ingest::error::ConnectionError;
use receipt_ingest::session::{
    CloseReason, ConnectionState, Connector, SessionConnection, SessionEvent, WsConnector,
};
use receipt_ingest_common::ClientMessage;
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

fn config(url: String) -> SessionConfig {
    SessionConfig {
        url,
        token: Some("secret-token".into()),
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 1,
    }
}

async fn next_event<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

/// 要求を受けて進捗を返し、レート制限の理由で閉じるサーバー
#[tokio::test]
async fn test_round_trip_and_rate_limit_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, auth_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| {
            let auth = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = auth_tx.send(auth);
            Ok::<_, ErrorResponse>(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        let request = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("Expected text: {:?}", other),
        };
        ws.send(Message::Text(
            r#"{"type":"progress","currentStep":1,"totalSteps":2,"percentage":50}"#.into(),
        ))
        .await
        .unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed("rate limit exceeded"),
        }))
        .await
        .unwrap();
        // クライアントのクローズ応答を読み切る
        while let Some(Ok(_)) = ws.next().await {}
        request
    });

    let session = SessionConnection::websocket(&config(format!("ws://{}", addr)));
    let mut events = session.subscribe();
    session.connect().await.unwrap();
    assert_eq!(
        auth_rx.await.unwrap().as_deref(),
        Some("Bearer secret-token")
    );

    session
        .send_message(&ClientMessage::request_ocr("https://cdn.example.com/r.jpg"))
        .unwrap();

    let message = next_event(&mut events, |e| matches!(e, SessionEvent::Message(_))).await;
    assert!(matches!(message, SessionEvent::Message(text) if text.contains("progress")));

    let closed = next_event(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await;
    assert_eq!(
        closed,
        SessionEvent::Closed(CloseReason::RateLimited("rate limit exceeded".into()))
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let received = server.await.unwrap();
    assert_eq!(
        received,
        r#"{"action":"requestOcr","imageUrl":"https://cdn.example.com/r.jpg"}"#
    );
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector = WsConnector::new(format!("ws://{}", addr), None);
    assert!(matches!(
        connector.connect().await,
        Err(ConnectionError::Connect(_))
    ));
}

#[tokio::test]
async fn test_invalid_url() {
    let connector = WsConnector::new("not a url", None);
    assert!(matches!(
        connector.connect().await,
        Err(ConnectionError::InvalidUrl(_))
    ));
}

/// サーバーが普通に閉じたら再接続を試み、上限でErrorになる
#[tokio::test]
async fn test_plain_close_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // 以後の接続（再接続）は拒否する
        drop(listener);
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.close(None).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let session = SessionConnection::websocket(&config(format!("ws://{}", addr)));
    let mut events = session.subscribe();
    session.connect().await.unwrap();

    next_event(&mut events, |e| {
        *e == SessionEvent::StateChanged(ConnectionState::Reconnecting)
    })
    .await;
    let closed = next_event(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await;
    assert_eq!(
        closed,
        SessionEvent::Closed(CloseReason::ReconnectExhausted(1))
    );
    assert_eq!(session.state(), ConnectionState::Error);
}
