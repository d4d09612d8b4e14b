//! 認識セッションのメッセージ定義とパーサー
//!
//! 常時接続上でやり取りするJSONメッセージ:
//! - 送信: `{"action": "requestOcr", "imageUrl": ...}`
//! - 受信: `progress` / `result` / `error`（`type`フィールドで判別）
//!
//! 受信メッセージは平坦形式（`{"type":"progress","percentage":10}`）と
//! エンベロープ形式（`{"type":"progress","data":{...}}`）の両方を受け付ける。

use crate::error::{Error, Result};
use crate::types::{RecognitionProgress, RecognitionResult, RecognizedItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// サーバーがエラーコードを付けなかった場合のコード
pub const DEFAULT_ERROR_CODE: &str = "OCR_ERROR";

/// レート制限を示す文言（小文字で比較）
pub const RATE_LIMIT_INDICATORS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "429",
    "요청 한도",
    "한도 초과",
];

/// 送信メッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    RequestOcr { image_url: String },
}

impl ClientMessage {
    pub fn request_ocr(image_url: impl Into<String>) -> Self {
        ClientMessage::RequestOcr {
            image_url: image_url.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// サーバーエラー
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    /// レート制限によるエラーか
    pub fn is_rate_limited(&self) -> bool {
        is_rate_limit_message(&self.code) || is_rate_limit_message(&self.message)
    }
}

/// 受信メッセージ
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Progress(RecognitionProgress),
    Result(RecognitionResult),
    Error(ServerError),
    /// 認識と無関係なメッセージ（接続確認など）
    Other(String),
}

impl ServerMessage {
    /// 結果またはエラー（リクエストを終わらせるメッセージ）か
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::Result(_) | ServerMessage::Error(_))
    }
}

/// 文言にレート制限の指標が含まれるか
pub fn is_rate_limit_message(text: &str) -> bool {
    let lowered = text.to_lowercase();
    RATE_LIMIT_INDICATORS
        .iter()
        .any(|indicator| lowered.contains(indicator))
}

/// 受信テキストをパース
///
/// # Returns
/// * `Ok(ServerMessage)` - パース成功（未知の`type`は`Other`）
/// * `Err` - JSONでない、または`type`がない
pub fn parse_server_message(text: &str) -> Result<ServerMessage> {
    let value: Value = serde_json::from_str(text.trim())?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Parse("typeフィールドがありません".into()))?
        .to_string();

    let body = payload(&value);

    match kind.as_str() {
        "progress" => {
            let progress: RecognitionProgress = serde_json::from_value(body)
                .map_err(|e| Error::Parse(format!("progressのパースエラー: {}", e)))?;
            Ok(ServerMessage::Progress(progress))
        }
        "result" => Ok(ServerMessage::Result(parse_result_body(body)?)),
        "error" => Ok(ServerMessage::Error(parse_error_body(&body))),
        _ => Ok(ServerMessage::Other(kind)),
    }
}

/// `data`オブジェクトがあればそれを、なければ全体を本文とする
fn payload(value: &Value) -> Value {
    match value.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => value.clone(),
    }
}

/// `ingredients`があれば構造化結果として読む。形が合わなければエラー
/// （非構造化の空結果として黙って通さない）
fn parse_result_body(mut body: Value) -> Result<RecognitionResult> {
    let parse_error = |e: serde_json::Error| Error::Parse(format!("resultのパースエラー: {}", e));

    match body.get_mut("ingredients").map(Value::take) {
        Some(Value::Null) | None => serde_json::from_value(body).map_err(parse_error),
        Some(ingredients) => {
            let ingredients: Vec<RecognizedItem> =
                serde_json::from_value(ingredients).map_err(parse_error)?;
            Ok(RecognitionResult::Structured { ingredients })
        }
    }
}

fn parse_error_body(body: &Value) -> ServerError {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("error").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let code = body
        .get("code")
        .and_then(|c| match c {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string());
    ServerError { code, message }
}
