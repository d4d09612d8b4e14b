use crate::reconcile::{ReconcileReport, ReconcileStep};
use receipt_ingest_common::ConnectionState;
use thiserror::Error;

/// 常時接続のエラー
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("接続先URLが不正です: {0}")]
    InvalidUrl(String),

    #[error("接続に失敗しました: {0}")]
    Connect(String),

    #[error("未接続です（状態: {0}）")]
    NotConnected(ConnectionState),

    #[error("送信に失敗しました: {0}")]
    Send(String),

    #[error("再接続の上限（{0}回）に達しました")]
    ReconnectExhausted(u32),

    #[error("リクエスト制限により接続が終了しました: {0}")]
    RateLimited(String),
}

impl ConnectionError {
    /// 利用者の再試行で回復しうるか
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::RateLimited(_))
    }
}

/// HTTPサービス呼び出しのエラー
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("通信エラー: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("レスポンスのパースに失敗: {0}")]
    Parse(String),

    #[error("反映を確認できません: {0}")]
    Unconfirmed(String),
}

impl ServiceError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ServiceError::Status { status: 429, .. })
    }
}

/// アップロードのエラー
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("ファイルが見つかりません: {0}")]
    FileNotFound(String),

    #[error("画像として読み込めません: {0}")]
    InvalidAsset(String),

    #[error("署名付きURLの取得に失敗: {0}")]
    Presign(#[source] ServiceError),

    #[error("アップロードに失敗しました（HTTP {status}）")]
    Transfer { status: u16 },

    #[error("通信エラー: {0}")]
    Network(String),

    #[error("アップロードは取り消されました")]
    Cancelled,

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
}

/// 認識リクエストのエラー
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognitionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("認識リクエストが既に進行中です")]
    AlreadyInFlight,

    #[error("接続が切れたため認識リクエストは中断されました（状態: {0}）")]
    Abandoned(ConnectionState),

    #[error("認識結果の待機がタイムアウトしました（{0}秒）")]
    TimedOut(u64),

    #[error("認識に失敗しました [{code}]: {message}")]
    Server { code: String, message: String },

    #[error("リクエスト制限中です: {0}")]
    RateLimited(String),

    #[error("メッセージの生成に失敗: {0}")]
    Encode(String),
}

/// 確定処理の途中失敗
///
/// 失敗した手順より前の手順は取り消されない。
#[derive(Error, Debug, Clone)]
#[error("{failed_step}で失敗しました（完了済み: {}）: {source}", .report.completed_steps_label())]
pub struct PartialFailure {
    pub failed_step: ReconcileStep,
    pub report: ReconcileReport,
    #[source]
    pub source: ServiceError,
}

/// 確定処理のエラー
#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    #[error("確定処理が既に実行中です")]
    InFlight,

    #[error("確定する明細がありません")]
    NoItems,

    #[error(transparent)]
    Partial(#[from] PartialFailure),
}

/// 利用者に示す失敗の種類
///
/// どの失敗もこの3つのいずれか1つに対応する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureNotice {
    /// 接続・アップロードなど。時間をおいて再試行
    RetryLater,
    /// リクエスト制限。しばらく機能を使えない
    FeatureUnavailable,
    /// 確定処理の途中失敗。在庫・購入履歴の確認が必要
    PartiallySaved,
}

impl FailureNotice {
    pub fn message(&self) -> &'static str {
        match self {
            FailureNotice::RetryLater => "しばらくしてからもう一度お試しください",
            FailureNotice::FeatureUnavailable => "現在この機能はご利用いただけません",
            FailureNotice::PartiallySaved => {
                "一部の品目が保存されませんでした。在庫と購入履歴を確認してください"
            }
        }
    }
}

impl std::fmt::Display for FailureNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("JSON解析エラー: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] receipt_ingest_common::Error),
}

impl IngestError {
    /// 利用者向けの通知種別
    pub fn notice(&self) -> FailureNotice {
        match self {
            IngestError::Connection(ConnectionError::RateLimited(_))
            | IngestError::Recognition(RecognitionError::RateLimited(_))
            | IngestError::Recognition(RecognitionError::Connection(
                ConnectionError::RateLimited(_),
            )) => FailureNotice::FeatureUnavailable,
            IngestError::Upload(UploadError::Presign(err)) | IngestError::Service(err)
                if err.is_rate_limited() =>
            {
                FailureNotice::FeatureUnavailable
            }
            IngestError::Reconcile(ReconcileError::Partial(_)) => FailureNotice::PartiallySaved,
            _ => FailureNotice::RetryLater,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
