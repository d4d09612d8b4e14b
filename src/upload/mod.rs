//! 署名付きURLによる画像アップロード
//!
//! 1. `POST /s3/presigned-url` で書き込みURLと公開URLを取得
//! 2. 書き込みURLへJPEGをPUT（送出したバイト数で進捗を通知）
//! 3. `POST /s3/upload-complete`（失敗しても無視）
//!
//! 進捗は成功確認まで99%で止め、成功時だけ100%にする。
//! 失敗は進捗ではなく `UploadStatus::Failed` で表す。

pub mod asset;

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::http::ApiClient;
use chrono::Utc;
use futures_util::stream;
use receipt_ingest_common::UploadProgress;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use asset::PreparedAsset;

/// 転送の分割サイズ（進捗通知の粒度）
const CHUNK_SIZE: usize = 64 * 1024;

/// アップロードの状態
#[derive(Debug, Clone, PartialEq)]
pub enum UploadStatus {
    NotStarted,
    InProgress(UploadProgress),
    Failed(String),
    Succeeded { file_url: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignRequest<'a> {
    file_name: &'a str,
    content_type: &'a str,
    file_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrl {
    pub upload_url: String,
    pub file_url: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadComplete<'a> {
    file_name: &'a str,
}

pub struct UploadCoordinator {
    api: ApiClient,
    config: UploadConfig,
    status: Arc<watch::Sender<UploadStatus>>,
    cancel: Mutex<CancellationToken>,
}

impl UploadCoordinator {
    pub fn new(api: ApiClient, config: UploadConfig) -> Self {
        let (status, _) = watch::channel(UploadStatus::NotStarted);
        Self {
            api,
            config,
            status: Arc::new(status),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn status(&self) -> watch::Receiver<UploadStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> UploadStatus {
        self.status.borrow().clone()
    }

    /// 実行中のアップロードの取り消しトークン
    ///
    /// 取り消しは開始済みのアップロードにだけ効く。取り消し済みのトークンは
    /// 次の`upload`開始時に新しいものへ差し替わる
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cancel(&self) {
        self.cancel_token().cancel();
    }

    /// アップロードして公開URLを返す
    pub async fn upload<F>(
        &self,
        local_asset: &Path,
        purpose: &str,
        on_progress: F,
    ) -> Result<String, UploadError>
    where
        F: Fn(UploadProgress) + Send + Sync + 'static,
    {
        let cancel = self.begin();
        let on_progress = Arc::new(on_progress);

        match self.run(local_asset, purpose, on_progress, &cancel).await {
            Ok(file_url) => {
                self.status.send_replace(UploadStatus::Succeeded {
                    file_url: file_url.clone(),
                });
                Ok(file_url)
            }
            Err(e) => {
                tracing::warn!(path = %local_asset.display(), error = %e, "アップロードに失敗");
                self.status.send_replace(UploadStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// 取り消し済みのトークンを新しいものに差し替える
    fn begin(&self) -> CancellationToken {
        let mut current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        current.clone()
    }

    async fn run<F>(
        &self,
        local_asset: &Path,
        purpose: &str,
        on_progress: Arc<F>,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError>
    where
        F: Fn(UploadProgress) + Send + Sync + 'static,
    {
        let path = local_asset.to_path_buf();
        let (max_size, quality) = (self.config.max_image_size, self.config.jpeg_quality);
        let prepared = tokio::task::spawn_blocking(move || asset::prepare(&path, max_size, quality))
            .await
            .map_err(|e| UploadError::InvalidAsset(e.to_string()))??;

        let total = prepared.len();
        let file_name = asset::file_name(purpose, &prepared.bytes, Utc::now());
        tracing::info!(file_name = %file_name, bytes = total, "アップロード開始");
        self.report(&on_progress, UploadProgress::transferring(0, total));

        let presigned: PresignedUrl = self
            .api
            .post_json(
                "/s3/presigned-url",
                &PresignRequest {
                    file_name: &file_name,
                    content_type: asset::CONTENT_TYPE,
                    file_type: purpose,
                    file_size: Some(total),
                },
            )
            .await
            .map_err(UploadError::Presign)?;

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let body = progress_body(prepared.bytes, on_progress.clone(), self.status.clone());
        let request = self
            .api
            .raw()
            .put(&presigned.upload_url)
            .header(CONTENT_TYPE, asset::CONTENT_TYPE)
            .header(CONTENT_LENGTH, total)
            .body(body);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = request.send() => result.map_err(|e| UploadError::Network(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Transfer {
                status: status.as_u16(),
            });
        }
        // 転送完了後の取り消しも結果を無視する
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let name = if presigned.file_name.is_empty() {
            file_name.as_str()
        } else {
            presigned.file_name.as_str()
        };
        if let Err(e) = self
            .api
            .post("/s3/upload-complete", &UploadComplete { file_name: name })
            .await
        {
            tracing::debug!(error = %e, "upload-complete の通知に失敗（無視）");
        }

        (*on_progress)(UploadProgress::completed(total));
        tracing::info!(file_url = %presigned.file_url, "アップロード完了");
        Ok(presigned.file_url)
    }

    fn report<F>(&self, on_progress: &Arc<F>, progress: UploadProgress)
    where
        F: Fn(UploadProgress),
    {
        self.status.send_replace(UploadStatus::InProgress(progress));
        (*on_progress)(progress);
    }
}

/// チャンクを送り出すたびに進捗を通知する本文
fn progress_body<F>(
    bytes: Vec<u8>,
    on_progress: Arc<F>,
    status: Arc<watch::Sender<UploadStatus>>,
) -> reqwest::Body
where
    F: Fn(UploadProgress) + Send + Sync + 'static,
{
    let total = bytes.len() as u64;
    let chunks: Vec<Vec<u8>> = bytes.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
    let mut loaded = 0u64;
    let stream = stream::iter(chunks.into_iter().map(move |chunk| {
        loaded += chunk.len() as u64;
        let progress = UploadProgress::transferring(loaded, total);
        status.send_replace(UploadStatus::InProgress(progress));
        (*on_progress)(progress);
        Ok::<_, std::io::Error>(chunk)
    }));
    reqwest::Body::wrap_stream(stream)
}
