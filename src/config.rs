use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 認証トークンの環境変数名
pub const TOKEN_ENV: &str = "RECEIPT_INGEST_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_token: Option<String>,
    pub api_base_url: String,
    pub socket_url: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub recognition_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub max_image_size: u32,
    pub jpeg_quality: u8,
    pub shelf_life_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_token: None,
            api_base_url: "http://localhost:8080".into(),
            socket_url: "ws://localhost:8080/ws".into(),
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 5,
            recognition_timeout_seconds: 120,
            request_timeout_seconds: 30,
            max_image_size: 1920, // レシートの小さい文字が潰れない程度
            jpeg_quality: 85,
            shelf_life_days: receipt_ingest_common::DEFAULT_SHELF_LIFE_DAYS,
        }
    }
}

/// 常時接続の設定
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub url: String,
    pub token: Option<String>,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

/// アップロードの設定
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    pub max_image_size: u32,
    pub jpeg_quality: u8,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// 指定パスから読み込む（ファイルがなければデフォルト）
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| IngestError::Config("ホームディレクトリが見つかりません".into()))?;
        Ok(home.join(".config").join("receipt-ingest").join("config.json"))
    }

    fn validate(&self) -> Result<()> {
        if self.max_reconnect_attempts == 0 {
            return Err(IngestError::Config(
                "max_reconnect_attempts は1以上にしてください".into(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(IngestError::Config(format!(
                "jpeg_quality は1〜100で指定してください: {}",
                self.jpeg_quality
            )));
        }
        if self.max_image_size == 0 {
            return Err(IngestError::Config("max_image_size が0です".into()));
        }
        Ok(())
    }

    /// 認証トークン（環境変数を優先）
    pub fn token(&self) -> Option<String> {
        resolve_token(std::env::var(TOKEN_ENV).ok(), self.api_token.as_deref())
    }

    pub fn set_token(&mut self, token: String) -> Result<()> {
        self.api_token = Some(token);
        self.save()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.socket_url.clone(),
            token: self.token(),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            max_image_size: self.max_image_size,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn resolve_token(env_value: Option<String>, file_value: Option<&str>) -> Option<String> {
    env_value
        .filter(|t| !t.trim().is_empty())
        .or_else(|| file_value.map(str::to_string))
}
