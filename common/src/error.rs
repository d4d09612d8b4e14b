//! 認識サーバーのメッセージ解釈で起きるエラー

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// JSONとして読めない
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSONだがメッセージとして形が合わない
    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
