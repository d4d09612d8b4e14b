//! receipt-ingest
//!
//! レシート写真から在庫・購入履歴を作る取り込みパイプライン。
//!
//! 流れ:
//! 1. `upload` - 署名付きURLへ画像をアップロード
//! 2. `recognition` - 常時接続（`session`）上で認識ジョブを実行
//! 3. `receipt_ingest_common::matcher` - 認識結果を食材カタログと照合
//! 4. `reconcile` - 確定した明細を買い物かご・購入履歴・在庫へ反映
//!
//! `pipeline::ReceiptIngestor` がこれらを1ユーザーセッション分まとめる。

pub mod catalog;
pub mod config;
pub mod error;
mod guard;
pub mod http;
pub mod pipeline;
pub mod recognition;
pub mod reconcile;
pub mod services;
pub mod session;
pub mod upload;

pub use receipt_ingest_common as common;
