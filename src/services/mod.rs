//! 下流サービスの境界
//!
//! 確定処理はこのトレイト越しにしか書き込まないので、テストでは
//! 手書きの実装に差し替えられる。本番は `HttpServices`。

mod http;

pub use http::HttpServices;

use crate::error::ServiceError;
use async_trait::async_trait;
use receipt_ingest_common::{CartEntry, Ingredient, IngredientId, InventoryEntry, PurchaseRecord};

/// 買い物かご
#[async_trait]
pub trait CartService: Send + Sync {
    async fn list_cart(&self) -> Result<Vec<CartEntry>, ServiceError>;

    async fn remove_from_cart(&self, ingredient_id: IngredientId) -> Result<(), ServiceError>;
}

/// 購入履歴
#[async_trait]
pub trait PurchaseService: Send + Sync {
    /// 1回の呼び出しでまとめて記録する
    async fn record_purchases(&self, records: &[PurchaseRecord]) -> Result<(), ServiceError>;
}

/// 在庫
#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn add_inventory(&self, entries: &[InventoryEntry]) -> Result<(), ServiceError>;
}

/// 食材カタログ
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn fetch_ingredients(&self) -> Result<Vec<Ingredient>, ServiceError>;
}
