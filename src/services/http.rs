use super::{CartService, CatalogService, InventoryService, PurchaseService};
use crate::error::ServiceError;
use crate::http::ApiClient;
use async_trait::async_trait;
use receipt_ingest_common::{CartEntry, Ingredient, IngredientId, InventoryEntry, PurchaseRecord};

/// REST APIによる実装
#[derive(Debug, Clone)]
pub struct HttpServices {
    api: ApiClient,
}

impl HttpServices {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// かごへまとめて追加（`POST /cart/batch`）
    ///
    /// 確定処理からは呼ばれない。
    pub async fn add_to_cart(&self, entries: &[CartEntry]) -> Result<(), ServiceError> {
        if entries.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = entries.len(), "かごへ追加");
        self.api.post("/cart/batch", entries).await
    }
}

#[async_trait]
impl CartService for HttpServices {
    async fn list_cart(&self) -> Result<Vec<CartEntry>, ServiceError> {
        self.api.get_json("/cart").await
    }

    async fn remove_from_cart(&self, ingredient_id: IngredientId) -> Result<(), ServiceError> {
        self.api.delete(&format!("/cart/{}", ingredient_id)).await
    }
}

#[async_trait]
impl PurchaseService for HttpServices {
    async fn record_purchases(&self, records: &[PurchaseRecord]) -> Result<(), ServiceError> {
        self.api.post("/purchases/batch", records).await
    }
}

#[async_trait]
impl InventoryService for HttpServices {
    async fn add_inventory(&self, entries: &[InventoryEntry]) -> Result<(), ServiceError> {
        self.api.post("/inventory/batch", entries).await
    }
}

#[async_trait]
impl CatalogService for HttpServices {
    async fn fetch_ingredients(&self) -> Result<Vec<Ingredient>, ServiceError> {
        self.api.get_json("/ingredients").await
    }
}
