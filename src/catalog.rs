//! 食材カタログのスナップショット管理
//!
//! 照合は `Arc<IngredientCatalog>` を複製して読むだけ。更新は丸ごと差し替える。

use crate::error::ServiceError;
use crate::services::CatalogService;
use chrono::Utc;
use receipt_ingest_common::IngredientCatalog;
use std::sync::{Arc, RwLock};

pub struct CatalogStore {
    service: Arc<dyn CatalogService>,
    current: RwLock<Arc<IngredientCatalog>>,
}

impl CatalogStore {
    pub fn new(service: Arc<dyn CatalogService>) -> Self {
        Self {
            service,
            current: RwLock::new(Arc::new(IngredientCatalog::default())),
        }
    }

    /// 現在のスナップショット（未取得なら空）
    pub fn snapshot(&self) -> Arc<IngredientCatalog> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().fetched_at().is_some()
    }

    /// `GET /ingredients` で取り直す。失敗時は以前のスナップショットを残す
    pub async fn refresh(&self) -> Result<Arc<IngredientCatalog>, ServiceError> {
        let ingredients = self.service.fetch_ingredients().await?;
        let catalog = Arc::new(IngredientCatalog::fetched(ingredients, Utc::now()));
        tracing::info!(count = catalog.len(), "食材カタログを更新");

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = catalog.clone();
        Ok(catalog)
    }

    /// 未取得なら取得してから返す
    pub async fn ensure_loaded(&self) -> Result<Arc<IngredientCatalog>, ServiceError> {
        if self.is_loaded() {
            return Ok(self.snapshot());
        }
        self.refresh().await
    }
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore")
            .field("len", &self.snapshot().len())
            .finish()
    }
}
