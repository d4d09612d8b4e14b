//! 1ユーザーセッション分の取り込みパイプライン
//!
//! `scan_receipt`: 接続 → アップロード → 認識 → 照合
//! `confirm`: かご取得 → 確定処理
//!
//! 操作は非同期Mutexで直列化する（アップロード完了前に認識を頼まない）。
//! 確定処理だけは待たせず、二重送信を`ReconcileError::InFlight`で弾く。

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::error::{PartialFailure, ReconcileError, Result};
use crate::guard::InFlightGuard;
use crate::http::ApiClient;
use crate::recognition::RecognitionProtocol;
use crate::reconcile::{ReconcileSummary, ReconciliationTransaction};
use crate::services::{CartService, CatalogService, HttpServices, InventoryService, PurchaseService};
use crate::session::SessionConnection;
use crate::upload::UploadCoordinator;
use receipt_ingest_common::{
    match_ingredients, Ingredient, IngredientCatalog, ParsedLineItem, RecognitionProgress,
    RecognitionResult, UploadProgress,
};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex;

/// アップロード時の用途（保存先のプレフィックス）
pub const RECEIPT_PURPOSE: &str = "receipts";

/// 下流サービス一式
#[derive(Clone)]
pub struct Services {
    pub cart: Arc<dyn CartService>,
    pub purchases: Arc<dyn PurchaseService>,
    pub inventory: Arc<dyn InventoryService>,
    pub catalog: Arc<dyn CatalogService>,
}

impl Services {
    pub fn http(services: HttpServices) -> Self {
        let shared = Arc::new(services);
        Self {
            cart: shared.clone(),
            purchases: shared.clone(),
            inventory: shared.clone(),
            catalog: shared,
        }
    }
}

/// 読み取り結果（ユーザー確認前）
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub image_url: String,
    pub result: RecognitionResult,
    pub items: Vec<ParsedLineItem>,
}

pub struct ReceiptIngestor {
    session: SessionConnection,
    recognition: RecognitionProtocol,
    uploader: UploadCoordinator,
    catalog: CatalogStore,
    cart: Arc<dyn CartService>,
    reconciler: ReconciliationTransaction,
    lock: Mutex<()>,
    confirming: Arc<AtomicBool>,
}

impl ReceiptIngestor {
    pub fn new(
        session: SessionConnection,
        uploader: UploadCoordinator,
        services: Services,
        config: &Config,
    ) -> Self {
        let recognition = RecognitionProtocol::new(session.clone(), config.recognition_timeout());
        let reconciler = ReconciliationTransaction::new(
            services.cart.clone(),
            services.purchases,
            services.inventory,
        )
        .with_shelf_life_days(config.shelf_life_days);

        Self {
            session,
            recognition,
            uploader,
            catalog: CatalogStore::new(services.catalog),
            cart: services.cart,
            reconciler,
            lock: Mutex::new(()),
            confirming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 設定からWebSocket・REST APIの本番構成を組み立てる
    pub fn from_config(config: &Config) -> Result<Self> {
        let api = ApiClient::new(
            config.api_base_url.clone(),
            config.token(),
            config.request_timeout(),
        )?;
        let session = SessionConnection::websocket(&config.session_config());
        let uploader = UploadCoordinator::new(api.clone(), config.upload_config());
        let services = Services::http(HttpServices::new(api));
        Ok(Self::new(session, uploader, services, config))
    }

    pub fn session(&self) -> &SessionConnection {
        &self.session
    }

    pub fn uploader(&self) -> &UploadCoordinator {
        &self.uploader
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    /// レシート画像を読み取り、照合済みの明細候補を返す
    pub async fn scan_receipt<U, R>(
        &self,
        image: &Path,
        on_upload: U,
        on_recognition: R,
    ) -> Result<ScanOutcome>
    where
        U: Fn(UploadProgress) + Send + Sync + 'static,
        R: FnMut(&RecognitionProgress) + Send,
    {
        let _lock = self.lock.lock().await;

        if !self.session.is_connected() {
            self.session.connect().await?;
        }
        let catalog = self.catalog.ensure_loaded().await?;

        let image_url = self.uploader.upload(image, RECEIPT_PURPOSE, on_upload).await?;
        let request = self.recognition.request_recognition(&image_url)?;
        let result = request.wait(on_recognition).await?;

        let items = match_ingredients(&result, &catalog);
        tracing::info!(
            image_url = %image_url,
            items = items.len(),
            free_text = items.iter().filter(|i| i.is_free_text()).count(),
            "レシートを読み取りました"
        );

        Ok(ScanOutcome {
            image_url,
            result,
            items,
        })
    }

    /// 確認済みの明細を反映する
    ///
    /// 確定処理（再開を含む）が進行中なら待たずに`ReconcileError::InFlight`
    pub async fn confirm(&self, items: &[ParsedLineItem]) -> Result<ReconcileSummary> {
        let _confirming = self.begin_confirm()?;
        let _lock = self.lock.lock().await;

        let catalog = self.catalog.ensure_loaded().await?;
        let cart = self.cart.list_cart().await?;
        Ok(self.reconciler.reconcile(items, &cart, &catalog).await?)
    }

    /// 途中失敗した確定処理の続き
    pub async fn resume(&self, failure: PartialFailure) -> Result<ReconcileSummary> {
        let _confirming = self.begin_confirm()?;
        let _lock = self.lock.lock().await;
        Ok(self.reconciler.resume(failure).await?)
    }

    fn begin_confirm(&self) -> std::result::Result<InFlightGuard, ReconcileError> {
        InFlightGuard::try_acquire(&self.confirming).ok_or_else(|| {
            tracing::warn!("確定処理が進行中のため二重送信を拒否");
            ReconcileError::InFlight
        })
    }

    /// 手入力・再照合用の候補
    pub fn search_catalog(&self, query: &str, limit: usize) -> Vec<Ingredient> {
        self.catalog
            .snapshot()
            .search(query, limit)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn refresh_catalog(&self) -> Result<Arc<IngredientCatalog>> {
        Ok(self.catalog.refresh().await?)
    }

    pub fn disconnect(&self) {
        self.uploader.cancel();
        self.session.disconnect();
    }
}
