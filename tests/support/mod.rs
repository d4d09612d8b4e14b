//! テスト用の偽トランスポート・偽サービス

#![allow(dead_code)]

use async_trait::async_trait;
use receipt_ingest::config::SessionConfig;
use receipt_ingest::error::{ConnectionError, ServiceError};
use receipt_ingest::services::{CartService, CatalogService, InventoryService, PurchaseService};
use receipt_ingest::session::{Connector, SessionEvent, Transport, TransportEvent};
use receipt_ingest_common::{
    CartEntry, ConnectionState, Ingredient, IngredientId, InventoryEntry, PurchaseRecord,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

// =============================================
// 偽トランスポート
// =============================================

/// サーバー側の操作ハンドル。ドロップすると接続が切れる
pub struct ServerHandle {
    to_client: mpsc::UnboundedSender<TransportEvent>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerHandle {
    pub fn push(&self, text: &str) {
        let _ = self.to_client.send(TransportEvent::Text(text.to_string()));
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self.to_client.send(TransportEvent::Closed {
            reason: reason.map(str::to_string),
        });
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| ConnectionError::Send("closed".into()))?;
        outbound
            .send(text)
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { reason: None })
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

pub fn fake_transport() -> (Box<dyn Transport>, ServerHandle) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        Box::new(FakeTransport {
            inbound,
            outbound: Some(outbound),
        }),
        ServerHandle {
            to_client,
            from_client,
        },
    )
}

/// 台本どおりに接続の成否を返す。台本が尽きたら失敗
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Result<Box<dyn Transport>, ConnectionError>>>,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self) -> ServerHandle {
        let (transport, handle) = fake_transport();
        self.script.lock().unwrap().push_back(Ok(transport));
        handle
    }

    pub fn push_err(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(ConnectionError::Connect(message.to_string())));
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ConnectionError::Connect("connection refused".into())))
    }
}

pub fn session_config(max_reconnect_attempts: u32) -> SessionConfig {
    SessionConfig {
        url: "ws://fake.invalid/ws".into(),
        token: None,
        reconnect_interval: Duration::from_secs(1),
        max_reconnect_attempts,
    }
}

/// 指定状態への遷移イベントまでを集める
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<SessionEvent>,
    target: ConnectionState,
) -> Vec<SessionEvent> {
    let collect = async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event channel closed");
            let reached = event == SessionEvent::StateChanged(target);
            seen.push(event);
            if reached {
                return seen;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), collect)
        .await
        .expect("state not reached")
}

/// 受信済みのイベントを全部取り出す
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

// =============================================
// 偽サービス
// =============================================

/// 呼び出しを記録する下流サービス
#[derive(Default)]
pub struct FakeServices {
    pub calls: Mutex<Vec<String>>,
    pub cart: Mutex<Vec<CartEntry>>,
    pub purchases: Mutex<Vec<PurchaseRecord>>,
    pub inventory: Mutex<Vec<InventoryEntry>>,
    pub ingredients: Vec<Ingredient>,
    /// 次の1回だけ失敗させる呼び出し名（"delete:7" / "purchases" など）
    failures: Mutex<Vec<String>>,
    /// trueなら削除しても消えない
    pub ignore_deletes: bool,
}

impl FakeServices {
    pub fn with_cart(ids: &[IngredientId]) -> Self {
        Self {
            cart: Mutex::new(ids.iter().map(|id| cart_entry(*id)).collect()),
            ..Default::default()
        }
    }

    pub fn with_ingredients(ingredients: Vec<Ingredient>) -> Self {
        Self {
            ingredients,
            ..Default::default()
        }
    }

    pub fn with_cart_entries(self, ids: &[IngredientId]) -> Self {
        *self.cart.lock().unwrap() = ids.iter().map(|id| cart_entry(*id)).collect();
        self
    }

    pub fn ignoring_deletes(mut self) -> Self {
        self.ignore_deletes = true;
        self
    }

    pub fn fail_once(&self, call: &str) {
        self.failures.lock().unwrap().push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: String) -> Result<(), ServiceError> {
        self.calls.lock().unwrap().push(call.clone());
        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures.iter().position(|f| *f == call) {
            failures.remove(pos);
            return Err(ServiceError::Status {
                status: 500,
                body: format!("{} failed", call),
            });
        }
        Ok(())
    }
}

pub fn cart_entry(id: IngredientId) -> CartEntry {
    CartEntry {
        ingredient_id: id,
        name: format!("item-{}", id),
        quantity: 1.0,
        unit: String::new(),
        purchased: false,
    }
}

#[async_trait]
impl CartService for FakeServices {
    async fn list_cart(&self) -> Result<Vec<CartEntry>, ServiceError> {
        self.record("list_cart".into())?;
        Ok(self.cart.lock().unwrap().clone())
    }

    async fn remove_from_cart(&self, ingredient_id: IngredientId) -> Result<(), ServiceError> {
        self.record(format!("delete:{}", ingredient_id))?;
        if !self.ignore_deletes {
            self.cart
                .lock()
                .unwrap()
                .retain(|entry| entry.ingredient_id != ingredient_id);
        }
        Ok(())
    }
}

#[async_trait]
impl PurchaseService for FakeServices {
    async fn record_purchases(&self, records: &[PurchaseRecord]) -> Result<(), ServiceError> {
        self.record("purchases".into())?;
        self.purchases.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}

#[async_trait]
impl InventoryService for FakeServices {
    async fn add_inventory(&self, entries: &[InventoryEntry]) -> Result<(), ServiceError> {
        self.record("inventory".into())?;
        self.inventory.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }
}

#[async_trait]
impl CatalogService for FakeServices {
    async fn fetch_ingredients(&self) -> Result<Vec<Ingredient>, ServiceError> {
        self.record("ingredients".into())?;
        Ok(self.ingredients.clone())
    }
}

/// 購入履歴の記録で止まるサービス
///
/// `entered`で記録に入ったことを知らせ、`release`が来るまで待つ
pub struct GatedPurchases {
    pub inner: Arc<FakeServices>,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedPurchases {
    pub fn new(inner: Arc<FakeServices>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl PurchaseService for GatedPurchases {
    async fn record_purchases(&self, records: &[PurchaseRecord]) -> Result<(), ServiceError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.record_purchases(records).await
    }
}
