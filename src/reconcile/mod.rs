//! 確定明細の反映（サーガ）
//!
//! 手順:
//! 1. `ResolveIds` - 明細ごとに食材IDを確定（既存ID → カタログ完全一致 → 0）
//! 2. `DeleteDuplicates` - 既にかごにあるIDを1件ずつ削除
//! 3. `WritePurchases` - 購入履歴を1回でまとめて記録
//! 4. `WriteInventory` - 在庫を1回でまとめて追加（賞味期限は購入日 + 7日）
//! 5. `ConfirmCart` - かごを取り直して削除の反映を確認
//!
//! サービスをまたいだ原子性はない。失敗した手順で止まり、それより前の
//! 手順は取り消さずに `PartialFailure` で報告する。`resume` は未完了の手順だけを
//! やり直す。同じ明細で `reconcile` を2回呼ぶと購入履歴・在庫は重複する。

use crate::error::{PartialFailure, ReconcileError, ServiceError};
use crate::guard::InFlightGuard;
use crate::services::{CartService, InventoryService, PurchaseService};
use chrono::{DateTime, Utc};
use receipt_ingest_common::{
    CartEntry, IngredientCatalog, IngredientId, InventoryEntry, ParsedLineItem, PurchaseRecord,
    DEFAULT_SHELF_LIFE_DAYS, FREE_TEXT_ID,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 確定処理の手順
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileStep {
    ResolveIds,
    DeleteDuplicates,
    WritePurchases,
    WriteInventory,
    ConfirmCart,
}

impl ReconcileStep {
    pub const ALL: [ReconcileStep; 5] = [
        ReconcileStep::ResolveIds,
        ReconcileStep::DeleteDuplicates,
        ReconcileStep::WritePurchases,
        ReconcileStep::WriteInventory,
        ReconcileStep::ConfirmCart,
    ];

    fn index(self) -> usize {
        match self {
            ReconcileStep::ResolveIds => 0,
            ReconcileStep::DeleteDuplicates => 1,
            ReconcileStep::WritePurchases => 2,
            ReconcileStep::WriteInventory => 3,
            ReconcileStep::ConfirmCart => 4,
        }
    }
}

impl std::fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ReconcileStep::ResolveIds => "食材IDの確定",
            ReconcileStep::DeleteDuplicates => "かごの重複削除",
            ReconcileStep::WritePurchases => "購入履歴の記録",
            ReconcileStep::WriteInventory => "在庫の追加",
            ReconcileStep::ConfirmCart => "かごの確認",
        };
        write!(f, "{}", label)
    }
}

/// 手順ごとの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    /// 対象がなく何もしなかった
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_done(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// ID確定済みの明細
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedItem {
    pub ingredient_id: IngredientId,
    pub item: ParsedLineItem,
}

/// 確定処理の記録
///
/// 失敗時はこれを `PartialFailure` に入れて返し、`resume` で続きから実行する。
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    steps: [StepStatus; 5],
    purchase_date: Option<DateTime<Utc>>,
    shelf_life_days: i64,
    items: Vec<ResolvedItem>,
    duplicate_ids: Vec<IngredientId>,
    deleted_ids: Vec<IngredientId>,
    batch_fingerprint: String,
}

impl ReconcileReport {
    pub fn status(&self, step: ReconcileStep) -> StepStatus {
        self.steps[step.index()]
    }

    fn set(&mut self, step: ReconcileStep, status: StepStatus) {
        self.steps[step.index()] = status;
    }

    pub fn completed_steps(&self) -> Vec<ReconcileStep> {
        ReconcileStep::ALL
            .into_iter()
            .filter(|step| self.status(*step).is_done())
            .collect()
    }

    /// 完了済み手順の表示用ラベル（なければ「なし」）
    pub fn completed_steps_label(&self) -> String {
        let completed = self.completed_steps();
        if completed.is_empty() {
            return "なし".to_string();
        }
        completed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("、")
    }

    pub fn failed_step(&self) -> Option<ReconcileStep> {
        ReconcileStep::ALL
            .into_iter()
            .find(|step| self.status(*step) == StepStatus::Failed)
    }

    pub fn purchase_date(&self) -> Option<DateTime<Utc>> {
        self.purchase_date
    }

    pub fn items(&self) -> &[ResolvedItem] {
        &self.items
    }

    /// かごから削除すべきID
    pub fn duplicate_ids(&self) -> &[IngredientId] {
        &self.duplicate_ids
    }

    /// 削除済みのID
    pub fn deleted_ids(&self) -> &[IngredientId] {
        &self.deleted_ids
    }

    pub fn batch_fingerprint(&self) -> &str {
        &self.batch_fingerprint
    }

    fn purchase_records(&self, purchase_date: DateTime<Utc>) -> Vec<PurchaseRecord> {
        self.items
            .iter()
            .map(|resolved| PurchaseRecord {
                ingredient_id: resolved.ingredient_id,
                name: resolved.item.name.clone(),
                quantity: resolved.item.quantity,
                price: resolved.item.price,
                purchase_date,
            })
            .collect()
    }

    fn inventory_entries(&self, purchase_date: DateTime<Utc>) -> Vec<InventoryEntry> {
        self.items
            .iter()
            .map(|resolved| {
                InventoryEntry::with_shelf_life(
                    resolved.ingredient_id,
                    &resolved.item,
                    purchase_date,
                    self.shelf_life_days,
                )
            })
            .collect()
    }
}

/// 成功時の結果
#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub purchase_date: DateTime<Utc>,
    pub purchases: Vec<PurchaseRecord>,
    pub inventory: Vec<InventoryEntry>,
    pub deleted_cart_ids: Vec<IngredientId>,
    pub batch_fingerprint: String,
    pub report: ReconcileReport,
}

pub struct ReconciliationTransaction {
    cart: Arc<dyn CartService>,
    purchases: Arc<dyn PurchaseService>,
    inventory: Arc<dyn InventoryService>,
    shelf_life_days: i64,
    in_flight: Arc<AtomicBool>,
}

impl ReconciliationTransaction {
    pub fn new(
        cart: Arc<dyn CartService>,
        purchases: Arc<dyn PurchaseService>,
        inventory: Arc<dyn InventoryService>,
    ) -> Self {
        Self {
            cart,
            purchases,
            inventory,
            shelf_life_days: DEFAULT_SHELF_LIFE_DAYS,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_shelf_life_days(mut self, days: i64) -> Self {
        self.shelf_life_days = days;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 確定明細を反映する
    pub async fn reconcile(
        &self,
        confirmed: &[ParsedLineItem],
        existing_cart: &[CartEntry],
        catalog: &IngredientCatalog,
    ) -> Result<ReconcileSummary, ReconcileError> {
        if confirmed.is_empty() {
            return Err(ReconcileError::NoItems);
        }
        let _guard = InFlightGuard::try_acquire(&self.in_flight).ok_or(ReconcileError::InFlight)?;

        let mut report = plan(confirmed, existing_cart, catalog, Utc::now(), self.shelf_life_days);
        tracing::info!(
            items = report.items.len(),
            duplicates = report.duplicate_ids.len(),
            fingerprint = %report.batch_fingerprint,
            "確定処理を開始"
        );
        report.set(ReconcileStep::ResolveIds, StepStatus::Completed);

        self.execute(report).await
    }

    /// 途中失敗した確定処理を未完了の手順から再開する
    ///
    /// 購入日は最初の実行のものを使う。
    pub async fn resume(&self, failure: PartialFailure) -> Result<ReconcileSummary, ReconcileError> {
        let _guard = InFlightGuard::try_acquire(&self.in_flight).ok_or(ReconcileError::InFlight)?;

        let mut report = failure.report;
        if report.items.is_empty() {
            return Err(ReconcileError::NoItems);
        }
        if report.status(ReconcileStep::ResolveIds) != StepStatus::Completed {
            report.set(ReconcileStep::ResolveIds, StepStatus::Completed);
        }
        tracing::info!(
            failed_step = %failure.failed_step,
            completed = %report.completed_steps_label(),
            "確定処理を再開"
        );

        self.execute(report).await
    }

    async fn execute(&self, mut report: ReconcileReport) -> Result<ReconcileSummary, ReconcileError> {
        let purchase_date = *report.purchase_date.get_or_insert_with(Utc::now);

        for step in ReconcileStep::ALL {
            if report.status(step).is_done() {
                continue;
            }
            match self.run_step(step, &mut report, purchase_date).await {
                Ok(status) => {
                    tracing::info!(step = %step, status = ?status, "手順が完了");
                    report.set(step, status);
                }
                Err(source) => {
                    tracing::error!(step = %step, error = %source, "手順が失敗");
                    report.set(step, StepStatus::Failed);
                    return Err(PartialFailure {
                        failed_step: step,
                        report,
                        source,
                    }
                    .into());
                }
            }
        }

        Ok(ReconcileSummary {
            purchase_date,
            purchases: report.purchase_records(purchase_date),
            inventory: report.inventory_entries(purchase_date),
            deleted_cart_ids: report.deleted_ids.clone(),
            batch_fingerprint: report.batch_fingerprint.clone(),
            report,
        })
    }

    async fn run_step(
        &self,
        step: ReconcileStep,
        report: &mut ReconcileReport,
        purchase_date: DateTime<Utc>,
    ) -> Result<StepStatus, ServiceError> {
        match step {
            ReconcileStep::ResolveIds => Ok(StepStatus::Completed),
            ReconcileStep::DeleteDuplicates => {
                if report.duplicate_ids.is_empty() {
                    return Ok(StepStatus::Skipped);
                }
                let pending: Vec<IngredientId> = report
                    .duplicate_ids
                    .iter()
                    .copied()
                    .filter(|id| !report.deleted_ids.contains(id))
                    .collect();
                for id in pending {
                    self.cart.remove_from_cart(id).await?;
                    tracing::debug!(ingredient_id = id, "かごから削除");
                    report.deleted_ids.push(id);
                }
                Ok(StepStatus::Completed)
            }
            ReconcileStep::WritePurchases => {
                let records = report.purchase_records(purchase_date);
                self.purchases.record_purchases(&records).await?;
                Ok(StepStatus::Completed)
            }
            ReconcileStep::WriteInventory => {
                let entries = report.inventory_entries(purchase_date);
                self.inventory.add_inventory(&entries).await?;
                Ok(StepStatus::Completed)
            }
            ReconcileStep::ConfirmCart => {
                if report.deleted_ids.is_empty() {
                    return Ok(StepStatus::Skipped);
                }
                let cart = self.cart.list_cart().await?;
                let remaining: Vec<IngredientId> = cart
                    .iter()
                    .map(|entry| entry.ingredient_id)
                    .filter(|id| report.deleted_ids.contains(id))
                    .collect();
                if !remaining.is_empty() {
                    return Err(ServiceError::Unconfirmed(format!(
                        "削除した食材がかごに残っています: {:?}",
                        remaining
                    )));
                }
                Ok(StepStatus::Completed)
            }
        }
    }
}

impl std::fmt::Debug for ReconciliationTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationTransaction")
            .field("shelf_life_days", &self.shelf_life_days)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

/// 明細ごとの食材ID（既存ID → カタログ完全一致 → 0）
pub fn resolve_ingredient_id(item: &ParsedLineItem, catalog: &IngredientCatalog) -> IngredientId {
    item.ingredient_id
        .or_else(|| catalog.resolve_id(&item.name))
        .unwrap_or(FREE_TEXT_ID)
}

/// 明細列の指紋（下流での重複排除用。ここでは検査しない）
pub fn batch_fingerprint(items: &[ResolvedItem]) -> String {
    let mut hasher = Sha256::new();
    for resolved in items {
        let line = format!(
            "{}\t{}\t{}\t{}\t{}\n",
            resolved.ingredient_id,
            resolved.item.name,
            resolved.item.quantity,
            resolved.item.unit,
            resolved.item.price
        );
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// 手順1・2（IDの確定とかごとの突き合わせ）
fn plan(
    confirmed: &[ParsedLineItem],
    existing_cart: &[CartEntry],
    catalog: &IngredientCatalog,
    purchase_date: DateTime<Utc>,
    shelf_life_days: i64,
) -> ReconcileReport {
    let items: Vec<ResolvedItem> = confirmed
        .iter()
        .map(|item| ResolvedItem {
            ingredient_id: resolve_ingredient_id(item, catalog),
            item: item.clone(),
        })
        .collect();

    let in_cart: HashSet<IngredientId> = existing_cart.iter().map(|e| e.ingredient_id).collect();
    let mut seen = HashSet::new();
    let duplicate_ids = items
        .iter()
        .map(|resolved| resolved.ingredient_id)
        .filter(|id| *id != FREE_TEXT_ID && in_cart.contains(id) && seen.insert(*id))
        .collect();

    ReconcileReport {
        steps: Default::default(),
        purchase_date: Some(purchase_date),
        shelf_life_days,
        batch_fingerprint: batch_fingerprint(&items),
        items,
        duplicate_ids,
        deleted_ids: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use receipt_ingest_common::Ingredient;

    fn catalog() -> IngredientCatalog {
        IngredientCatalog::new(vec![
            Ingredient::new(7, "계란", "개"),
            Ingredient::new(12, "우유", "ml"),
        ])
    }

    fn cart_entry(id: IngredientId) -> CartEntry {
        CartEntry {
            ingredient_id: id,
            name: String::new(),
            quantity: 1.0,
            unit: String::new(),
            purchased: false,
        }
    }

    #[test]
    fn test_resolve_ingredient_id_order() {
        let catalog = catalog();

        let mut matched = ParsedLineItem::free_text("아무거나", "");
        matched.ingredient_id = Some(3);
        assert_eq!(resolve_ingredient_id(&matched, &catalog), 3);

        let by_name = ParsedLineItem::free_text("우유", "ml");
        assert_eq!(resolve_ingredient_id(&by_name, &catalog), 12);

        let unknown = ParsedLineItem::free_text("과자", "봉");
        assert_eq!(resolve_ingredient_id(&unknown, &catalog), FREE_TEXT_ID);
    }

    #[test]
    fn test_plan_partitions_against_cart() {
        let items = vec![
            ParsedLineItem::free_text("계란", "개"),
            ParsedLineItem::free_text("계란", "개"),
            ParsedLineItem::free_text("우유", "ml"),
            ParsedLineItem::free_text("과자", "봉"),
        ];
        let cart = vec![cart_entry(7), cart_entry(0), cart_entry(99)];
        let report = plan(&items, &cart, &catalog(), Utc::now(), 7);

        // 同じIDの削除は1回だけ。自由記述(0)は対象外
        assert_eq!(report.duplicate_ids(), &[7]);
        assert_eq!(report.items().len(), 4);
    }

    #[test]
    fn test_batch_fingerprint_stable() {
        let items = vec![ParsedLineItem::free_text("계란", "개")];
        let a = plan(&items, &[], &catalog(), Utc::now(), 7);
        let b = plan(&items, &[], &catalog(), Utc::now(), 7);
        assert_eq!(a.batch_fingerprint(), b.batch_fingerprint());
        assert_eq!(a.batch_fingerprint().len(), 64);

        let other = vec![ParsedLineItem::free_text("우유", "ml")];
        let c = plan(&other, &[], &catalog(), Utc::now(), 7);
        assert_ne!(a.batch_fingerprint(), c.batch_fingerprint());
    }

    #[test]
    fn test_completed_steps_label() {
        let mut report = ReconcileReport::default();
        assert_eq!(report.completed_steps_label(), "なし");

        report.set(ReconcileStep::ResolveIds, StepStatus::Completed);
        report.set(ReconcileStep::DeleteDuplicates, StepStatus::Skipped);
        report.set(ReconcileStep::WritePurchases, StepStatus::Failed);
        assert_eq!(report.completed_steps_label(), "食材IDの確定、かごの重複削除");
        assert_eq!(report.failed_step(), Some(ReconcileStep::WritePurchases));
    }
}
