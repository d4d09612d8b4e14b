//! レシート取り込みの型定義
//!
//! 本体クレートと共有される型:
//! - Ingredient: 食材カタログの1行
//! - RecognitionResult: 認識ジョブの出力（構造化 / 非構造化）
//! - ParsedLineItem: 照合済みの明細候補（ユーザー確認前）
//! - CartEntry / PurchaseRecord / InventoryEntry: 下流サービスのレコード

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 食材ID
pub type IngredientId = i64;

/// カタログ未照合の明細に割り当てるID
pub const FREE_TEXT_ID: IngredientId = 0;

/// 在庫の賞味期限デフォルト（購入日からの日数）
pub const DEFAULT_SHELF_LIFE_DAYS: i64 = 7;

/// カタログの食材
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ingredient {
    pub id: IngredientId,
    pub name: String,
    #[serde(default)]
    pub unit: String,
}

impl Ingredient {
    pub fn new(id: IngredientId, name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            unit: unit.into(),
        }
    }
}

/// アップロード進捗
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    pub percentage: u8,
}

impl UploadProgress {
    /// 転送中の進捗。サーバー応答前なので99%で頭打ちにする
    pub fn transferring(loaded: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            ((loaded.min(total) * 100) / total).min(99) as u8
        };
        Self {
            loaded,
            total,
            percentage,
        }
    }

    /// 成功確認後の進捗（100%）
    pub fn completed(total: u64) -> Self {
        Self {
            loaded: total,
            total,
            percentage: 100,
        }
    }
}

/// 常時接続の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "切断"),
            ConnectionState::Connecting => write!(f, "接続中"),
            ConnectionState::Connected => write!(f, "接続済み"),
            ConnectionState::Reconnecting => write!(f, "再接続中"),
            ConnectionState::Error => write!(f, "エラー"),
        }
    }
}

/// 認識ジョブの進捗
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecognitionProgress {
    pub current_step: u32,
    pub total_steps: u32,
    pub step_description: String,
    /// 小数（33.3など）は四捨五入、0..=100に収める
    #[serde(deserialize_with = "lenient::percentage")]
    pub percentage: u8,
}

/// 構造化結果の1品目
///
/// 数値は文字列（`"3,400"`）でも、`null`でも受け付ける
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecognizedItem {
    #[serde(deserialize_with = "lenient::text")]
    pub item_name: String,
    #[serde(deserialize_with = "lenient::number")]
    pub quantity: Option<f64>,
    #[serde(deserialize_with = "lenient::text")]
    pub unit: String,
    #[serde(deserialize_with = "lenient::number")]
    pub price: Option<f64>,
}

/// 認識サーバーの値の揺れを吸収するデシリアライザ
mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    impl NumberOrText {
        fn into_number<E: serde::de::Error>(self) -> Result<Option<f64>, E> {
            match self {
                NumberOrText::Number(n) => Ok(Some(n)),
                NumberOrText::Text(text) => {
                    let cleaned: String = text
                        .chars()
                        .filter(|c| *c != ',' && !c.is_whitespace())
                        .collect();
                    if cleaned.is_empty() {
                        return Ok(None);
                    }
                    match cleaned.parse::<f64>() {
                        Ok(n) if n.is_finite() => Ok(Some(n)),
                        _ => Err(E::custom(format!("数値ではありません: {}", text))),
                    }
                }
            }
        }
    }

    pub fn number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<NumberOrText>::deserialize(deserializer)? {
            Some(value) => value.into_number(),
            None => Ok(None),
        }
    }

    pub fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
    }

    pub fn percentage<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = number(deserializer)?.unwrap_or(0.0);
        if !value.is_finite() {
            return Err(D::Error::custom(format!("不正な進捗率: {}", value)));
        }
        Ok(value.round().clamp(0.0, 100.0) as u8)
    }
}

/// 位置付きテキスト領域
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextRegion {
    pub text: String,
}

impl TextRegion {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// 認識結果
///
/// 構造化（品目リスト）か非構造化（全文 + 領域）のどちらか一方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecognitionResult {
    Structured {
        ingredients: Vec<RecognizedItem>,
    },
    Unstructured {
        #[serde(default)]
        text: String,
        #[serde(default)]
        regions: Vec<TextRegion>,
    },
}

impl RecognitionResult {
    /// 領域テキストのみから非構造化結果を作る
    pub fn from_regions<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let regions: Vec<TextRegion> = regions.into_iter().map(TextRegion::new).collect();
        let text = regions
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        RecognitionResult::Unstructured { text, regions }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, RecognitionResult::Structured { .. })
    }
}

/// 照合済み明細（ユーザー確認前）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedLineItem {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredient_id: Option<IngredientId>,
}

impl ParsedLineItem {
    /// カタログ食材から明細を作る（数量1・価格0）
    pub fn from_ingredient(ingredient: &Ingredient) -> Self {
        Self {
            name: ingredient.name.clone(),
            quantity: 1.0,
            unit: ingredient.unit.clone(),
            price: 0.0,
            ingredient_id: Some(ingredient.id),
        }
    }

    /// 未照合の自由記述明細
    pub fn free_text(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quantity: 1.0,
            unit: unit.into(),
            price: 0.0,
            ingredient_id: None,
        }
    }

    pub fn is_free_text(&self) -> bool {
        self.ingredient_id.is_none()
    }

    /// 再照合: カタログの正式名・単位・IDを採用
    pub fn assign(&mut self, ingredient: &Ingredient) {
        self.name = ingredient.name.clone();
        self.unit = ingredient.unit.clone();
        self.ingredient_id = Some(ingredient.id);
    }

    /// 照合を解除して自由記述に戻す
    pub fn clear_match(&mut self) {
        self.ingredient_id = None;
    }

    /// 数量を設定（1未満は1）
    pub fn set_quantity(&mut self, quantity: f64) {
        self.quantity = clamp_quantity(quantity);
    }

    /// 価格を設定（負数は0）
    pub fn set_price(&mut self, price: f64) {
        self.price = clamp_price(price);
    }
}

pub(crate) fn clamp_quantity(quantity: f64) -> f64 {
    if quantity.is_finite() && quantity >= 1.0 {
        quantity
    } else {
        1.0
    }
}

pub(crate) fn clamp_price(price: f64) -> f64 {
    if price.is_finite() && price > 0.0 {
        price
    } else {
        0.0
    }
}

/// 買い物かごの項目（ingredientIdで一意）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartEntry {
    pub ingredient_id: IngredientId,
    #[serde(default)]
    pub name: String,
    pub quantity: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub purchased: bool,
}

/// 購入履歴レコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRecord {
    pub ingredient_id: IngredientId,
    pub name: String,
    pub quantity: f64,
    pub price: f64,
    pub purchase_date: DateTime<Utc>,
}

/// 在庫レコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    pub ingredient_id: IngredientId,
    pub name: String,
    pub unit: String,
    pub quantity: f64,
    pub purchase_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    pub price: f64,
}

impl InventoryEntry {
    /// 購入日 + shelf_life_days を賞味期限とする
    pub fn with_shelf_life(
        ingredient_id: IngredientId,
        item: &ParsedLineItem,
        purchase_date: DateTime<Utc>,
        shelf_life_days: i64,
    ) -> Self {
        Self {
            ingredient_id,
            name: item.name.clone(),
            unit: item.unit.clone(),
            quantity: item.quantity,
            purchase_date,
            expiry_date: purchase_date + Duration::days(shelf_life_days),
            price: item.price,
        }
    }
}
