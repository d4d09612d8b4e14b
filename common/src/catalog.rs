//! 食材カタログ（読み取り専用スナップショット）
//!
//! カタログサービスから取得した食材一覧を保持する。
//! 更新は常に丸ごと差し替え（部分更新なし）なので、
//! 生成後は不変で複数の照合処理から共有できる。

use crate::types::{Ingredient, IngredientId};
use chrono::{DateTime, Utc};

/// 食材カタログのスナップショット
#[derive(Debug, Clone, Default)]
pub struct IngredientCatalog {
    ingredients: Vec<Ingredient>,
    /// 小文字化した名前（ingredientsと同じ並び）
    lowered: Vec<String>,
    fetched_at: Option<DateTime<Utc>>,
}

impl IngredientCatalog {
    pub fn new(ingredients: Vec<Ingredient>) -> Self {
        let lowered = ingredients
            .iter()
            .map(|i| i.name.trim().to_lowercase())
            .collect();
        Self {
            ingredients,
            lowered,
            fetched_at: None,
        }
    }

    /// 取得時刻付きで生成
    pub fn fetched(ingredients: Vec<Ingredient>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            fetched_at: Some(fetched_at),
            ..Self::new(ingredients)
        }
    }

    pub fn ingredients(&self) -> &[Ingredient] {
        &self.ingredients
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.ingredients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ingredients.is_empty()
    }

    pub fn get(&self, id: IngredientId) -> Option<&Ingredient> {
        self.ingredients.iter().find(|i| i.id == id)
    }

    /// 大文字小文字を無視した完全一致
    pub fn find_exact(&self, name: &str) -> Option<&Ingredient> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.entries()
            .find(|(_, lowered)| *lowered == needle)
            .map(|(ingredient, _)| ingredient)
    }

    /// 完全一致を優先し、なければ部分一致（双方向）
    pub fn find_by_name(&self, name: &str) -> Option<&Ingredient> {
        if let Some(found) = self.find_exact(name) {
            return Some(found);
        }
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.entries()
            .find(|(_, lowered)| is_mutual_substring(lowered, &needle))
            .map(|(ingredient, _)| ingredient)
    }

    /// 完全一致によるID解決（確定処理用）
    pub fn resolve_id(&self, name: &str) -> Option<IngredientId> {
        self.find_exact(name).map(|i| i.id)
    }

    /// 再照合用の候補検索
    ///
    /// 完全一致 → 前方一致 → 部分一致 → 逆包含 の順。同順位はカタログ順。
    pub fn search(&self, query: &str, limit: usize) -> Vec<&Ingredient> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut ranked: Vec<(u8, usize, &Ingredient)> = self
            .entries()
            .enumerate()
            .filter_map(|(index, (ingredient, lowered))| {
                let rank = if lowered == needle {
                    0
                } else if lowered.starts_with(&needle) {
                    1
                } else if lowered.contains(&needle) {
                    2
                } else if needle.contains(lowered) {
                    3
                } else {
                    return None;
                };
                Some((rank, index, ingredient))
            })
            .collect();

        ranked.sort_by_key(|(rank, index, _)| (*rank, *index));
        ranked.into_iter().take(limit).map(|(_, _, i)| i).collect()
    }

    /// 名前が空でない食材と小文字化名のペア
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Ingredient, &str)> {
        self.ingredients
            .iter()
            .zip(self.lowered.iter())
            .filter(|(_, lowered)| !lowered.is_empty())
            .map(|(ingredient, lowered)| (ingredient, lowered.as_str()))
    }
}

/// どちらかがもう一方を含むか
pub(crate) fn is_mutual_substring(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}
