//! 認識結果と食材カタログの照合
//!
//! 認識ジョブの出力（構造化 / 非構造化）をカタログと突き合わせ、
//! 明細候補（ParsedLineItem）のリストを作る。I/Oなしの純粋関数。
//!
//! ## 処理フロー
//! 1. 構造化結果: 品目名をカタログで引き、正式名・単位・IDを採用
//! 2. 非構造化結果: 領域テキストで食材を検出し、前後2領域の数値から価格・数量を決定
//! 3. 2で何も見つからなければ全文から食材名を探し、直後の数字を価格とする

pub mod numeric;

use crate::catalog::{is_mutual_substring, IngredientCatalog};
use crate::types::{
    clamp_price, clamp_quantity, Ingredient, ParsedLineItem, RecognitionResult, RecognizedItem,
    TextRegion,
};
use numeric::TokenRole;
use std::collections::HashSet;

/// 価格・数量を探す前後の領域数
pub const NEIGHBOR_WINDOW: usize = 2;

/// 全文走査時、食材名の後ろを見る文字数
pub const FALLBACK_WINDOW_CHARS: usize = 50;

/// 逆包含（領域テキストが食材名に含まれる）を認める最小文字数
const MIN_REVERSE_MATCH_CHARS: usize = 2;

/// 認識結果をカタログと照合する
///
/// 同じ入力に対しては常に同じ順序・内容を返す。
///
/// # Examples
/// ```
/// use receipt_ingest_common::{match_ingredients, Ingredient, IngredientCatalog, RecognitionResult};
///
/// let catalog = IngredientCatalog::new(vec![Ingredient::new(7, "계란", "개")]);
/// let result = RecognitionResult::from_regions(["계란", "3400"]);
/// let items = match_ingredients(&result, &catalog);
/// assert_eq!(items[0].price, 3400.0);
/// assert_eq!(items[0].ingredient_id, Some(7));
/// ```
pub fn match_ingredients(
    result: &RecognitionResult,
    catalog: &IngredientCatalog,
) -> Vec<ParsedLineItem> {
    match result {
        RecognitionResult::Structured { ingredients } => match_structured(ingredients, catalog),
        RecognitionResult::Unstructured { text, regions } => {
            let items = match_regions(regions, catalog);
            if items.is_empty() {
                match_full_text(text, catalog)
            } else {
                items
            }
        }
    }
}

/// 構造化結果の照合（1品目 → 1明細）
pub fn match_structured(
    reported: &[RecognizedItem],
    catalog: &IngredientCatalog,
) -> Vec<ParsedLineItem> {
    reported
        .iter()
        .filter(|item| !item.item_name.trim().is_empty())
        .map(|item| {
            let quantity = clamp_quantity(item.quantity.unwrap_or(1.0));
            let price = clamp_price(item.price.unwrap_or(0.0));

            match catalog.find_by_name(&item.item_name) {
                Some(ingredient) => ParsedLineItem {
                    name: ingredient.name.clone(),
                    quantity,
                    unit: if ingredient.unit.is_empty() {
                        item.unit.clone()
                    } else {
                        ingredient.unit.clone()
                    },
                    price,
                    ingredient_id: Some(ingredient.id),
                },
                None => ParsedLineItem {
                    name: item.item_name.trim().to_string(),
                    quantity,
                    unit: item.unit.clone(),
                    price,
                    ingredient_id: None,
                },
            }
        })
        .collect()
}

/// 領域テキストによる照合
///
/// 各領域で最初に見つかった食材を候補にし、同じ食材名は一度だけ採用する。
pub fn match_regions(regions: &[TextRegion], catalog: &IngredientCatalog) -> Vec<ParsedLineItem> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut anchors: Vec<(usize, &Ingredient)> = Vec::new();

    for (index, region) in regions.iter().enumerate() {
        let text = region.text.trim().to_lowercase();
        if text.is_empty() || numeric::is_numeric_only(&text) {
            continue;
        }

        if let Some((ingredient, name)) = best_region_match(&text, catalog, &seen) {
            seen.insert(name);
            anchors.push((index, ingredient));
        }
    }

    anchors
        .into_iter()
        .map(|(anchor, ingredient)| {
            let mut item = ParsedLineItem::from_ingredient(ingredient);
            apply_neighbor_numbers(&mut item, regions, anchor);
            item
        })
        .collect()
}

/// 1領域に対する最良の食材
///
/// 完全一致 → 領域に含まれる食材名（長い名前を優先）→ 領域を含む食材名
fn best_region_match<'a>(
    text: &str,
    catalog: &'a IngredientCatalog,
    seen: &HashSet<&str>,
) -> Option<(&'a Ingredient, &'a str)> {
    let unseen = move || catalog.entries().filter(move |(_, name)| !seen.contains(name));

    if let Some(hit) = unseen().find(|(_, name)| *name == text) {
        return Some(hit);
    }

    let mut contained: Option<(&Ingredient, &str)> = None;
    for (ingredient, name) in unseen().filter(|(_, name)| text.contains(*name)) {
        let longer = contained
            .map(|(_, best)| name.chars().count() > best.chars().count())
            .unwrap_or(true);
        if longer {
            contained = Some((ingredient, name));
        }
    }
    if contained.is_some() {
        return contained;
    }

    if text.chars().count() < MIN_REVERSE_MATCH_CHARS {
        return None;
    }
    unseen().find(|(_, name)| is_mutual_substring(name, text))
}

/// アンカー前後の領域から価格・数量を決める
///
/// 価格範囲の値は価格として確定。数量範囲の値は価格が未確定の間だけ数量になる。
fn apply_neighbor_numbers(item: &mut ParsedLineItem, regions: &[TextRegion], anchor: usize) {
    let start = anchor.saturating_sub(NEIGHBOR_WINDOW);
    let end = (anchor + NEIGHBOR_WINDOW).min(regions.len().saturating_sub(1));

    let mut price: Option<f64> = None;
    let mut quantity: Option<f64> = None;

    for region in &regions[start..=end] {
        for value in numeric::numeric_tokens(&region.text) {
            match numeric::classify(value) {
                TokenRole::Price => {
                    if price.is_none() {
                        price = Some(value);
                    }
                }
                TokenRole::Quantity => {
                    if price.is_none() && quantity.is_none() {
                        quantity = Some(value);
                    }
                }
                TokenRole::Ignored => {}
            }
        }
    }

    if let Some(price) = price {
        item.price = price;
    }
    if let Some(quantity) = quantity {
        item.quantity = clamp_quantity(quantity);
    }
}

/// 全文走査による照合（領域で見つからなかった場合）
pub fn match_full_text(text: &str, catalog: &IngredientCatalog) -> Vec<ParsedLineItem> {
    let lowered = text.to_lowercase();
    if lowered.trim().is_empty() {
        return Vec::new();
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut items = Vec::new();

    for (ingredient, name) in catalog.entries() {
        if seen.contains(name) {
            continue;
        }
        let Some(position) = lowered.find(name) else {
            continue;
        };
        seen.insert(name);

        let window: String = lowered[position + name.len()..]
            .chars()
            .take(FALLBACK_WINDOW_CHARS)
            .collect();

        let mut item = ParsedLineItem::from_ingredient(ingredient);
        item.price = numeric::first_digit_run(&window).unwrap_or(0.0);
        items.push(item);
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ingredient;

    fn catalog() -> IngredientCatalog {
        IngredientCatalog::new(vec![
            Ingredient::new(7, "계란", "개"),
            Ingredient::new(8, "우유", "ml"),
            Ingredient::new(9, "저지방 우유", "ml"),
            Ingredient::new(12, "두부", "모"),
        ])
    }

    fn regions(texts: &[&str]) -> RecognitionResult {
        RecognitionResult::from_regions(texts.iter().copied())
    }

    // =============================================
    // 領域照合テスト
    // =============================================

    #[test]
    fn test_region_price_committed() {
        let catalog = IngredientCatalog::new(vec![Ingredient::new(7, "계란", "개")]);
        let items = match_ingredients(&regions(&["계란", "3400"]), &catalog);
        assert_eq!(
            items,
            vec![ParsedLineItem {
                name: "계란".to_string(),
                quantity: 1.0,
                unit: "개".to_string(),
                price: 3400.0,
                ingredient_id: Some(7),
            }]
        );
    }

    #[test]
    fn test_region_quantity_without_price() {
        let items = match_ingredients(&regions(&["계란", "2"]), &catalog());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price, 0.0);
        assert_eq!(items[0].quantity, 2.0);
    }

    #[test]
    fn test_region_out_of_range_token_ignored() {
        let items = match_ingredients(&regions(&["계란", "60000"]), &catalog());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price, 0.0);
        assert_eq!(items[0].quantity, 1.0);
    }

    #[test]
    fn test_region_quantity_skipped_after_price() {
        let items = match_ingredients(&regions(&["3,400", "계란", "2"]), &catalog());
        assert_eq!(items[0].price, 3400.0);
        assert_eq!(items[0].quantity, 1.0);
    }

    #[test]
    fn test_region_window_is_two_each_side() {
        let items = match_ingredients(
            &regions(&["1200", "영수증", "할인", "계란", "비고", "메모", "4500"]),
            &catalog(),
        );
        assert_eq!(items.len(), 1);
        // 0番目と6番目は窓の外
        assert_eq!(items[0].price, 0.0);
    }

    #[test]
    fn test_region_first_occurrence_wins() {
        let items = match_ingredients(
            &regions(&["계란", "3400", "두부", "1500", "계란", "9900"]),
            &catalog(),
        );
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["계란", "두부"]);
        assert_eq!(items[0].price, 3400.0);
    }

    #[test]
    fn test_region_prefers_exact_and_longest_name() {
        let items = match_ingredients(&regions(&["저지방 우유 1L", "2,980"]), &catalog());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].ingredient_id, Some(9));
        assert_eq!(items[0].price, 2980.0);
        // "1L" の1が数量になる
        assert_eq!(items[0].quantity, 1.0);
    }

    #[test]
    fn test_region_reverse_substring() {
        // 領域テキストが食材名の一部
        let items = match_ingredients(&regions(&["저지방", "2,980"]), &catalog());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].ingredient_id, Some(9));
    }

    #[test]
    fn test_region_numeric_only_never_anchors() {
        let catalog = IngredientCatalog::new(vec![Ingredient::new(20, "비타민 2000", "정")]);
        let result = RecognitionResult::Unstructured {
            text: String::new(),
            regions: vec![TextRegion::new("2000")],
        };
        assert!(match_ingredients(&result, &catalog).is_empty());
    }

    // =============================================
    // 全文フォールバックテスト
    // =============================================

    #[test]
    fn test_full_text_fallback_price() {
        let result = RecognitionResult::Unstructured {
            text: "영수증\n두부 1,500원\n합계 1,500".to_string(),
            regions: vec![],
        };
        let items = match_ingredients(&result, &catalog());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "두부");
        assert_eq!(items[0].price, 1500.0);
        assert_eq!(items[0].quantity, 1.0);
    }

    #[test]
    fn test_full_text_fallback_window_limit() {
        let filler = "가".repeat(FALLBACK_WINDOW_CHARS);
        let result = RecognitionResult::Unstructured {
            text: format!("두부{}2500", filler),
            regions: vec![],
        };
        let items = match_ingredients(&result, &catalog());
        assert_eq!(items[0].price, 0.0);
    }

    #[test]
    fn test_full_text_used_only_when_regions_empty_handed() {
        // 領域で候補が見つかれば全文は見ない
        let result = RecognitionResult::Unstructured {
            text: "계란 3400 두부 1500".to_string(),
            regions: vec![TextRegion::new("계란"), TextRegion::new("3400")],
        };
        let items = match_ingredients(&result, &catalog());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "계란");
    }

    #[test]
    fn test_empty_result() {
        let result = RecognitionResult::Unstructured {
            text: String::new(),
            regions: vec![],
        };
        assert!(match_ingredients(&result, &catalog()).is_empty());
    }

    // =============================================
    // 構造化結果テスト
    // =============================================

    #[test]
    fn test_structured_adopts_catalog() {
        let result = RecognitionResult::Structured {
            ingredients: vec![
                RecognizedItem {
                    item_name: "유기농 계란".to_string(),
                    quantity: Some(2.0),
                    unit: "판".to_string(),
                    price: Some(6800.0),
                },
                RecognizedItem {
                    item_name: "수제 잼".to_string(),
                    quantity: None,
                    unit: "병".to_string(),
                    price: Some(-1.0),
                },
            ],
        };
        let items = match_ingredients(&result, &catalog());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "계란");
        assert_eq!(items[0].unit, "개");
        assert_eq!(items[0].ingredient_id, Some(7));
        assert_eq!(items[0].quantity, 2.0);
        assert_eq!(items[0].price, 6800.0);

        assert_eq!(items[1].name, "수제 잼");
        assert_eq!(items[1].unit, "병");
        assert!(items[1].is_free_text());
        assert_eq!(items[1].quantity, 1.0);
        assert_eq!(items[1].price, 0.0);
    }

    #[test]
    fn test_structured_keeps_duplicates() {
        let item = RecognizedItem {
            item_name: "두부".to_string(),
            quantity: Some(1.0),
            unit: String::new(),
            price: Some(1500.0),
        };
        let result = RecognitionResult::Structured {
            ingredients: vec![item.clone(), item],
        };
        assert_eq!(match_ingredients(&result, &catalog()).len(), 2);
    }

    #[test]
    fn test_match_is_deterministic() {
        let result = regions(&["우유", "2", "계란", "3,400", "두부", "1500", "저지방 우유"]);
        let catalog = catalog();
        let first = match_ingredients(&result, &catalog);
        for _ in 0..10 {
            assert_eq!(match_ingredients(&result, &catalog), first);
        }
    }
}
