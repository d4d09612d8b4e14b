//! 数値トークンの抽出と分類
//!
//! レシート上の数値を価格・数量・無視のいずれかに振り分ける。

use regex::Regex;

/// 価格とみなす範囲（両端含む）
pub const PRICE_MIN: f64 = 1000.0;
pub const PRICE_MAX: f64 = 50000.0;

/// 数量とみなす範囲（下限含む・上限含まない）
pub const QUANTITY_MIN: f64 = 1.0;
pub const QUANTITY_MAX: f64 = 1000.0;

lazy_static::lazy_static! {
    // 桁区切りカンマと小数点を許容
    static ref NUMBER_RE: Regex = Regex::new(r"[0-9][0-9,]*(?:\.[0-9]+)?").unwrap();
    // 小数点なしの数字列
    static ref DIGIT_RUN_RE: Regex = Regex::new(r"[0-9][0-9,]*").unwrap();
}

/// 数値トークンの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRole {
    Price,
    Quantity,
    Ignored,
}

/// 値の範囲で役割を判定
pub fn classify(value: f64) -> TokenRole {
    if (PRICE_MIN..=PRICE_MAX).contains(&value) {
        TokenRole::Price
    } else if (QUANTITY_MIN..QUANTITY_MAX).contains(&value) {
        TokenRole::Quantity
    } else {
        TokenRole::Ignored
    }
}

/// テキスト中の数値トークンを出現順に抽出（カンマ除去）
pub fn numeric_tokens(text: &str) -> Vec<f64> {
    NUMBER_RE
        .find_iter(text)
        .filter_map(|m| parse_number(m.as_str()))
        .collect()
}

/// 最初の数字列（カンマ除去）
pub fn first_digit_run(text: &str) -> Option<f64> {
    DIGIT_RUN_RE
        .find(text)
        .and_then(|m| parse_number(m.as_str()))
}

/// 文字を含まない（数字・記号・空白のみの）テキストか
pub fn is_numeric_only(text: &str) -> bool {
    !text.trim().is_empty() && !text.chars().any(char::is_alphabetic)
}

fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok()
}
