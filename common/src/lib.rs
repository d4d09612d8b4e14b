//! Receipt Ingest Common Library
//!
//! 本体クレートと共有される型・カタログ・メッセージパーサー・食材照合

pub mod types;
pub mod catalog;
pub mod error;
pub mod matcher;
pub mod protocol;

pub use types::{
    CartEntry, ConnectionState, Ingredient, IngredientId, InventoryEntry, ParsedLineItem,
    PurchaseRecord, RecognitionProgress, RecognitionResult, RecognizedItem, TextRegion,
    UploadProgress, DEFAULT_SHELF_LIFE_DAYS, FREE_TEXT_ID,
};
pub use catalog::IngredientCatalog;
pub use error::{Error, Result};
pub use matcher::match_ingredients;
pub use protocol::{
    is_rate_limit_message, parse_server_message, ClientMessage, ServerError, ServerMessage,
};
