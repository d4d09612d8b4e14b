//! アップロード前の画像処理
//!
//! EXIFの向きを反映し、長辺を `max_size` 以下に縮小してJPEGに再エンコードする。

use crate::error::UploadError;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::Path;

pub const CONTENT_TYPE: &str = "image/jpeg";

/// ファイル名に使うハッシュの桁数
const HASH_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct PreparedAsset {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PreparedAsset {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// 画像を読み込んでアップロード用JPEGにする
pub fn prepare(path: &Path, max_size: u32, quality: u8) -> Result<PreparedAsset, UploadError> {
    if !path.exists() {
        return Err(UploadError::FileNotFound(path.display().to_string()));
    }

    let raw = std::fs::read(path)?;
    let decoded = image::load_from_memory(&raw)
        .map_err(|e| UploadError::InvalidAsset(format!("{}: {}", path.display(), e)))?;

    let oriented = apply_orientation(decoded, read_orientation(&raw));
    let resized = if oriented.width().max(oriented.height()) > max_size {
        oriented.resize(max_size, max_size, FilterType::Lanczos3)
    } else {
        oriented
    };

    let rgb = resized.to_rgb8();
    let mut bytes = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, quality))
        .map_err(|e| UploadError::InvalidAsset(e.to_string()))?;

    tracing::debug!(
        path = %path.display(),
        width = rgb.width(),
        height = rgb.height(),
        bytes = bytes.len(),
        "画像を変換"
    );

    Ok(PreparedAsset {
        width: rgb.width(),
        height: rgb.height(),
        bytes,
    })
}

/// EXIFのOrientation（なければ1）
fn read_orientation(raw: &[u8]) -> u32 {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(raw)) {
        Ok(exif) => exif,
        Err(_) => return 1,
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// `{purpose}/{yyyyMMddHHmmss}_{sha256先頭}.jpg`
pub fn file_name(purpose: &str, bytes: &[u8], now: DateTime<Utc>) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    let purpose = purpose.trim_matches('/');
    let purpose = if purpose.is_empty() { "receipt" } else { purpose };
    format!(
        "{}/{}_{}.jpg",
        purpose,
        now.format("%Y%m%d%H%M%S"),
        &digest[..HASH_PREFIX_LEN]
    )
}
