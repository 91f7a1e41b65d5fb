//! 画像の前処理
//!
//! 任意の画像バイト列を 64x64 RGB、[0, 1] 正規化済みの固定形状テンソルに変換する。

use std::path::Path;

use image::imageops::FilterType;

use crate::error::{LifecycleError, Result};

/// 入力画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 64;

/// RGB
pub const CHANNELS: usize = 3;

/// 正規化済み画像テンソル [H, W, 3]（HWC順で平坦化）
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
}

impl ImageTensor {
    pub const LEN: usize = IMAGE_SIZE * IMAGE_SIZE * CHANNELS;

    pub fn from_vec(data: Vec<f32>) -> Result<Self> {
        if data.len() != Self::LEN {
            return Err(LifecycleError::UnsupportedImage(format!(
                "tensor has {} values, expected {}",
                data.len(),
                Self::LEN
            )));
        }
        Ok(Self { data })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// 画素値 (y, x, channel)
    pub fn at(&self, y: usize, x: usize, channel: usize) -> f32 {
        self.data[(y * IMAGE_SIZE + x) * CHANNELS + channel]
    }

    /// 全画素の平均値
    pub fn mean(&self) -> f32 {
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }
}

/// 画像前処理
///
/// 共有状態を持たないので並行に呼び出してよい。
#[derive(Debug, Clone, Copy, Default)]
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// バイト列をデコードしてテンソル化
    pub fn prepare(&self, bytes: &[u8]) -> Result<ImageTensor> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| LifecycleError::UnsupportedImage(e.to_string()))?;

        if img.width() == 0 || img.height() == 0 {
            return Err(LifecycleError::UnsupportedImage(
                "image has zero width or height".to_string(),
            ));
        }

        let size = IMAGE_SIZE as u32;
        let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();

        let mut data = Vec::with_capacity(ImageTensor::LEN);
        for pixel in rgb.pixels() {
            for channel in 0..CHANNELS {
                data.push(pixel[channel] as f32 / 255.0);
            }
        }

        ImageTensor::from_vec(data)
    }

    /// ファイルから読み込んでテンソル化
    pub fn prepare_file(&self, path: &Path) -> Result<ImageTensor> {
        let bytes = std::fs::read(path).map_err(|e| {
            LifecycleError::UnsupportedImage(format!("{}: {}", path.display(), e))
        })?;
        self.prepare(&bytes)
    }
}
