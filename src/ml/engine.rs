//! テンソル計算エンジンとの境界
//!
//! ライフサイクル側は「いつ・どのデータで」エンジンを呼ぶかだけを決める。
//! 畳み込みや最適化の中身はエンジン実装（`BurnEngine` など）に任せる。

use std::path::Path;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::ml::preprocess::{ImageTensor, CHANNELS, IMAGE_SIZE};

/// 畳み込みステージ: Conv + ReLU → MaxPool → Dropout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvStageSpec {
    pub filters: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub dropout: f64,
}

/// 全結合の隠れ層: Dense + ReLU → Dropout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenseSpec {
    pub units: usize,
    pub dropout: f64,
}

/// ネットワーク構成
///
/// `info.json` の `architecture` にそのまま保存され、読み込み時に
/// 同じ形のモデルを組み立てるのに使われる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureDescriptor {
    pub name: String,
    /// [高さ, 幅, チャネル]
    pub input_shape: [usize; 3],
    pub conv_stages: Vec<ConvStageSpec>,
    pub hidden: Vec<DenseSpec>,
    /// 出力層（softmax）のユニット数 = クラス数
    pub num_classes: usize,
}

impl ArchitectureDescriptor {
    /// 固定アーキテクチャ
    ///
    /// - Conv 3x3 (32) + MaxPool 2x2 + Dropout 0.25
    /// - Conv 3x3 (64) + MaxPool 2x2 + Dropout 0.25
    /// - Flatten → Dense 128 + Dropout 0.5 → Dense num_classes (softmax)
    pub fn standard(num_classes: usize) -> Self {
        Self {
            name: "sequential-cnn".to_string(),
            input_shape: [IMAGE_SIZE, IMAGE_SIZE, CHANNELS],
            conv_stages: vec![
                ConvStageSpec { filters: 32, kernel_size: 3, pool_size: 2, dropout: 0.25 },
                ConvStageSpec { filters: 64, kernel_size: 3, pool_size: 2, dropout: 0.25 },
            ],
            hidden: vec![DenseSpec { units: 128, dropout: 0.5 }],
            num_classes,
        }
    }

    /// Flatten後の特徴次元
    ///
    /// same paddingなので畳み込みでサイズは変わらず、プーリングごとに縮む。
    pub fn flattened_features(&self) -> usize {
        let [height, width, _] = self.input_shape;
        let (mut h, mut w) = (height, width);
        for stage in &self.conv_stages {
            h /= stage.pool_size.max(1);
            w /= stage.pool_size.max(1);
        }
        let channels = self
            .conv_stages
            .last()
            .map(|s| s.filters)
            .unwrap_or(self.input_shape[2]);
        channels * h * w
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OptimizerSpec {
    Adam { learning_rate: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LossSpec {
    CategoricalCrossEntropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub optimizer: OptimizerSpec,
    pub loss: LossSpec,
}

impl CompileSpec {
    pub fn adam(learning_rate: f64) -> Self {
        Self {
            optimizer: OptimizerSpec::Adam { learning_rate },
            loss: LossSpec::CategoricalCrossEntropy,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self.optimizer {
            OptimizerSpec::Adam { learning_rate } => learning_rate,
        }
    }
}

/// fit() の設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f64,
    pub seed: u64,
}

/// エポックごとの指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochMetrics {
    /// 1始まり
    pub epoch: usize,
    pub loss: f64,
    /// 0.0〜1.0
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// 学習可能な分類モデル
pub trait ClassifierModel: Send + Sync {
    fn compile(&mut self, spec: &CompileSpec) -> Result<()>;

    /// `labels[i]` は `inputs[i]` のクラスインデックス
    fn fit(
        &mut self,
        inputs: &[ImageTensor],
        labels: &[usize],
        config: &FitConfig,
        on_epoch: &mut dyn FnMut(&EpochMetrics),
    ) -> Result<Vec<EpochMetrics>>;

    /// クラス数と同じ長さの確率ベクトル
    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>>;

    /// `dir` 以下にエンジン固有のファイルを書き出す
    fn save(&self, dir: &Path) -> Result<()>;
}

/// テンソル計算エンジン
pub trait ClassifierEngine: Send + Sync {
    fn build(&self, architecture: &ArchitectureDescriptor) -> Result<Box<dyn ClassifierModel>>;

    fn load(
        &self,
        dir: &Path,
        architecture: &ArchitectureDescriptor,
    ) -> Result<Box<dyn ClassifierModel>>;
}

/// 学習用と検証用にインデックスを分割
///
/// シード付きでシャッフルした後、末尾 `floor(len * validation_split)` 件を検証用にする。
/// 2件以上あれば検証用を最低1件確保し、学習用は必ず1件以上残す。
pub fn split_indices(len: usize, validation_split: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let split = validation_split.clamp(0.0, 1.0);
    let mut val_len = (len as f64 * split).floor() as usize;
    if val_len == 0 && len >= 2 && split > 0.0 {
        val_len = 1;
    }
    val_len = val_len.min(len.saturating_sub(1));

    let val = indices.split_off(len - val_len);
    (indices, val)
}

/// 最大値のインデックス（同値なら小さい方）
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ if v.is_nan() => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
