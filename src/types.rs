use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ml::EpochMetrics;

/// モデルの状態
///
/// `Uninitialized → {Loading, Training} → {Ready, Failed}`
/// `Ready → Training`（再学習）と `Failed → Training`（リトライ）も許可する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Uninitialized,
    Loading,
    Training,
    Ready,
    Failed,
}

impl ModelState {
    /// 読み込み中または学習中
    pub fn is_busy(self) -> bool {
        matches!(self, ModelState::Loading | ModelState::Training)
    }

    pub fn can_transition_to(self, next: ModelState) -> bool {
        use ModelState::*;
        match (self, next) {
            (Loading | Training, Ready | Failed) => true,
            (Loading | Training, _) => false,
            (Uninitialized, Loading | Training) => true,
            (Ready | Failed, Training) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelState::Uninitialized => write!(f, "uninitialized"),
            ModelState::Loading => write!(f, "loading"),
            ModelState::Training => write!(f, "training"),
            ModelState::Ready => write!(f, "ready"),
            ModelState::Failed => write!(f, "failed"),
        }
    }
}

/// `getStatus()` の結果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ModelState,
    pub ready: bool,
    pub labels: Vec<String>,
    pub class_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelProbability {
    pub label: String,
    pub probability: f32,
}

/// 1枚の画像に対する推論結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
    /// LabelSet順の全クラス確率
    pub distribution: Vec<LabelProbability>,
}

/// 学習結果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingReport {
    pub labels: Vec<String>,
    pub total_images: usize,
    /// デコードできずスキップした画像数
    pub skipped_images: usize,
    pub metrics_history: Vec<EpochMetrics>,
    pub validation_accuracy: Option<f64>,
    pub trained_at: DateTime<Utc>,
}

/// `initialize()` の結果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum InitOutcome {
    /// 既にReady（何もしない）
    AlreadyReady,
    /// 保存済みモデルを読み込んだ
    Loaded { labels: Vec<String> },
    /// データセットから新しく学習した
    Trained(TrainingReport),
    /// モデルを用意できなかった（プロセスは継続）
    NoModelAvailable { reason: String },
}
