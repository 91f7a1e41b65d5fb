//! ラベル集合とモデルメタデータ
//!
//! 保存形式:
//! - labels.json - `{ "labels": [...], "labelIndex": { label: index } }`
//! - info.json   - `{ labels, trainedAt, sampleCount, epochs, architecture, validationAccuracy }`

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ml::ArchitectureDescriptor;

/// ラベルとインデックスの全単射
///
/// インデックスは出現順。予測結果は必ずそのモデルと一緒に保存された
/// LabelSetで解釈する。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "LabelFile", try_from = "LabelFile")]
pub struct LabelSet {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

/// labels.json の中身
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelFile {
    labels: Vec<String>,
    label_index: HashMap<String, usize>,
}

impl LabelSet {
    /// 重複を除き、最初に現れた順でインデックスを振る
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = LabelSet::default();
        for label in labels {
            if !set.index.contains_key(label) {
                set.index.insert(label.to_string(), set.labels.len());
                set.labels.push(label.to_string());
            }
        }
        set
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label_at(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize labels to JSON")
    }

    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize labels from JSON")
    }
}

impl From<LabelSet> for LabelFile {
    fn from(set: LabelSet) -> Self {
        Self {
            labels: set.labels,
            label_index: set.index,
        }
    }
}

impl TryFrom<LabelFile> for LabelSet {
    type Error = String;

    fn try_from(file: LabelFile) -> std::result::Result<Self, Self::Error> {
        let set = LabelSet::from_labels(file.labels.iter().map(String::as_str));
        if set.len() != file.labels.len() {
            return Err("labels contain duplicates".to_string());
        }
        if set.index != file.label_index {
            return Err("labelIndex does not match the order of labels".to_string());
        }
        Ok(set)
    }
}

/// モデルメタデータ（info.json）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    /// LabelSet順のラベル
    pub labels: Vec<String>,

    /// 学習時刻（RFC 3339）
    pub trained_at: DateTime<Utc>,

    /// 学習に使った画像枚数
    pub sample_count: usize,

    /// 学習エポック数
    pub epochs: usize,

    /// ネットワーク構成（読み込み時の再構築に使う）
    pub architecture: ArchitectureDescriptor,

    /// 最終エポックの検証精度（検証データが無い場合はnull）
    pub validation_accuracy: Option<f64>,
}

impl ModelMetadata {
    pub fn new(
        labels: &LabelSet,
        sample_count: usize,
        epochs: usize,
        architecture: ArchitectureDescriptor,
        validation_accuracy: Option<f64>,
    ) -> Self {
        Self {
            labels: labels.labels().to_vec(),
            trained_at: Utc::now(),
            sample_count,
            epochs,
            architecture,
            validation_accuracy,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
