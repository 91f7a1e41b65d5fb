//! モデル推論機能

use std::sync::Arc;

use tracing::debug;

use crate::error::{LifecycleError, Result};
use crate::lifecycle::{ActiveModel, ModelLifecycleManager};
use crate::ml::engine::argmax;
use crate::ml::preprocess::ImagePreprocessor;
use crate::types::{LabelProbability, Prediction};

/// 推論サービス
///
/// Ready状態のモデルを取り出して1枚ずつ分類する。状態は変更しない。
#[derive(Clone)]
pub struct InferenceService {
    lifecycle: ModelLifecycleManager,
    preprocessor: ImagePreprocessor,
}

impl InferenceService {
    pub fn new(lifecycle: ModelLifecycleManager) -> Self {
        Self {
            lifecycle,
            preprocessor: ImagePreprocessor,
        }
    }

    /// 画像のバイト列を分類
    pub async fn predict(&self, bytes: Vec<u8>) -> Result<Prediction> {
        let active = self.lifecycle.ready_model()?;
        let preprocessor = self.preprocessor;

        tokio::task::spawn_blocking(move || classify(&active, &preprocessor, &bytes))
            .await
            .map_err(|e| LifecycleError::InferenceFailure(anyhow::anyhow!("inference task aborted: {}", e)))?
    }
}

/// 単一画像を分類
///
/// 入力テンソルと確率ベクトルはこの関数を抜けた時点で解放される。
fn classify(active: &Arc<ActiveModel>, preprocessor: &ImagePreprocessor, bytes: &[u8]) -> Result<Prediction> {
    let tensor = preprocessor.prepare(bytes)?;
    let probabilities = active
        .model
        .predict(&tensor)
        .map_err(LifecycleError::InferenceFailure)?;

    let labels = active.labels.labels();
    if probabilities.len() != labels.len() {
        return Err(LifecycleError::InferenceFailure(anyhow::anyhow!(
            "model returned {} probabilities for {} labels",
            probabilities.len(),
            labels.len()
        )));
    }

    // 同値なら学習時の出現順で先のラベル
    let best = argmax(&probabilities).ok_or_else(|| {
        LifecycleError::InferenceFailure(anyhow::anyhow!("model returned no usable probabilities"))
    })?;

    let distribution: Vec<LabelProbability> = labels
        .iter()
        .zip(&probabilities)
        .map(|(label, &probability)| LabelProbability {
            label: label.clone(),
            probability,
        })
        .collect();

    debug!("推論結果: {} ({:.4})", labels[best], probabilities[best]);

    Ok(Prediction {
        label: labels[best].clone(),
        probability: probabilities[best],
        distribution,
    })
}
