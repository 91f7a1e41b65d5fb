//! ライフサイクル操作のエラー定義

use thiserror::Error;

/// モデルライフサイクルのエラー
///
/// 画像単位のデコード失敗 (`UnsupportedImage`) はデータセット読み込み中は
/// スキップ扱いになり、呼び出し元へ伝播するのは推論時のみ。
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// データセットのルートが存在しない
    #[error("dataset unavailable: {0}")]
    DatasetUnavailable(String),

    /// 走査後に有効なサンプルが0件
    #[error("dataset contains no usable images: {0}")]
    EmptyDataset(String),

    /// デコードまたはリサイズできない画像
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    /// 学習または読み込みが既に実行中
    #[error("a training or loading operation is already in progress")]
    AlreadyInProgress,

    /// Ready状態のモデルが無い
    #[error("no trained model is available")]
    ModelUnavailable,

    /// 永続化されたモデルが見つからない
    #[error("no persisted model artifact found at {0}")]
    ArtifactNotFound(String),

    /// 構築・学習・保存のいずれかで失敗
    #[error("training failed: {0:#}")]
    TrainingFailure(anyhow::Error),

    /// モデル/メタデータの読み書きに失敗
    #[error("persistence failed: {0:#}")]
    PersistenceFailure(anyhow::Error),

    /// 推論中にエンジンが失敗
    #[error("inference failed: {0:#}")]
    InferenceFailure(anyhow::Error),
}

impl LifecycleError {
    /// エラー種別の短い識別子（HTTPレスポンスやログ用）
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::DatasetUnavailable(_) => "dataset_unavailable",
            LifecycleError::EmptyDataset(_) => "empty_dataset",
            LifecycleError::UnsupportedImage(_) => "unsupported_image",
            LifecycleError::AlreadyInProgress => "already_in_progress",
            LifecycleError::ModelUnavailable => "model_unavailable",
            LifecycleError::ArtifactNotFound(_) => "artifact_not_found",
            LifecycleError::TrainingFailure(_) => "training_failure",
            LifecycleError::PersistenceFailure(_) => "persistence_failure",
            LifecycleError::InferenceFailure(_) => "inference_failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
