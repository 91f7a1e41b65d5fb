//! アプリケーション設定管理モジュール
//!
//! データセット・モデル保存先・学習パラメータ・サーバー設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ml::FitConfig;

/// パス設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PathSettings {
    /// 学習データセットのルート（`<root>/<label>/<画像>`）
    pub dataset_root: PathBuf,
    /// モデル保存先（model/, labels.json, info.json）
    pub artifact_dir: PathBuf,
    /// 静的ファイルのディレクトリ
    pub public_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("dataset/fruits"),
            artifact_dir: PathBuf::from("models/fruit-classifier"),
            public_dir: PathBuf::from("public"),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// 検証データの割合
    pub validation_split: f64,
    /// ランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            batch_size: 32,
            learning_rate: 1e-3,
            validation_split: 0.2,
            seed: 42,
        }
    }
}

impl TrainingSettings {
    pub fn fit_config(&self) -> FitConfig {
        FitConfig {
            epochs: self.num_epochs,
            batch_size: self.batch_size,
            validation_split: self.validation_split,
            seed: self.seed,
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DatasetSettings {
    /// 揃っていることが期待されるラベル（不足時は警告のみ）
    pub expected_labels: Vec<String>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            expected_labels: ["apple", "banana", "pear", "orange", "grape"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロード1ファイルの上限（バイト）
    pub max_upload_bytes: usize,
    /// 1リクエストでアップロードできるファイル数
    pub max_upload_files: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_upload_bytes: 10 * 1024 * 1024,
            max_upload_files: 100,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// パス設定
    pub paths: PathSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データセット設定
    pub dataset: DatasetSettings,
    /// サーバー設定
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出す
    pub fn log_summary(&self) {
        info!("データセット: {}", self.paths.dataset_root.display());
        info!("モデル保存先: {}", self.paths.artifact_dir.display());
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, 検証割合: {}, シード: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.validation_split,
            self.training.seed
        );
    }
}
