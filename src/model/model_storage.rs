//! モデルとメタデータの永続化
//!
//! ディレクトリ構成:
//! - model/       - エンジン固有のモデルファイル
//! - labels.json  - LabelSet
//! - info.json    - ModelMetadata
//!
//! 3つは必ず1組で書き込む。まず `<root>.staging` に全部書いてから
//! 既存の `<root>` を `<root>.previous` に退避し、staging を `<root>` に差し替える。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::ml::{ClassifierEngine, ClassifierModel};
use crate::model::model_metadata::{LabelSet, ModelMetadata};

pub const MODEL_DIR_NAME: &str = "model";
pub const LABELS_FILE_NAME: &str = "labels.json";
pub const INFO_FILE_NAME: &str = "info.json";

/// 読み込んだ永続化モデル一式
pub struct PersistedModel {
    pub model: Box<dyn ClassifierModel>,
    pub labels: LabelSet,
    pub metadata: ModelMetadata,
}

/// 永続化先
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join(MODEL_DIR_NAME)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.root.join(LABELS_FILE_NAME)
    }

    pub fn info_path(&self) -> PathBuf {
        self.root.join(INFO_FILE_NAME)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        self.root.with_file_name(format!("{}.{}", name, suffix))
    }

    fn staging_dir(&self) -> PathBuf {
        self.sibling("staging")
    }

    pub(crate) fn previous_dir(&self) -> PathBuf {
        self.sibling("previous")
    }

    /// モデル・ラベル・メタデータが揃っているか
    pub fn exists(&self) -> bool {
        self.model_dir().is_dir() && self.labels_path().is_file() && self.info_path().is_file()
    }

    /// 差し替え途中で中断された場合に退避ディレクトリを戻す
    pub fn recover_interrupted_swap(&self) -> Result<()> {
        let previous = self.previous_dir();
        if !self.root.exists() && previous.is_dir() {
            warn!(
                "前回の保存が中断されています。退避したモデルを復元します: {}",
                previous.display()
            );
            fs::rename(&previous, &self.root)
                .with_context(|| format!("Failed to restore {:?}", previous))?;
        }
        Ok(())
    }

    /// モデルとメタデータを1組で保存
    pub fn persist(
        &self,
        model: &dyn ClassifierModel,
        labels: &LabelSet,
        metadata: &ModelMetadata,
    ) -> Result<()> {
        if metadata.labels != labels.labels() {
            bail!("metadata labels do not match the label set");
        }

        let staging = self.staging_dir();
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("Failed to clear staging directory: {:?}", staging))?;
        }
        let staging_model = staging.join(MODEL_DIR_NAME);
        fs::create_dir_all(&staging_model)
            .with_context(|| format!("Failed to create staging directory: {:?}", staging_model))?;

        debug!("モデルを一時ディレクトリに保存します: {}", staging.display());
        model.save(&staging_model).context("Failed to save model files")?;
        fs::write(staging.join(LABELS_FILE_NAME), labels.to_json_string()?)
            .context("Failed to write labels.json")?;
        fs::write(staging.join(INFO_FILE_NAME), metadata.to_json_string()?)
            .context("Failed to write info.json")?;

        self.swap_in(&staging)?;
        info!("モデルを保存しました: {}", self.root.display());
        Ok(())
    }

    fn swap_in(&self, staging: &Path) -> Result<()> {
        let previous = self.previous_dir();
        if previous.exists() {
            fs::remove_dir_all(&previous)
                .with_context(|| format!("Failed to remove {:?}", previous))?;
        }
        if let Some(parent) = self.root.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
            }
        }

        let had_previous = self.root.exists();
        if had_previous {
            fs::rename(&self.root, &previous)
                .with_context(|| format!("Failed to move aside {:?}", self.root))?;
        }
        if let Err(e) = fs::rename(staging, &self.root) {
            if had_previous {
                fs::rename(&previous, &self.root).ok();
            }
            return Err(e).with_context(|| format!("Failed to move {:?} into place", staging));
        }
        if had_previous {
            fs::remove_dir_all(&previous).ok();
        }
        Ok(())
    }

    pub fn read_labels(&self) -> Result<LabelSet> {
        let path = self.labels_path();
        let json = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        LabelSet::from_json_string(&json)
    }

    pub fn read_metadata(&self) -> Result<ModelMetadata> {
        let path = self.info_path();
        let json = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        ModelMetadata::from_json_string(&json)
    }

    /// モデルをメタデータと共に読み込む
    pub fn load(&self, engine: &dyn ClassifierEngine) -> Result<PersistedModel> {
        let labels = self.read_labels()?;
        let metadata = self.read_metadata()?;

        if metadata.labels != labels.labels() {
            bail!(
                "labels.json ({}) and info.json ({}) disagree",
                labels.labels().join(", "),
                metadata.labels.join(", ")
            );
        }
        if metadata.architecture.num_classes != labels.len() {
            bail!(
                "architecture has {} outputs but {} labels are stored",
                metadata.architecture.num_classes,
                labels.len()
            );
        }

        let model = engine
            .load(&self.model_dir(), &metadata.architecture)
            .context("Failed to load model files")?;

        Ok(PersistedModel { model, labels, metadata })
    }
}
