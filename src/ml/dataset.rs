//! 学習データセットの読み込み
//!
//! ディレクトリモード（`root/<label>/<画像>`）とアップロードモード
//! （`<label>_xxx.png` 形式のファイル名）の2通りで同じ `Dataset` を作る。
//! 壊れた画像はスキップして数だけ記録し、0件になった時だけエラーにする。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{LifecycleError, Result};
use crate::ml::preprocess::{ImagePreprocessor, ImageTensor};
use crate::model::LabelSet;

/// 対象とする画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

/// アップロードファイル名のラベル区切り文字
pub const LABEL_SEPARATOR: char = '_';

/// アップロードされた画像
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// データセットの取得元
#[derive(Debug, Clone)]
pub enum DatasetSource {
    /// `root/<label>/<画像>` 形式のディレクトリ
    Directory(PathBuf),
    /// アップロードされたファイル群
    Uploads(Vec<UploadedFile>),
}

/// 1サンプル分の入力
///
/// どちらのモードも最終的にこの形に揃えてから前処理する。
#[derive(Debug)]
pub enum SampleSource {
    DirectoryEntry { path: PathBuf, label: String },
    UploadedBlob { filename: String, bytes: Vec<u8> },
}

impl SampleSource {
    fn describe(&self) -> String {
        match self {
            SampleSource::DirectoryEntry { path, .. } => path.display().to_string(),
            SampleSource::UploadedBlob { filename, .. } => filename.clone(),
        }
    }
}

/// ラベル付きサンプル（学習1回分だけ保持される）
#[derive(Debug, Clone)]
pub struct LabeledSample {
    pub tensor: ImageTensor,
    pub label: String,
}

/// 読み込み済みデータセット（挿入順を保持）
#[derive(Debug, Default)]
pub struct Dataset {
    samples: Vec<LabeledSample>,
    skipped: usize,
}

impl Dataset {
    pub fn new(samples: Vec<LabeledSample>, skipped: usize) -> Self {
        Self { samples, skipped }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// スキップした画像・ディレクトリの数
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    /// 出現順のラベル集合
    pub fn label_set(&self) -> LabelSet {
        LabelSet::from_labels(self.samples.iter().map(|s| s.label.as_str()))
    }

    /// クラスごとの枚数（出現順）
    pub fn class_counts(&self) -> Vec<(String, usize)> {
        let labels = self.label_set();
        let mut counts = vec![0usize; labels.len()];
        for sample in &self.samples {
            if let Some(idx) = labels.index_of(&sample.label) {
                counts[idx] += 1;
            }
        }
        labels.labels().iter().cloned().zip(counts).collect()
    }

    pub fn into_samples(self) -> Vec<LabeledSample> {
        self.samples
    }
}

/// データセットローダー
#[derive(Debug, Clone, Default)]
pub struct DatasetLoader {
    preprocessor: ImagePreprocessor,
    /// 揃っていることが期待されるラベル（不足時は警告のみ）
    expected_labels: Vec<String>,
}

impl DatasetLoader {
    pub fn new(expected_labels: Vec<String>) -> Self {
        Self {
            preprocessor: ImagePreprocessor,
            expected_labels: expected_labels.into_iter().map(|l| l.to_lowercase()).collect(),
        }
    }

    pub fn load(&self, source: DatasetSource) -> Result<Dataset> {
        match source {
            DatasetSource::Directory(root) => self.from_directory(&root),
            DatasetSource::Uploads(files) => self.from_uploads(files),
        }
    }

    /// ディレクトリから読み込む
    ///
    /// 直下のサブディレクトリ名（小文字化）がラベルになる。
    /// 名前順に走査するので、ラベルの出現順も名前順になる。
    pub fn from_directory(&self, root: &Path) -> Result<Dataset> {
        info!("データセットを読み込みます: {}", root.display());

        if !root.is_dir() {
            return Err(LifecycleError::DatasetUnavailable(format!(
                "dataset root does not exist: {}",
                root.display()
            )));
        }

        let mut entries = Vec::new();
        let mut skipped = 0usize;

        for class_entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let class_entry = match class_entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("ディレクトリを読み込めません: {}", e);
                    skipped += 1;
                    continue;
                }
            };
            if !class_entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = class_entry.file_name().to_str() else {
                warn!("ディレクトリ名を解釈できません: {:?}", class_entry.path());
                skipped += 1;
                continue;
            };
            let label = name.to_lowercase();
            debug!("クラスディレクトリ: {}", label);

            for file_entry in WalkDir::new(class_entry.path())
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let file_entry = match file_entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("ファイルを読み込めません: {}", e);
                        skipped += 1;
                        continue;
                    }
                };
                let path = file_entry.path();
                if file_entry.file_type().is_dir() {
                    warn!("入れ子のディレクトリはスキップします: {}", path.display());
                    skipped += 1;
                    continue;
                }
                if has_image_extension(path) {
                    entries.push(SampleSource::DirectoryEntry {
                        path: path.to_path_buf(),
                        label: label.clone(),
                    });
                }
            }
        }

        let dataset = self.ingest(entries, skipped);
        self.finish(dataset, &root.display().to_string())
    }

    /// アップロードされたファイルから読み込む
    pub fn from_uploads(&self, files: Vec<UploadedFile>) -> Result<Dataset> {
        info!("アップロードされた画像を処理します: {} 件", files.len());
        let entries = files
            .into_iter()
            .map(|f| SampleSource::UploadedBlob { filename: f.filename, bytes: f.bytes });
        let dataset = self.ingest(entries, 0);
        self.finish(dataset, "uploaded files")
    }

    /// 各サンプルを前処理してデータセットに積む
    fn ingest(&self, entries: impl IntoIterator<Item = SampleSource>, mut skipped: usize) -> Dataset {
        let mut samples = Vec::new();

        for entry in entries {
            let description = entry.describe();
            let prepared = match entry {
                SampleSource::DirectoryEntry { path, label } => {
                    self.preprocessor.prepare_file(&path).map(|t| (t, label))
                }
                SampleSource::UploadedBlob { filename, bytes } => match label_from_filename(&filename) {
                    Some(label) => self.preprocessor.prepare(&bytes).map(|t| (t, label)),
                    None => Err(LifecycleError::UnsupportedImage(format!(
                        "cannot derive a label from file name '{}'",
                        filename
                    ))),
                },
            };

            match prepared {
                Ok((tensor, label)) => samples.push(LabeledSample { tensor, label }),
                Err(e) => {
                    warn!("画像をスキップします {}: {}", description, e);
                    skipped += 1;
                }
            }
        }

        Dataset::new(samples, skipped)
    }

    fn finish(&self, dataset: Dataset, origin: &str) -> Result<Dataset> {
        if dataset.is_empty() {
            return Err(LifecycleError::EmptyDataset(format!(
                "no decodable images in {} ({} skipped)",
                origin,
                dataset.skipped()
            )));
        }

        let counts = dataset.class_counts();
        info!(
            "データセット読み込み完了: {} 枚, {} クラス, スキップ {} 件",
            dataset.len(),
            counts.len(),
            dataset.skipped()
        );
        for (label, count) in &counts {
            info!("  {}: {} 枚", label, count);
        }

        let present: HashMap<&str, usize> = counts.iter().map(|(l, c)| (l.as_str(), *c)).collect();
        for expected in &self.expected_labels {
            if !present.contains_key(expected.as_str()) {
                warn!("期待されるクラスの画像がありません: {}", expected);
            }
        }

        Ok(dataset)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// ファイル名からラベルを取り出す
///
/// 拡張子を除いた名前の、最初の `_` より前の部分を小文字化したもの。
/// `Apple_01.png` → `apple`、`pear.jpg` → `pear`
pub fn label_from_filename(filename: &str) -> Option<String> {
    let name = Path::new(filename).file_name()?.to_str()?;
    let stem = match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    };
    let label = stem.split(LABEL_SEPARATOR).next()?.trim().to_lowercase();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}
