//! モデルのライフサイクル管理
//!
//! 状態・モデル・ラベルは必ずここでまとめて切り替える。
//! 学習と読み込みは同時に1つだけ（シングルフライト）。ガードの確認と
//! `Training`/`Loading` への遷移は同じロック区間内で行い、ロックは
//! awaitをまたいで保持しない。

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::error::{LifecycleError, Result};
use crate::ml::{
    ArchitectureDescriptor, ClassifierEngine, ClassifierModel, CompileSpec, Dataset, DatasetLoader,
    DatasetSource, FitConfig, ImageTensor,
};
use crate::model::{AppConfig, ArtifactExporter, ArtifactStore, LabelSet, ModelMetadata};
use crate::types::{InitOutcome, ModelState, StatusSnapshot, TrainingReport};

/// ライフサイクルの設定値
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub dataset_root: PathBuf,
    pub artifact_dir: PathBuf,
    pub expected_labels: Vec<String>,
    pub fit: FitConfig,
    pub learning_rate: f64,
}

impl LifecycleSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dataset_root: config.paths.dataset_root.clone(),
            artifact_dir: config.paths.artifact_dir.clone(),
            expected_labels: config.dataset.expected_labels.clone(),
            fit: config.training.fit_config(),
            learning_rate: config.training.learning_rate,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 推論に使うモデル一式
///
/// 差し替えは `Arc` ごと行い、中身は書き換えない。
pub struct ActiveModel {
    pub model: Box<dyn ClassifierModel>,
    pub labels: LabelSet,
    pub metadata: ModelMetadata,
}

struct Lifecycle {
    state: ModelState,
    active: Option<Arc<ActiveModel>>,
}

enum Entry {
    Started,
    AlreadyReady,
}

struct Inner {
    engine: Arc<dyn ClassifierEngine>,
    store: ArtifactStore,
    loader: DatasetLoader,
    settings: LifecycleSettings,
    lifecycle: Mutex<Lifecycle>,
}

/// モデルライフサイクルマネージャー
///
/// プロセスに1つ作り、クローンして各利用者に渡す。
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<Inner>,
}

impl ModelLifecycleManager {
    /// 前回の保存が入れ替えの途中で止まっていれば、ここで元に戻す
    pub fn new(engine: Arc<dyn ClassifierEngine>, settings: LifecycleSettings) -> Self {
        let store = ArtifactStore::new(settings.artifact_dir.clone());
        if let Err(e) = store.recover_interrupted_swap() {
            warn!("退避したモデルの復元に失敗しました: {:#}", e);
        }
        let loader = DatasetLoader::new(settings.expected_labels.clone());
        Self {
            inner: Arc::new(Inner {
                engine,
                store,
                loader,
                settings,
                lifecycle: Mutex::new(Lifecycle {
                    state: ModelState::Uninitialized,
                    active: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// 保存済みモデルのエクスポーター
    pub fn exporter(&self) -> ArtifactExporter {
        ArtifactExporter::new(self.inner.store.clone())
    }

    pub fn state(&self) -> ModelState {
        self.inner.lock().state
    }

    /// 状態・ラベル・クラス数
    pub fn status(&self) -> StatusSnapshot {
        let lifecycle = self.inner.lock();
        let labels = lifecycle
            .active
            .as_ref()
            .map(|a| a.labels.labels().to_vec())
            .unwrap_or_default();
        StatusSnapshot {
            state: lifecycle.state,
            ready: lifecycle.state == ModelState::Ready,
            class_count: labels.len(),
            labels,
        }
    }

    /// Ready状態のモデルを取り出す
    pub fn ready_model(&self) -> Result<Arc<ActiveModel>> {
        let lifecycle = self.inner.lock();
        match (&lifecycle.state, &lifecycle.active) {
            (ModelState::Ready, Some(active)) => Ok(Arc::clone(active)),
            _ => Err(LifecycleError::ModelUnavailable),
        }
    }

    /// 起動時の初期化
    ///
    /// 1. 既にReadyなら何もしない
    /// 2. 保存済みモデルがあれば読み込む
    /// 3. 無ければデータセットから学習する
    /// 4. データセットも無ければ `NoModelAvailable`（状態はそのまま）
    ///
    /// 読み込み・学習の開始時にもReadyかどうかを確認し直す。データセットを
    /// 読んでいる間に別の学習が終わっていれば、それを上書きしない。
    pub async fn initialize(&self) -> Result<InitOutcome> {
        {
            let lifecycle = self.inner.lock();
            if lifecycle.state == ModelState::Ready {
                info!("モデルは既に準備済みです");
                return Ok(InitOutcome::AlreadyReady);
            }
            if lifecycle.state.is_busy() {
                return Err(LifecycleError::AlreadyInProgress);
            }
        }

        match self.load_if_not_ready().await {
            Ok(Some(labels)) => return Ok(InitOutcome::Loaded { labels }),
            Ok(None) => return Ok(InitOutcome::AlreadyReady),
            Err(LifecycleError::ArtifactNotFound(path)) => {
                info!("保存済みモデルがありません ({})。データセットから学習します", path);
            }
            // Failed からは読み込みに戻れない。学習でやり直す
            Err(LifecycleError::ModelUnavailable) => {
                info!("前回の読み込み・学習が失敗しています。データセットから学習します");
            }
            Err(e) => return Err(e),
        }

        let root = self.inner.settings.dataset_root.clone();
        let dataset = match self.ingest(DatasetSource::Directory(root)).await {
            Ok(dataset) => dataset,
            Err(e @ (LifecycleError::DatasetUnavailable(_) | LifecycleError::EmptyDataset(_))) => {
                warn!("利用できるモデルがありません: {}", e);
                return Ok(InitOutcome::NoModelAvailable { reason: e.to_string() });
            }
            Err(e) => return Err(e),
        };

        match self.train_if_not_ready(dataset).await? {
            Some(report) => Ok(InitOutcome::Trained(report)),
            None => {
                info!("データセットの読み込み中に別の学習が完了しました");
                Ok(InitOutcome::AlreadyReady)
            }
        }
    }

    /// 保存済みモデルを読み込む（学習はしない）
    ///
    /// 成功すればラベルを返す。既にReadyなら読み込み直さず現在のラベルを返す。
    /// 保存済みモデルが無ければ状態を変えずに `ArtifactNotFound`、
    /// 壊れていれば `Failed` にして `PersistenceFailure`。
    /// `Failed` からは `ModelUnavailable`（再学習でのみ抜けられる）。
    pub async fn load_persisted(&self) -> Result<Vec<String>> {
        match self.load_if_not_ready().await? {
            Some(labels) => Ok(labels),
            None => Ok(self.status().labels),
        }
    }

    /// 読み込みを始めたら `Some(labels)`、既にReadyなら `None`
    async fn load_if_not_ready(&self) -> Result<Option<Vec<String>>> {
        if self.state() == ModelState::Ready {
            return Ok(None);
        }
        // ファイルの確認はロックの外で行う
        if !self.inner.store.exists() {
            return Err(LifecycleError::ArtifactNotFound(
                self.inner.store.root().display().to_string(),
            ));
        }
        if let Entry::AlreadyReady = self.inner.begin(ModelState::Loading, true)? {
            return Ok(None);
        }

        let inner = Arc::clone(&self.inner);
        let job = tokio::spawn(async move {
            let worker = Arc::clone(&inner);
            let result = tokio::task::spawn_blocking(move || worker.load_artifact()).await;
            let result = match result {
                Ok(result) => result,
                Err(e) => Err(LifecycleError::PersistenceFailure(anyhow::anyhow!(
                    "loading task aborted: {}",
                    e
                ))),
            };
            match result {
                Ok(active) => Ok(inner.finish_ready(active)),
                Err(e) => Err(inner.finish_failed(e)),
            }
        });

        match job.await {
            Ok(result) => result.map(|active| Some(active.labels.labels().to_vec())),
            Err(e) => Err(LifecycleError::PersistenceFailure(anyhow::anyhow!(
                "loading task aborted: {}",
                e
            ))),
        }
    }

    /// データセットを読み込んでから学習する
    ///
    /// 読み込みはガードの前に行うので、`EmptyDataset` などでは状態は変わらない。
    pub async fn train_from(&self, source: DatasetSource) -> Result<TrainingReport> {
        if self.state().is_busy() {
            return Err(LifecycleError::AlreadyInProgress);
        }
        let dataset = self.ingest(source).await?;
        self.train(dataset).await
    }

    /// 学習して保存し、Readyにする
    ///
    /// 学習中・読み込み中なら待たずに `AlreadyInProgress` を返す。
    /// 学習は呼び出し側のfutureが破棄されても最後まで走る。
    pub async fn train(&self, dataset: Dataset) -> Result<TrainingReport> {
        self.inner.begin(ModelState::Training, false)?;
        self.run_training_job(dataset).await
    }

    /// Readyでなければ学習する。Readyなら何もせず `None`
    async fn train_if_not_ready(&self, dataset: Dataset) -> Result<Option<TrainingReport>> {
        match self.inner.begin(ModelState::Training, true)? {
            Entry::AlreadyReady => Ok(None),
            Entry::Started => self.run_training_job(dataset).await.map(Some),
        }
    }

    /// `Training` に遷移済みの状態から学習を走らせる
    async fn run_training_job(&self, dataset: Dataset) -> Result<TrainingReport> {
        let inner = Arc::clone(&self.inner);
        let job = tokio::spawn(async move {
            let worker = Arc::clone(&inner);
            let result = tokio::task::spawn_blocking(move || worker.run_training(dataset)).await;
            let result = match result {
                Ok(result) => result,
                Err(e) => Err(LifecycleError::TrainingFailure(anyhow::anyhow!(
                    "training task aborted: {}",
                    e
                ))),
            };
            match result {
                Ok((active, report)) => {
                    inner.finish_ready(active);
                    Ok(report)
                }
                Err(e) => Err(inner.finish_failed(e)),
            }
        });

        match job.await {
            Ok(result) => result,
            Err(e) => Err(LifecycleError::TrainingFailure(anyhow::anyhow!(
                "training task aborted: {}",
                e
            ))),
        }
    }

    async fn ingest(&self, source: DatasetSource) -> Result<Dataset> {
        let loader = self.inner.loader.clone();
        tokio::task::spawn_blocking(move || loader.load(source))
            .await
            .map_err(|e| {
                LifecycleError::DatasetUnavailable(format!("dataset ingestion aborted: {}", e))
            })?
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        // 保持中にpanicしても状態そのものは整合している
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// ガードの確認と `Loading`/`Training` への遷移を1つのロック区間で行う
    ///
    /// `skip_if_ready` ならReadyのときに遷移せず `Entry::AlreadyReady` を返す。
    fn begin(&self, next: ModelState, skip_if_ready: bool) -> Result<Entry> {
        let mut lifecycle = self.lock();
        if lifecycle.state.is_busy() {
            warn!("{} の実行中です", lifecycle.state);
            return Err(LifecycleError::AlreadyInProgress);
        }
        if skip_if_ready && lifecycle.state == ModelState::Ready {
            return Ok(Entry::AlreadyReady);
        }
        if !lifecycle.state.can_transition_to(next) {
            return Err(LifecycleError::ModelUnavailable);
        }
        self.transition(&mut lifecycle, next);
        Ok(Entry::Started)
    }

    fn transition(&self, lifecycle: &mut Lifecycle, next: ModelState) {
        debug_assert!(
            lifecycle.state.can_transition_to(next),
            "invalid transition {} -> {}",
            lifecycle.state,
            next
        );
        info!("状態遷移: {} -> {}", lifecycle.state, next);
        lifecycle.state = next;
    }

    /// Loading/Training を成功で終わらせ、モデルを差し替える
    fn finish_ready(&self, active: ActiveModel) -> Arc<ActiveModel> {
        let active = Arc::new(active);
        let mut lifecycle = self.lock();
        lifecycle.active = Some(Arc::clone(&active));
        self.transition(&mut lifecycle, ModelState::Ready);
        active
    }

    /// Loading/Training を失敗で終わらせる（直前のモデルは保持するが使わない）
    fn finish_failed(&self, error: LifecycleError) -> LifecycleError {
        error!("{}", error);
        let mut lifecycle = self.lock();
        self.transition(&mut lifecycle, ModelState::Failed);
        error
    }

    fn load_artifact(&self) -> Result<ActiveModel> {
        info!("保存済みモデルを読み込みます: {}", self.store.root().display());
        let persisted = self
            .store
            .load(self.engine.as_ref())
            .map_err(LifecycleError::PersistenceFailure)?;
        info!(
            "モデルを読み込みました: {} クラス ({})",
            persisted.labels.len(),
            persisted.labels.labels().join(", ")
        );
        Ok(ActiveModel {
            model: persisted.model,
            labels: persisted.labels,
            metadata: persisted.metadata,
        })
    }

    fn run_training(&self, dataset: Dataset) -> Result<(ActiveModel, TrainingReport)> {
        let total_images = dataset.len();
        let skipped_images = dataset.skipped();
        let labels = dataset.label_set();
        let fit = self.settings.fit;

        let mut inputs: Vec<ImageTensor> = Vec::with_capacity(total_images);
        let mut targets = Vec::with_capacity(total_images);
        for sample in dataset.into_samples() {
            let index = labels.index_of(&sample.label).ok_or_else(|| {
                LifecycleError::TrainingFailure(anyhow::anyhow!("unknown label {}", sample.label))
            })?;
            inputs.push(sample.tensor);
            targets.push(index);
        }

        info!(
            "学習を開始します: {} 枚, {} クラス, {} エポック",
            total_images,
            labels.len(),
            fit.epochs
        );

        let architecture = ArchitectureDescriptor::standard(labels.len());
        let mut model = self
            .engine
            .build(&architecture)
            .map_err(LifecycleError::TrainingFailure)?;
        model
            .compile(&CompileSpec::adam(self.settings.learning_rate))
            .map_err(LifecycleError::TrainingFailure)?;

        let metrics_history = model
            .fit(&inputs, &targets, &fit, &mut |m| {
                info!(
                    "Epoch {}/{} - loss: {:.4}, accuracy: {:.4}, val_loss: {}, val_accuracy: {}",
                    m.epoch,
                    fit.epochs,
                    m.loss,
                    m.accuracy,
                    format_metric(m.val_loss),
                    format_metric(m.val_accuracy)
                );
            })
            .map_err(LifecycleError::TrainingFailure)?;
        drop(inputs);

        let validation_accuracy = metrics_history.last().and_then(|m| m.val_accuracy);
        let metadata = ModelMetadata::new(
            &labels,
            total_images,
            metrics_history.len(),
            architecture,
            validation_accuracy,
        );
        self.store
            .persist(model.as_ref(), &labels, &metadata)
            .map_err(LifecycleError::TrainingFailure)?;

        let report = TrainingReport {
            labels: labels.labels().to_vec(),
            total_images,
            skipped_images,
            metrics_history,
            validation_accuracy,
            trained_at: metadata.trained_at,
        };
        info!("学習が完了しました: {}", report.labels.join(", "));

        Ok((ActiveModel { model, labels, metadata }, report))
    }
}

fn format_metric(value: Option<f64>) -> String {
    value.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::preprocess::fixtures::png_bytes;
    use crate::ml::testing::{FitGate, StubEngine};
    use crate::ml::{InferenceService, UploadedFile};
    use std::path::Path;
    use std::time::Duration;

    fn settings(root: &Path) -> LifecycleSettings {
        LifecycleSettings {
            dataset_root: root.join("dataset"),
            artifact_dir: root.join("models").join("classifier"),
            expected_labels: Vec::new(),
            fit: FitConfig { epochs: 3, batch_size: 4, validation_split: 0.2, seed: 42 },
            learning_rate: 1e-3,
        }
    }

    fn write_dataset(root: &Path, classes: &[(&str, usize, [u8; 3])]) {
        for (label, count, color) in classes {
            let dir = root.join(label);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                std::fs::write(dir.join(format!("{}.png", i)), png_bytes(8, 8, *color)).unwrap();
            }
        }
    }

    fn manager(root: &Path, engine: StubEngine) -> ModelLifecycleManager {
        ModelLifecycleManager::new(Arc::new(engine), settings(root))
    }

    #[tokio::test]
    async fn test_train_from_directory_reaches_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        write_dataset(
            &mgr.settings().dataset_root,
            &[("apple", 3, [200, 20, 20]), ("banana", 2, [230, 230, 40])],
        );

        let source = DatasetSource::Directory(mgr.settings().dataset_root.clone());
        let report = mgr.train_from(source).await.unwrap();
        assert_eq!(report.labels, vec!["apple", "banana"]);
        assert_eq!(report.total_images, 5);
        assert_eq!(report.metrics_history.len(), 3);

        let status = mgr.status();
        assert_eq!(status.state, ModelState::Ready);
        assert!(status.ready);
        assert_eq!(status.labels, vec!["apple", "banana"]);
        assert_eq!(status.class_count, 2);
        assert!(mgr.store().exists());
    }

    #[tokio::test]
    async fn test_predict_before_ready_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        let service = InferenceService::new(mgr.clone());

        let err = service.predict(png_bytes(8, 8, [0, 0, 0])).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ModelUnavailable));
    }

    #[tokio::test]
    async fn test_prediction_after_training() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        let files = vec![
            UploadedFile { filename: "dark_1.png".into(), bytes: png_bytes(8, 8, [10, 10, 10]) },
            UploadedFile { filename: "dark_2.png".into(), bytes: png_bytes(8, 8, [20, 20, 20]) },
            UploadedFile { filename: "light_1.png".into(), bytes: png_bytes(8, 8, [240, 240, 240]) },
        ];
        mgr.train_from(DatasetSource::Uploads(files)).await.unwrap();

        let service = InferenceService::new(mgr.clone());
        let prediction = service.predict(png_bytes(8, 8, [250, 250, 250])).await.unwrap();
        assert_eq!(prediction.label, "light");
        assert!((0.0..=1.0).contains(&prediction.probability));

        let labels: Vec<&str> = prediction.distribution.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["dark", "light"]);
        let total: f32 = prediction.distribution.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_empty_dataset_leaves_state_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());

        let err = mgr.train_from(DatasetSource::Uploads(Vec::new())).await.unwrap_err();
        assert!(matches!(err, LifecycleError::EmptyDataset(_)));
        assert_eq!(mgr.state(), ModelState::Uninitialized);
    }

    #[tokio::test]
    async fn test_concurrent_train_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (gate, entered, release) = FitGate::new();
        let mgr = manager(tmp.path(), StubEngine::gated(gate));
        write_dataset(&mgr.settings().dataset_root, &[("apple", 2, [200, 0, 0])]);

        let first = {
            let mgr = mgr.clone();
            let root = mgr.settings().dataset_root.clone();
            tokio::spawn(async move { mgr.train_from(DatasetSource::Directory(root)).await })
        };

        // 1回目がfit()に入るまで待つ
        tokio::task::spawn_blocking(move || entered.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mgr.state(), ModelState::Training);

        let root = mgr.settings().dataset_root.clone();
        let err = mgr.train_from(DatasetSource::Directory(root)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInProgress));
        let err = mgr.initialize().await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInProgress));
        assert!(matches!(mgr.ready_model(), Err(LifecycleError::ModelUnavailable)));

        release.send(()).unwrap();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.labels, vec!["apple"]);
        assert_eq!(mgr.state(), ModelState::Ready);
    }

    #[tokio::test]
    async fn test_training_continues_when_caller_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let (gate, entered, release) = FitGate::new();
        let mgr = manager(tmp.path(), StubEngine::gated(gate));
        write_dataset(&mgr.settings().dataset_root, &[("pear", 1, [0, 200, 0])]);

        let caller = {
            let mgr = mgr.clone();
            let root = mgr.settings().dataset_root.clone();
            tokio::spawn(async move { mgr.train_from(DatasetSource::Directory(root)).await })
        };
        tokio::task::spawn_blocking(move || entered.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .unwrap();
        caller.abort();
        release.send(()).unwrap();

        for _ in 0..200 {
            if mgr.state() == ModelState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mgr.state(), ModelState::Ready);
    }

    #[tokio::test]
    async fn test_failed_training_then_retry() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(&tmp.path().join("dataset"), &[("apple", 2, [200, 0, 0])]);

        let engine = StubEngine::failing();
        let mgr = manager(tmp.path(), engine.clone());
        let root = mgr.settings().dataset_root.clone();
        let err = mgr.train_from(DatasetSource::Directory(root.clone())).await.unwrap_err();
        assert!(matches!(err, LifecycleError::TrainingFailure(_)));
        assert_eq!(mgr.state(), ModelState::Failed);
        assert!(!mgr.store().exists());
        assert!(matches!(mgr.ready_model(), Err(LifecycleError::ModelUnavailable)));

        // Failed -> Training は許可される
        engine.set_failing(false);
        mgr.train_from(DatasetSource::Directory(root)).await.unwrap();
        assert_eq!(mgr.state(), ModelState::Ready);
    }

    #[tokio::test]
    async fn test_retrain_replaces_labels() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        let first = vec![UploadedFile { filename: "apple_1.png".into(), bytes: png_bytes(4, 4, [1, 1, 1]) }];
        mgr.train_from(DatasetSource::Uploads(first)).await.unwrap();

        let second = vec![
            UploadedFile { filename: "grape_1.png".into(), bytes: png_bytes(4, 4, [9, 9, 9]) },
            UploadedFile { filename: "pear_1.png".into(), bytes: png_bytes(4, 4, [99, 99, 99]) },
        ];
        mgr.train_from(DatasetSource::Uploads(second)).await.unwrap();

        assert_eq!(mgr.status().labels, vec!["grape", "pear"]);
        assert_eq!(mgr.store().read_labels().unwrap().labels(), &["grape", "pear"]);
    }

    #[tokio::test]
    async fn test_initialize_trains_then_restart_loads() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(
            &tmp.path().join("dataset"),
            &[("apple", 3, [200, 20, 20]), ("banana", 2, [230, 230, 40])],
        );

        let mgr = manager(tmp.path(), StubEngine::default());
        let outcome = mgr.initialize().await.unwrap();
        assert!(matches!(outcome, InitOutcome::Trained(ref r) if r.total_images == 5));
        assert!(matches!(mgr.initialize().await.unwrap(), InitOutcome::AlreadyReady));

        // データセットを消しても、再起動後は保存済みモデルを読み込む
        std::fs::remove_dir_all(tmp.path().join("dataset")).unwrap();
        let restarted = manager(tmp.path(), StubEngine::default());
        let outcome = restarted.initialize().await.unwrap();
        match outcome {
            InitOutcome::Loaded { labels } => assert_eq!(labels, vec!["apple", "banana"]),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let persisted = restarted.store().read_labels().unwrap();
        assert_eq!(restarted.status().labels, persisted.labels());
        assert!(restarted.status().ready);
    }

    #[tokio::test]
    async fn test_initialize_without_model_or_dataset() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());

        let outcome = mgr.initialize().await.unwrap();
        assert!(matches!(outcome, InitOutcome::NoModelAvailable { .. }));
        assert_eq!(mgr.state(), ModelState::Uninitialized);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_fails_loading() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        std::fs::create_dir_all(mgr.store().model_dir()).unwrap();
        std::fs::write(mgr.store().labels_path(), "{not json").unwrap();
        std::fs::write(mgr.store().info_path(), "{}").unwrap();

        let err = mgr.load_persisted().await.unwrap_err();
        assert!(matches!(err, LifecycleError::PersistenceFailure(_)));
        assert_eq!(mgr.state(), ModelState::Failed);
    }

    #[tokio::test]
    async fn test_load_persisted_without_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        let err = mgr.load_persisted().await.unwrap_err();
        assert!(matches!(err, LifecycleError::ArtifactNotFound(_)));
        assert_eq!(mgr.state(), ModelState::Uninitialized);
    }

    fn upload(filename: &str, color: [u8; 3]) -> UploadedFile {
        UploadedFile { filename: filename.into(), bytes: png_bytes(8, 8, color) }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initialize_does_not_overwrite_newer_training() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        write_dataset(&mgr.settings().dataset_root, &[("apple", 150, [200, 20, 20])]);

        let init = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.initialize().await })
        };
        let uploaded = mgr
            .train_from(DatasetSource::Uploads(vec![upload("upload_1.png", [9, 9, 9])]))
            .await;
        let outcome = init.await.unwrap();

        match outcome {
            Ok(_) | Err(LifecycleError::AlreadyInProgress) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
        if uploaded.is_ok() {
            // アップロードでの学習が成功したなら、それが最後に残る
            assert_eq!(mgr.state(), ModelState::Ready);
            assert_eq!(mgr.status().labels, vec!["upload"]);
            assert_eq!(mgr.store().read_labels().unwrap().labels(), &["upload"]);
        }
    }

    #[tokio::test]
    async fn test_train_if_not_ready_skips_ready_model() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        mgr.train_from(DatasetSource::Uploads(vec![upload("upload_1.png", [9, 9, 9])]))
            .await
            .unwrap();

        write_dataset(&mgr.settings().dataset_root, &[("apple", 2, [200, 20, 20])]);
        let root = mgr.settings().dataset_root.clone();
        let dataset = mgr.ingest(DatasetSource::Directory(root)).await.unwrap();

        assert!(mgr.train_if_not_ready(dataset).await.unwrap().is_none());
        assert_eq!(mgr.state(), ModelState::Ready);
        assert_eq!(mgr.status().labels, vec!["upload"]);
        assert_eq!(mgr.store().read_labels().unwrap().labels(), &["upload"]);
    }

    #[tokio::test]
    async fn test_load_persisted_when_ready_keeps_serving() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        mgr.train_from(DatasetSource::Uploads(vec![upload("apple_1.png", [1, 2, 3])]))
            .await
            .unwrap();

        // 読み込み直さないので、ファイルが消えていても現在のモデルのまま
        std::fs::remove_dir_all(mgr.store().root()).unwrap();
        assert_eq!(mgr.load_persisted().await.unwrap(), vec!["apple"]);
        assert_eq!(mgr.state(), ModelState::Ready);
        assert!(mgr.ready_model().is_ok());
    }

    #[tokio::test]
    async fn test_failed_retrain_keeps_previous_labels_but_stops_serving() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = StubEngine::default();
        let mgr = manager(tmp.path(), engine.clone());
        mgr.train_from(DatasetSource::Uploads(vec![
            upload("apple_1.png", [20, 20, 20]),
            upload("banana_1.png", [240, 240, 240]),
        ]))
        .await
        .unwrap();

        engine.set_failing(true);
        let err = mgr
            .train_from(DatasetSource::Uploads(vec![upload("grape_1.png", [90, 0, 90])]))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::TrainingFailure(_)));

        let status = mgr.status();
        assert_eq!(status.state, ModelState::Failed);
        assert!(!status.ready);
        assert_eq!(status.labels, vec!["apple", "banana"]);
        assert_eq!(status.class_count, 2);
        assert!(matches!(mgr.ready_model(), Err(LifecycleError::ModelUnavailable)));

        let service = InferenceService::new(mgr.clone());
        let err = service.predict(png_bytes(8, 8, [20, 20, 20])).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ModelUnavailable));

        // 保存済みの方も元のまま。Failed からは読み込みに戻れない
        assert_eq!(mgr.store().read_labels().unwrap().labels(), &["apple", "banana"]);
        let err = mgr.load_persisted().await.unwrap_err();
        assert!(matches!(err, LifecycleError::ModelUnavailable));
        assert_eq!(mgr.state(), ModelState::Failed);
    }

    #[tokio::test]
    async fn test_empty_batch_keeps_ready_model() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        mgr.train_from(DatasetSource::Uploads(vec![
            upload("dark_1.png", [10, 10, 10]),
            upload("light_1.png", [240, 240, 240]),
        ]))
        .await
        .unwrap();

        let err = mgr.train_from(DatasetSource::Uploads(Vec::new())).await.unwrap_err();
        assert!(matches!(err, LifecycleError::EmptyDataset(_)));
        let broken = UploadedFile { filename: "pear_1.png".into(), bytes: b"not an image".to_vec() };
        let err = mgr.train_from(DatasetSource::Uploads(vec![broken])).await.unwrap_err();
        assert!(matches!(err, LifecycleError::EmptyDataset(_)));

        assert_eq!(mgr.state(), ModelState::Ready);
        assert_eq!(mgr.status().labels, vec!["dark", "light"]);
        let service = InferenceService::new(mgr.clone());
        let prediction = service.predict(png_bytes(8, 8, [245, 245, 245])).await.unwrap();
        assert_eq!(prediction.label, "light");
    }

    #[tokio::test]
    async fn test_new_restores_interrupted_swap() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        mgr.train_from(DatasetSource::Uploads(vec![upload("apple_1.png", [1, 2, 3])]))
            .await
            .unwrap();
        std::fs::rename(mgr.store().root(), mgr.store().previous_dir()).unwrap();
        assert!(!mgr.store().exists());

        let restarted = manager(tmp.path(), StubEngine::default());
        assert!(restarted.store().exists());
        assert_eq!(restarted.load_persisted().await.unwrap(), vec!["apple"]);
        assert_eq!(restarted.state(), ModelState::Ready);
    }

    #[tokio::test]
    async fn test_export_follows_persisted_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), StubEngine::default());
        assert!(matches!(
            mgr.exporter().export_to_writer(Vec::new()),
            Err(LifecycleError::ArtifactNotFound(_))
        ));

        let files = vec![UploadedFile { filename: "apple_1.png".into(), bytes: png_bytes(4, 4, [1, 2, 3]) }];
        mgr.train_from(DatasetSource::Uploads(files)).await.unwrap();

        let archive = mgr.exporter().export_to_writer(Vec::new()).unwrap();
        assert!(!archive.is_empty());
    }
}
