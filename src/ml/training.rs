//! Burnによるエンジン実装（学習・推論・保存）

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, ElementConversion},
};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::ml::engine::{
    argmax, split_indices, ArchitectureDescriptor, ClassifierEngine, ClassifierModel, CompileSpec,
    EpochMetrics, FitConfig,
};
use crate::ml::ml_model::{images_to_tensor, init_classifier, targets_to_tensor, FruitClassifier};
use crate::ml::preprocess::ImageTensor;

/// 推論用バックエンド（CPU）
pub type InferenceBackend = NdArray<f32>;

/// 学習用バックエンド
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// モデルファイル名（拡張子はレコーダーが付ける）
const MODEL_FILE_STEM: &str = "model";

/// Burnエンジン
#[derive(Debug, Clone, Default)]
pub struct BurnEngine {
    device: NdArrayDevice,
}

impl BurnEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClassifierEngine for BurnEngine {
    fn build(&self, architecture: &ArchitectureDescriptor) -> Result<Box<dyn ClassifierModel>> {
        let model = init_classifier::<TrainingBackend>(architecture, &self.device)?;
        debug!("モデルを構築しました: {} パラメータ", model.num_params());
        Ok(Box::new(BurnClassifier::new(model, self.device.clone())))
    }

    fn load(&self, dir: &Path, architecture: &ArchitectureDescriptor) -> Result<Box<dyn ClassifierModel>> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let model = init_classifier::<TrainingBackend>(architecture, &self.device)?
            .load_file(dir.join(MODEL_FILE_STEM), &recorder, &self.device)
            .map_err(|e| anyhow!("Failed to load model weights: {:?}", e))?;
        Ok(Box::new(BurnClassifier::new(model, self.device.clone())))
    }
}

/// 学習・推論可能なBurnモデル
pub struct BurnClassifier {
    model: Mutex<FruitClassifier<TrainingBackend>>,
    compiled: Option<CompileSpec>,
    device: NdArrayDevice,
}

impl BurnClassifier {
    fn new(model: FruitClassifier<TrainingBackend>, device: NdArrayDevice) -> Self {
        Self {
            model: Mutex::new(model),
            compiled: None,
            device,
        }
    }
}

/// 1パス分の損失と正解数
struct PassStats {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl PassStats {
    fn new() -> Self {
        Self { loss_sum: 0.0, correct: 0, total: 0 }
    }

    /// バッチ平均の損失と、ロジットから数えた正解数を加算
    fn add(&mut self, loss: f64, logits: Vec<f32>, targets: &[usize]) {
        let num_classes = logits.len() / targets.len().max(1);
        for (row, &target) in logits.chunks(num_classes.max(1)).zip(targets) {
            if argmax(row) == Some(target) {
                self.correct += 1;
            }
        }
        self.loss_sum += loss * targets.len() as f64;
        self.total += targets.len();
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.total.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.total.max(1) as f64
    }
}

fn logits_to_vec<B: Backend>(logits: burn::tensor::Tensor<B, 2>) -> Result<Vec<f32>> {
    logits
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read model output: {:?}", e))
}

impl ClassifierModel for BurnClassifier {
    fn compile(&mut self, spec: &CompileSpec) -> Result<()> {
        if spec.learning_rate() <= 0.0 {
            bail!("learning rate must be positive");
        }
        self.compiled = Some(*spec);
        Ok(())
    }

    fn fit(
        &mut self,
        inputs: &[ImageTensor],
        labels: &[usize],
        config: &FitConfig,
        on_epoch: &mut dyn FnMut(&EpochMetrics),
    ) -> Result<Vec<EpochMetrics>> {
        let spec = self
            .compiled
            .ok_or_else(|| anyhow!("model must be compiled before fit"))?;
        if inputs.len() != labels.len() {
            bail!("{} inputs but {} labels", inputs.len(), labels.len());
        }
        if inputs.is_empty() {
            bail!("no training samples");
        }
        let batch_size = config.batch_size.max(1);
        let learning_rate = spec.learning_rate();

        let (train_indices, val_indices) = split_indices(inputs.len(), config.validation_split, config.seed);
        debug!(
            "学習データ: {} 枚, 検証データ: {} 枚",
            train_indices.len(),
            val_indices.len()
        );

        let slot = self
            .model
            .get_mut()
            .map_err(|_| anyhow!("model lock poisoned"))?;
        let mut model = slot.clone();
        let mut optimizer = AdamConfig::new().init::<TrainingBackend, FruitClassifier<TrainingBackend>>();
        let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed);
        let mut history = Vec::with_capacity(config.epochs);

        for epoch in 1..=config.epochs {
            let mut order = train_indices.clone();
            order.shuffle(&mut rng);

            let mut train = PassStats::new();
            for chunk in order.chunks(batch_size) {
                let images: Vec<&ImageTensor> = chunk.iter().map(|&i| &inputs[i]).collect();
                let targets: Vec<usize> = chunk.iter().map(|&i| labels[i]).collect();

                let batch = images_to_tensor::<TrainingBackend>(&images, &self.device);
                let target_tensor = targets_to_tensor::<TrainingBackend>(&targets, &self.device);
                let (loss, logits) = model.forward_loss(batch, target_tensor);

                let loss_value: f64 = loss.clone().into_scalar().elem();
                train.add(loss_value, logits_to_vec(logits)?, &targets);

                // 逆伝播とパラメータ更新
                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(learning_rate, model, grads);
            }

            let (val_loss, val_accuracy) = if val_indices.is_empty() {
                (None, None)
            } else {
                let valid_model = model.valid();
                let mut val = PassStats::new();
                for chunk in val_indices.chunks(batch_size) {
                    let images: Vec<&ImageTensor> = chunk.iter().map(|&i| &inputs[i]).collect();
                    let targets: Vec<usize> = chunk.iter().map(|&i| labels[i]).collect();

                    let batch = images_to_tensor::<InferenceBackend>(&images, &self.device);
                    let target_tensor = targets_to_tensor::<InferenceBackend>(&targets, &self.device);
                    let (loss, logits) = valid_model.forward_loss(batch, target_tensor);

                    let loss_value: f64 = loss.into_scalar().elem();
                    val.add(loss_value, logits_to_vec(logits)?, &targets);
                }
                (Some(val.loss()), Some(val.accuracy()))
            };

            let metrics = EpochMetrics {
                epoch,
                loss: train.loss(),
                accuracy: train.accuracy(),
                val_loss,
                val_accuracy,
            };
            if !metrics.loss.is_finite() {
                bail!("training diverged at epoch {} (loss = {})", epoch, metrics.loss);
            }
            on_epoch(&metrics);
            history.push(metrics);
        }

        *slot = model;
        Ok(history)
    }

    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        let model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned"))?
            .clone()
            .valid();

        let batch = images_to_tensor::<InferenceBackend>(&[input], &self.device);
        let probabilities = model.forward_probabilities(batch);
        logits_to_vec(probabilities)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned"))?
            .clone();

        // f32精度で保存
        model
            .save_file(dir.join(MODEL_FILE_STEM), &DefaultFileRecorder::<FullPrecisionSettings>::new())
            .map_err(|e| anyhow!("Failed to save model: {:?}", e))
    }
}
