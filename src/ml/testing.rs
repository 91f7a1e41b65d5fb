//! テスト用の決定的なエンジン
//!
//! クラスごとの平均輝度を覚えるだけの分類器。実際のネットワークは動かさない。

use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};

use crate::ml::engine::{
    ArchitectureDescriptor, ClassifierEngine, ClassifierModel, CompileSpec, EpochMetrics, FitConfig,
};
use crate::ml::preprocess::ImageTensor;

const WEIGHTS_FILE: &str = "weights.json";

/// fit() の開始を通知し、解放されるまで待たせる
pub struct FitGate {
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl FitGate {
    /// (gate, fit開始の受信側, 解放の送信側)
    pub fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let gate = Arc::new(Self {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        (gate, entered_rx, release_tx)
    }

    fn wait(&self) {
        self.entered.lock().unwrap().send(()).ok();
        self.release.lock().unwrap().recv().ok();
    }
}

/// クローン同士で失敗フラグを共有する
#[derive(Clone, Default)]
pub struct StubEngine {
    gate: Option<Arc<FitGate>>,
    fail_fit: Arc<AtomicBool>,
}

impl StubEngine {
    pub fn gated(gate: Arc<FitGate>) -> Self {
        Self { gate: Some(gate), ..Self::default() }
    }

    pub fn failing() -> Self {
        let engine = Self::default();
        engine.set_failing(true);
        engine
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_fit.store(failing, Ordering::SeqCst);
    }
}

impl ClassifierEngine for StubEngine {
    fn build(&self, architecture: &ArchitectureDescriptor) -> Result<Box<dyn ClassifierModel>> {
        Ok(Box::new(StubModel {
            centroids: vec![0.5; architecture.num_classes],
            compiled: false,
            gate: self.gate.clone(),
            fail_fit: self.fail_fit.load(Ordering::SeqCst),
        }))
    }

    fn load(&self, dir: &Path, architecture: &ArchitectureDescriptor) -> Result<Box<dyn ClassifierModel>> {
        let json = std::fs::read_to_string(dir.join(WEIGHTS_FILE)).context("missing weights")?;
        let centroids: Vec<f32> = serde_json::from_str(&json)?;
        if centroids.len() != architecture.num_classes {
            bail!("weights have {} classes, expected {}", centroids.len(), architecture.num_classes);
        }
        Ok(Box::new(StubModel { centroids, compiled: true, gate: None, fail_fit: false }))
    }
}

pub struct StubModel {
    centroids: Vec<f32>,
    compiled: bool,
    gate: Option<Arc<FitGate>>,
    fail_fit: bool,
}

impl ClassifierModel for StubModel {
    fn compile(&mut self, _spec: &CompileSpec) -> Result<()> {
        self.compiled = true;
        Ok(())
    }

    fn fit(
        &mut self,
        inputs: &[ImageTensor],
        labels: &[usize],
        config: &FitConfig,
        on_epoch: &mut dyn FnMut(&EpochMetrics),
    ) -> Result<Vec<EpochMetrics>> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if !self.compiled {
            bail!("model must be compiled before fit");
        }
        if self.fail_fit {
            return Err(anyhow!("simulated engine failure"));
        }

        let mut sums = vec![0.0f32; self.centroids.len()];
        let mut counts = vec![0usize; self.centroids.len()];
        for (input, &label) in inputs.iter().zip(labels) {
            sums[label] += input.mean();
            counts[label] += 1;
        }
        for (i, centroid) in self.centroids.iter_mut().enumerate() {
            if counts[i] > 0 {
                *centroid = sums[i] / counts[i] as f32;
            }
        }

        let mut history = Vec::new();
        for epoch in 1..=config.epochs {
            let metrics = EpochMetrics {
                epoch,
                loss: 1.0 / epoch as f64,
                accuracy: 1.0 - 0.5 / epoch as f64,
                val_loss: Some(1.2 / epoch as f64),
                val_accuracy: Some(1.0 - 0.6 / epoch as f64),
            };
            on_epoch(&metrics);
            history.push(metrics);
        }
        Ok(history)
    }

    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        let mean = input.mean();
        let scores: Vec<f32> = self
            .centroids
            .iter()
            .map(|c| (-(mean - c).abs() * 10.0).exp())
            .collect();
        let total: f32 = scores.iter().sum();
        Ok(scores.into_iter().map(|s| s / total).collect())
    }

    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(WEIGHTS_FILE), serde_json::to_string(&self.centroids)?)?;
        Ok(())
    }
}
