//! 画像分類CNN（Burn）
//!
//! `ArchitectureDescriptor` の構成どおりに組み立てる。
//!
//! # アーキテクチャ（標準構成）
//! - {Conv 3x3 (same padding) + ReLU + MaxPool 2x2 + Dropout} x 2段
//! - Flatten
//! - FC: d -> 128 + ReLU + Dropout
//! - FC: 128 -> num_classes
//! - Softmax (推論時)

use anyhow::{bail, Result};
use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
};

use crate::ml::engine::ArchitectureDescriptor;
use crate::ml::preprocess::{ImageTensor, CHANNELS, IMAGE_SIZE};

/// Conv + ReLU + MaxPool + Dropout
#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> ConvStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);
        self.dropout.forward(x)
    }
}

/// FC + ReLU + Dropout
#[derive(Module, Debug)]
pub struct DenseStage<B: Backend> {
    linear: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> DenseStage<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let x = self.activation.forward(x);
        self.dropout.forward(x)
    }
}

/// 画像分類用CNNモデル
#[derive(Module, Debug)]
pub struct FruitClassifier<B: Backend> {
    conv_stages: Vec<ConvStage<B>>,
    hidden: Vec<DenseStage<B>>,
    output: Linear<B>,
}

/// 構成からモデルを初期化
pub fn init_classifier<B: Backend>(
    architecture: &ArchitectureDescriptor,
    device: &B::Device,
) -> Result<FruitClassifier<B>> {
    let [height, width, channels] = architecture.input_shape;
    if [height, width, channels] != [IMAGE_SIZE, IMAGE_SIZE, CHANNELS] {
        bail!(
            "unsupported input shape {:?} (expected [{}, {}, {}])",
            architecture.input_shape,
            IMAGE_SIZE,
            IMAGE_SIZE,
            CHANNELS
        );
    }
    if architecture.num_classes == 0 {
        bail!("architecture needs at least one output class");
    }
    if architecture.flattened_features() == 0 {
        bail!("input size {}x{} is too small for the pooling stages", height, width);
    }

    let mut in_channels = channels;
    let mut conv_stages = Vec::with_capacity(architecture.conv_stages.len());
    for stage in &architecture.conv_stages {
        let pool = stage.pool_size.max(1);
        conv_stages.push(ConvStage {
            conv: Conv2dConfig::new([in_channels, stage.filters], [stage.kernel_size, stage.kernel_size])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            pool: MaxPool2dConfig::new([pool, pool]).with_strides([pool, pool]).init(),
            dropout: DropoutConfig::new(stage.dropout).init(),
            activation: Relu::new(),
        });
        in_channels = stage.filters;
    }

    let mut features = architecture.flattened_features();
    let mut hidden = Vec::with_capacity(architecture.hidden.len());
    for dense in &architecture.hidden {
        hidden.push(DenseStage {
            linear: LinearConfig::new(features, dense.units).init(device),
            dropout: DropoutConfig::new(dense.dropout).init(),
            activation: Relu::new(),
        });
        features = dense.units;
    }

    Ok(FruitClassifier {
        conv_stages,
        hidden,
        output: LinearConfig::new(features, architecture.num_classes).init(device),
    })
}

impl<B: Backend> FruitClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, 64, 64]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let mut x = images;
        for stage in &self.conv_stages {
            x = stage.forward(x);
        }

        // Flatten
        let [_, c, h, w] = x.dims();
        let mut x = x.reshape([batch_size, c * h * w]);

        for stage in &self.hidden {
            x = stage.forward(x);
        }

        self.output.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算
    ///
    /// # 戻り値
    /// - (損失, ロジット)
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets);
        (loss, output)
    }
}

/// HWC画像の集合をバッチテンソル [N, 3, H, W] に変換
pub fn images_to_tensor<B: Backend>(
    images: &[&ImageTensor],
    device: &B::Device,
) -> Tensor<B, 4> {
    let batch_size = images.len();
    let mut all_pixels = Vec::with_capacity(batch_size * ImageTensor::LEN);
    for image in images {
        all_pixels.extend_from_slice(image.as_slice());
    }

    // 1回の転送でバッチ全体を送る
    Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
        .reshape([batch_size, IMAGE_SIZE, IMAGE_SIZE, CHANNELS])
        .permute([0, 3, 1, 2])
}

/// クラスインデックスを教師テンソルに変換
pub fn targets_to_tensor<B: Backend>(targets: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let targets: Vec<i64> = targets.iter().map(|&t| t as i64).collect();
    Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device)
}
