//! 機械学習モデルの共通定義
//!
//! スペクトログラム分類用のCNNモデルと、学習・推論で共通の前処理を提供します。

use anyhow::Context;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::imageops::FilterType;

use crate::error::PipelineError;

/// 全結合層の隠れユニット数
const HIDDEN_UNITS: usize = 512;

/// 最終畳み込み層のチャネル数
const FINAL_CHANNELS: usize = 64;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形、8の倍数）
    #[config(default = 128)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 入力サイズとクラス数の前提条件を検証
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.image_size == 0 || self.image_size % 8 != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "model input size must be a positive multiple of 8, got {}",
                self.image_size
            )));
        }
        if self.num_classes == 0 {
            return Err(PipelineError::InvalidConfig(
                "model needs at least one class".to_string(),
            ));
        }
        Ok(())
    }

    /// Flatten後の特徴次元 `64 * (S/8)^2`
    pub fn flatten_dim(&self) -> usize {
        let final_size = self.image_size / 8;
        FINAL_CHANNELS * final_size * final_size
    }

    /// モデルを初期化
    ///
    /// `validate` 済みの設定を前提とします。
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpectrogramCnn<B> {
        let conv = |channels: [usize; 2]| -> Conv2d<B> {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        SpectrogramCnn {
            conv1: conv([1, 16]),
            conv2: conv([16, 32]),
            conv3: conv([32, FINAL_CHANNELS]),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(self.flatten_dim(), HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

/// スペクトログラム分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (padding 1) + ReLU + MaxPool 2x2} x 3層 (1 -> 16 -> 32 -> 64)
/// - Flatten: 64 * (S/8) * (S/8)
/// - FC: -> 512 + ReLU + Dropout
/// - FC: 512 -> num_classes（生のロジット）
#[derive(Module, Debug)]
pub struct SpectrogramCnn<B: Backend> {
    conv1: Conv2d<B>, // 1 -> 16
    conv2: Conv2d<B>, // 16 -> 32
    conv3: Conv2d<B>, // 32 -> 64
    pool: MaxPool2d,  // 2x2, stride 2

    fc1: Linear<B>, // d -> 512
    fc2: Linear<B>, // 512 -> num_classes

    // 自動微分バックエンド上（学習時）のみ有効
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> SpectrogramCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.pool.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv3.forward(x)));

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1);
        (predictions, output)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 画像を読み込んで正規化
///
/// グレースケール化 → `size x size` にリサイズ → `[0, 1]` を平均0.5・標準偏差0.5で
/// 正規化し `[-1, 1]` に変換します。学習と推論で同一の変換を使います。
///
/// # 戻り値
/// - 行優先で平坦化した1チャネル画像
pub fn load_and_normalize_image(path: &std::path::Path, size: usize) -> anyhow::Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("画像の読み込みに失敗: {}", path.display()))?;
    let gray = img
        .grayscale()
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_luma8();

    Ok(gray
        .pixels()
        .map(|p| (p[0] as f32 / 255.0 - 0.5) / 0.5)
        .collect())
}
