//! モデル推論機能

use anyhow::anyhow;
use std::path::Path;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, ElementConversion, Tensor},
};

use crate::error::{ArtifactKind, PipelineError, Result};
use crate::ml::training::discover_classes;
use crate::ml::{load_and_normalize_image, ModelConfig, SpectrogramCnn};
use crate::model::{load_model_with_metadata, print_metadata_info, AppConfig, InferenceConfig};

/// 単一画像の推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub label: String,
    pub class_index: usize,
}

/// 推論エンジン
pub struct Predictor<B: Backend> {
    model: SpectrogramCnn<B>,
    config: InferenceConfig,
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> Predictor<B> {
    /// チェックポイントを読み込んで推論エンジンを初期化
    ///
    /// クラスラベルと入力サイズはチェックポイントのメタデータから復元します。
    pub fn load(app_config: &AppConfig, device: &B::Device) -> Result<Self> {
        let checkpoint_path = app_config.checkpoint_path();
        Self::load_from(&checkpoint_path, app_config.model.dropout, device)
    }

    fn load_from(checkpoint_path: &Path, dropout: f64, device: &B::Device) -> Result<Self> {
        if !checkpoint_path.is_file() {
            return Err(PipelineError::MissingArtifact {
                kind: ArtifactKind::Checkpoint,
                path: checkpoint_path.to_path_buf(),
            });
        }

        let (metadata, model_binary) = load_model_with_metadata(checkpoint_path)?;
        print_metadata_info(&metadata);
        let config = InferenceConfig::from_metadata(&metadata);

        // ドロップアウトは推論バックエンドでは恒等写像
        let image_size = config.model_input_size as usize;
        let model_config = ModelConfig::new(metadata.num_classes())
            .with_dropout(dropout)
            .with_image_size(image_size);
        model_config.validate()?;

        let model = model_config.init::<B>(device);

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, model_binary, device)
            .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        Ok(Self {
            model,
            config,
            device: device.clone(),
            image_size,
        })
    }

    /// 単一画像を分類
    pub fn predict(&self, image_path: &Path) -> Result<PredictionResult> {
        if !image_path.is_file() {
            return Err(PipelineError::MissingArtifact {
                kind: ArtifactKind::Image,
                path: image_path.to_path_buf(),
            });
        }

        let image_data = load_and_normalize_image(image_path, self.image_size)?;
        let size = self.image_size;

        // [1, 1, S, S]
        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([1, 1, size, size]);

        let (predicted, _) = self.model.predict(tensor);
        let class_index = predicted.reshape([1]).into_scalar().elem::<i64>() as usize;

        let label = self
            .config
            .class_index_to_label(class_index)
            .ok_or_else(|| anyhow!("クラスインデックス {} は範囲外です", class_index))?;

        tracing::info!("予測結果: {} (クラス {})", label, class_index);

        Ok(PredictionResult { label, class_index })
    }

    /// 現在の学習ディレクトリのクラス構成がチェックポイントと一致するか
    ///
    /// 一致しない場合は警告を出します。推論は常にチェックポイント側のラベルを使います。
    pub fn class_layout_matches(&self, train_dir: &Path) -> bool {
        let current = match discover_classes(train_dir) {
            Ok(classes) => classes,
            Err(e) => {
                tracing::warn!("クラス構成を確認できません ({}): {}", train_dir.display(), e);
                return false;
            }
        };

        let matches = current == self.config.class_labels;
        if !matches {
            tracing::warn!(
                "現在のクラス構成 [{}] はチェックポイント [{}] と異なります。チェックポイントのラベルを使用します",
                current.join(", "),
                self.config.class_labels.join(", ")
            );
        }
        matches
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}
