//! モデル学習
//!
//! `processed/train` と `processed/validation` の画像フォルダを読み込み、
//! 固定エポック数だけ学習して最終エポックの重みを保存します。

use anyhow::anyhow;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};

use crate::error::{PipelineError, Result};
use crate::ml::{load_and_normalize_image, ModelConfig, SpectrogramCnn};
use crate::model::{save_model_with_metadata, AppConfig, ModelMetadata};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// ディレクトリ直下のクラスフォルダ名（名前順）
///
/// 学習時のクラスインデックスはこの順序で決まります。
pub fn discover_classes(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut class_names = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("Invalid directory name: {}", path.display()))?;
            class_names.push(name.to_string());
        }
    }
    class_names.sort();
    Ok(class_names)
}

/// 画像フォルダ形式のデータセット（パスのリストのみ保持）
pub struct SpectrogramDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
}

impl SpectrogramDataset {
    /// 指定された順序でディレクトリから画像を読み込む
    ///
    /// `class_order` に無いフォルダは無視し、存在しないクラスフォルダはスキップします。
    /// 画像ヘッダを読めないファイルがあればエラーにします。
    pub fn from_directory_with_order(data_dir: &Path, class_order: &[String]) -> anyhow::Result<Self> {
        let mut samples = Vec::new();

        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.exists() {
                continue;
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if is_image_file(&path) {
                    image::image_dimensions(&path)
                        .map_err(|e| anyhow!("画像を読み込めません {}: {}", path.display(), e))?;
                    paths.push(path);
                }
            }
            paths.sort();
            samples.extend(paths.into_iter().map(|p| (p, class_id)));
        }

        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if path.is_dir() && !class_order.iter().any(|c| c == name) {
                    tracing::warn!("学習クラスに無いフォルダを無視します: {}", path.display());
                }
            }
        }

        Ok(Self { samples })
    }

    /// クラスIDごとのサンプル数
    pub fn class_counts(&self) -> HashMap<usize, usize> {
        let mut counts = HashMap::new();
        for (_, label) in &self.samples {
            *counts.entry(*label).or_insert(0) += 1;
        }
        counts
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct SpectrogramItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<SpectrogramItem> for SpectrogramDataset {
    fn get(&self, index: usize) -> Option<SpectrogramItem> {
        let (path, label) = self.samples.get(index)?;
        Some(SpectrogramItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct SpectrogramBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> SpectrogramBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<B, SpectrogramItem, SpectrogramBatch<B>> for SpectrogramBatcher<B> {
    fn batch(&self, items: Vec<SpectrogramItem>, _device: &B::Device) -> SpectrogramBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match load_and_normalize_image(&item.path, size) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    // データセット構築時に検証済み。途中で壊れた場合のみここに来る
                    tracing::warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        SpectrogramBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct SpectrogramBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<SpectrogramBatch<B>, ClassificationOutput<B>> for SpectrogramCnn<B> {
    fn step(&self, batch: SpectrogramBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<SpectrogramBatch<B>, ClassificationOutput<B>> for SpectrogramCnn<B> {
    fn step(&self, batch: SpectrogramBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// バッチ内の正解数とサンプル数
fn count_correct<B: Backend>(output: &ClassificationOutput<B>) -> (usize, usize) {
    let [n] = output.targets.dims();
    let hits = output
        .output
        .clone()
        .argmax(1)
        .reshape([n])
        .equal(output.targets.clone())
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    (hits as usize, n)
}

/// 1エポック分の指標
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    /// 検証データが0件の場合はNone
    pub valid_accuracy: Option<f64>,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub class_labels: Vec<String>,
    pub epochs: Vec<EpochMetrics>,
    pub num_train_samples: usize,
    pub num_valid_samples: usize,
    pub checkpoint_path: PathBuf,
    pub history_path: PathBuf,
}

impl TrainingReport {
    pub fn final_metrics(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// モデルの重みをバイト列に変換
pub fn model_to_bytes<B: Backend>(model: SpectrogramCnn<B>) -> anyhow::Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::record(&recorder, model.into_record(), ())
        .map_err(|e| anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// モデル学習を実行
///
/// デバイスは呼び出し側で一度だけ選択して渡します。
pub fn train_model<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<TrainingReport> {
    let train_dir = config.train_dir();
    let valid_dir = config.validation_dir();

    if !train_dir.is_dir() || !valid_dir.is_dir() {
        return Err(PipelineError::MissingDataset(config.paths.processed_root.clone()));
    }

    let class_labels = discover_classes(&train_dir)?;
    if class_labels.is_empty() {
        return Err(PipelineError::MissingDataset(train_dir));
    }
    tracing::info!("検出クラス ({}個): {}", class_labels.len(), class_labels.join(", "));

    let dataset_train = SpectrogramDataset::from_directory_with_order(&train_dir, &class_labels)?;
    let dataset_valid = SpectrogramDataset::from_directory_with_order(&valid_dir, &class_labels)?;

    let train_counts = dataset_train.class_counts();
    let valid_counts = dataset_valid.class_counts();
    for (class_id, class_name) in class_labels.iter().enumerate() {
        let n_train = train_counts.get(&class_id).copied().unwrap_or(0);
        let n_valid = valid_counts.get(&class_id).copied().unwrap_or(0);
        tracing::info!("  クラス {}: {} (学習 {} 枚, 検証 {} 枚)", class_id, class_name, n_train, n_valid);
        if n_train == 0 {
            return Err(PipelineError::EmptyClass(class_name.clone()));
        }
    }

    let num_train_samples = dataset_train.len();
    let num_valid_samples = dataset_valid.len();
    if num_valid_samples == 0 {
        tracing::warn!("検証データが0枚です。検証精度は算出されません");
    }

    let image_size = config.spectrogram.image_size as usize;
    let model_config = ModelConfig::new(class_labels.len())
        .with_dropout(config.model.dropout)
        .with_image_size(image_size);
    model_config.validate()?;

    let training = &config.training;
    let batcher_train = SpectrogramBatcher::<B>::new(device.clone(), image_size);
    let batcher_valid = SpectrogramBatcher::<B::InnerBackend>::new(device.clone(), image_size);

    // 学習側はエポックごとに並び替え、検証側は固定順
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(training.batch_size)
        .shuffle(rand::random::<u64>())
        .num_workers(0)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(training.batch_size)
        .num_workers(0)
        .build(dataset_valid);

    let mut model = model_config.init::<B>(device);
    let mut optimizer = AdamConfig::new().init::<B, SpectrogramCnn<B>>();

    tracing::info!(
        "学習を開始します: {} エポック, バッチサイズ {}, 学習率 {}",
        training.num_epochs,
        training.batch_size,
        training.learning_rate
    );

    let mut epochs = Vec::with_capacity(training.num_epochs);
    for epoch in 1..=training.num_epochs {
        // 学習パス
        let mut loss_sum = 0.0f64;
        let mut num_batches = 0usize;
        for batch in dataloader_train.iter() {
            let output = TrainStep::step(&model, batch);
            loss_sum += output.item.loss.clone().into_scalar().elem::<f64>();
            num_batches += 1;

            model = optimizer.step(training.learning_rate, model, output.grads);
        }
        let train_loss = if num_batches > 0 {
            loss_sum / num_batches as f64
        } else {
            0.0
        };

        // 検証パス（勾配なし・ドロップアウトなし）
        let model_valid = model.valid();
        let mut correct = 0usize;
        let mut total = 0usize;
        for batch in dataloader_valid.iter() {
            let output = ValidStep::step(&model_valid, batch);
            let (hits, n) = count_correct(&output);
            correct += hits;
            total += n;
        }
        let valid_accuracy = (total > 0).then(|| correct as f64 / total as f64);

        match valid_accuracy {
            Some(acc) => tracing::info!(
                "エポック [{}/{}] | 学習損失: {:.4} | 検証精度: {:.2}%",
                epoch,
                training.num_epochs,
                train_loss,
                acc * 100.0
            ),
            None => tracing::info!(
                "エポック [{}/{}] | 学習損失: {:.4} | 検証精度: n/a",
                epoch,
                training.num_epochs,
                train_loss
            ),
        }

        epochs.push(EpochMetrics {
            epoch,
            train_loss,
            valid_accuracy,
        });
    }

    tracing::info!("学習完了");

    // 最終エポックの重みのみ保存（既存チェックポイントは上書き）
    let checkpoint_path = config.checkpoint_path();
    let history_path = config.history_path();
    let last = epochs.last().cloned();
    let metadata = ModelMetadata::new(
        class_labels.clone(),
        config.spectrogram.image_size,
        training.num_epochs as u32,
        training.batch_size as u32,
        training.learning_rate,
        last.as_ref().map_or(0.0, |m| m.train_loss),
        last.as_ref().and_then(|m| m.valid_accuracy),
    );

    let model_binary = model_to_bytes(model.valid())?;
    save_model_with_metadata(&checkpoint_path, &metadata, &model_binary)?;
    write_history(&history_path, &epochs)?;

    tracing::info!("モデルを保存しました: {}", checkpoint_path.display());

    Ok(TrainingReport {
        class_labels,
        epochs,
        num_train_samples,
        num_valid_samples,
        checkpoint_path,
        history_path,
    })
}

/// エポックごとの指標をCSVに書き出す
fn write_history(path: &Path, epochs: &[EpochMetrics]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    for metrics in epochs {
        writer.serialize(metrics)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{GrayImage, Luma};

    type TestBackend = Autodiff<NdArray>;

    fn write_image(path: &Path, level: u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_pixel(16, 16, Luma([level])).save(path).unwrap();
    }

    fn small_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::rooted_at(root);
        config.device_type = crate::model::DeviceType::Cpu;
        config.spectrogram.image_size = 16;
        config.training.num_epochs = 2;
        config.training.batch_size = 4;
        config
    }

    #[test]
    fn test_discover_classes_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["dog", "bird", "cat"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        assert_eq!(discover_classes(dir.path()).unwrap(), vec!["bird", "cat", "dog"]);
    }

    #[test]
    fn test_dataset_labels_follow_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("cat/a.png"), 10);
        write_image(&dir.path().join("dog/b.png"), 200);
        write_image(&dir.path().join("dog/c.png"), 200);
        std::fs::write(dir.path().join("dog/notes.txt"), b"x").unwrap();

        let order = vec!["dog".to_string(), "cat".to_string()];
        let dataset = SpectrogramDataset::from_directory_with_order(dir.path(), &order).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get(0).unwrap().label, 0);
        assert_eq!(dataset.get(2).unwrap().label, 1);
        assert!(dataset.get(3).is_none());
        assert_eq!(dataset.class_counts()[&0], 2);
    }

    #[test]
    fn test_corrupt_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cat")).unwrap();
        std::fs::write(dir.path().join("cat/bad.png"), b"not a png").unwrap();
        let order = vec!["cat".to_string()];
        assert!(SpectrogramDataset::from_directory_with_order(dir.path(), &order).is_err());
    }

    #[test]
    fn test_batcher_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x/a.png");
        write_image(&path, 255);
        let device = NdArrayDevice::Cpu;
        let batcher = SpectrogramBatcher::<NdArray>::new(device, 16);
        let items = vec![
            SpectrogramItem { path: path.clone(), label: 1 },
            SpectrogramItem { path, label: 0 },
        ];
        let batch = batcher.batch(items, &device);
        assert_eq!(batch.images.dims(), [2, 1, 16, 16]);
        assert_eq!(batch.targets.dims(), [2]);
    }

    #[test]
    fn test_train_and_valid_steps() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(2).with_image_size(8).init::<TestBackend>(&device);
        let batch = SpectrogramBatch {
            images: Tensor::<TestBackend, 4>::zeros([3, 1, 8, 8], &device),
            targets: Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 1].as_slice(), &device),
        };

        let output = TrainStep::step(&model, batch.clone());
        assert!(output.item.loss.into_scalar().elem::<f64>().is_finite());

        let model_valid = model.valid();
        let valid_batch = SpectrogramBatch {
            images: Tensor::<NdArray, 4>::zeros([3, 1, 8, 8], &device),
            targets: Tensor::<NdArray, 1, Int>::from_ints([0, 1, 1].as_slice(), &device),
        };
        let output = ValidStep::step(&model_valid, valid_batch);
        let (hits, n) = count_correct(&output);
        assert_eq!(n, 3);
        assert!(hits <= 3);
    }

    #[test]
    fn test_missing_dataset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let result = train_model::<TestBackend>(&config, &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(PipelineError::MissingDataset(_))));
        assert!(!config.checkpoint_path().exists());
    }

    #[test]
    fn test_empty_class_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_image(&config.train_dir().join("cat/a.png"), 0);
        std::fs::create_dir_all(config.train_dir().join("dog")).unwrap();
        std::fs::create_dir_all(config.validation_dir()).unwrap();

        let result = train_model::<TestBackend>(&config, &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(PipelineError::EmptyClass(ref c)) if c == "dog"));
    }

    #[test]
    fn test_training_writes_checkpoint_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        for i in 0..4 {
            write_image(&config.train_dir().join(format!("cat/{}.png", i)), 0);
            write_image(&config.train_dir().join(format!("dog/{}.png", i)), 255);
        }
        write_image(&config.validation_dir().join("cat/v.png"), 0);
        write_image(&config.validation_dir().join("dog/v.png"), 255);

        let report = train_model::<TestBackend>(&config, &NdArrayDevice::Cpu).unwrap();
        assert_eq!(report.class_labels, vec!["cat", "dog"]);
        assert_eq!(report.epochs.len(), 2);
        assert_eq!(report.num_train_samples, 8);
        assert_eq!(report.num_valid_samples, 2);
        assert!(report.epochs.iter().all(|m| m.train_loss.is_finite()));
        assert!(report.final_metrics().unwrap().valid_accuracy.is_some());

        let metadata = crate::model::load_metadata(&report.checkpoint_path).unwrap();
        assert_eq!(metadata.class_labels, vec!["cat", "dog"]);
        assert_eq!(metadata.image_size, 16);

        let history = std::fs::read_to_string(&report.history_path).unwrap();
        let mut lines = history.lines();
        assert_eq!(lines.next(), Some("epoch,train_loss,valid_accuracy"));
        assert_eq!(lines.count(), 2);
    }

    #[test]
    fn test_zero_validation_samples_gives_no_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.training.num_epochs = 1;
        write_image(&config.train_dir().join("cat/a.png"), 0);
        write_image(&config.train_dir().join("dog/b.png"), 255);
        std::fs::create_dir_all(config.validation_dir().join("cat")).unwrap();

        let report = train_model::<TestBackend>(&config, &NdArrayDevice::Cpu).unwrap();
        assert_eq!(report.num_valid_samples, 0);
        assert_eq!(report.epochs[0].valid_accuracy, None);
    }
}
